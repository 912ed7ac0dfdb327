//! # Catalog Entities
//!
//! The persisted catalog: brand groups, models, store listings and their
//! append-only price history.
//!
//! Every entity keeps the JSON object it was read from. Writing a catalog
//! back starts from that object and only replaces the keys whose values
//! the pipeline owns, in place, so fields owned by other consumers keep
//! their position and a listing nobody touched is written back verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key convention of a persisted document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogNaming {
    /// `brand`, `model`, `stores`, `store`, `price_selector`, `history`, `timestamp`, `price`
    #[default]
    English,
    /// `marca`, `modelo`, `tiendas`, `tienda`, `selector_precio`, `historial_precios`, `fecha`, `precio`
    Spanish,
}

impl CatalogNaming {
    const ALL: [Self; 2] = [Self::English, Self::Spanish];

    /// Convention of the document whose first entry is `entry`
    fn detect(entry: &Value) -> Self {
        let spanish = [Field::Brand, Field::Model, Field::Models, Field::Stores]
            .iter()
            .any(|field| entry.get(field.key(Self::Spanish)).is_some());
        if spanish { Self::Spanish } else { Self::English }
    }
}

/// Modelled keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Brand,
    Models,
    Model,
    Stores,
    Store,
    Url,
    PriceSelector,
    History,
    Timestamp,
    Price,
}

impl Field {
    const fn key(self, naming: CatalogNaming) -> &'static str {
        use CatalogNaming::{English, Spanish};
        match (self, naming) {
            (Self::Brand, English) => "brand",
            (Self::Brand, Spanish) => "marca",
            (Self::Models, English) => "models",
            (Self::Models, Spanish) => "modelos",
            (Self::Model, English) => "model",
            (Self::Model, Spanish) => "modelo",
            (Self::Stores, English) => "stores",
            (Self::Stores, Spanish) => "tiendas",
            (Self::Store, English) => "store",
            (Self::Store, Spanish) => "tienda",
            (Self::Url, _) => "url",
            (Self::PriceSelector, English) => "price_selector",
            (Self::PriceSelector, Spanish) => "selector_precio",
            (Self::History, English) => "history",
            (Self::History, Spanish) => "historial_precios",
            (Self::Timestamp, English) => "timestamp",
            (Self::Timestamp, Spanish) => "fecha",
            (Self::Price, English) => "price",
            (Self::Price, Spanish) => "precio",
        }
    }

    /// The key `object` already uses for this field, else the one of `naming`
    fn key_in(self, object: &Map<String, Value>, naming: CatalogNaming) -> &'static str {
        CatalogNaming::ALL
            .into_iter()
            .map(|n| self.key(n))
            .find(|key| object.contains_key(*key))
            .unwrap_or_else(|| self.key(naming))
    }
}

#[derive(Deserialize)]
struct ObservationFields {
    #[serde(alias = "fecha", with = "iso_millis")]
    timestamp: DateTime<Utc>,
    #[serde(default, alias = "precio")]
    price: Option<u64>,
}

#[derive(Deserialize)]
struct ListingFields {
    #[serde(alias = "tienda")]
    store: String,
    url: String,
    #[serde(alias = "selector_precio")]
    price_selector: String,
}

#[derive(Deserialize)]
struct ModelFields {
    #[serde(default, alias = "marca")]
    brand: Option<String>,
    #[serde(alias = "modelo")]
    model: String,
}

#[derive(Deserialize)]
struct GroupFields {
    #[serde(alias = "marca")]
    brand: String,
}

/// One timestamped price sample
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    /// `None` for samples recorded when the price text could not be read
    pub price: Option<u64>,
    /// Persisted object; samples read from a catalog are written back verbatim
    raw: Map<String, Value>,
}

impl Observation {
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, price: u64) -> Self {
        Self {
            timestamp,
            price: Some(price),
            raw: Map::new(),
        }
    }

    fn from_value(value: Value) -> Result<Self, CatalogFormatError> {
        let fields = ObservationFields::deserialize(&value)?;
        Ok(Self {
            timestamp: fields.timestamp,
            price: fields.price,
            raw: into_object(value)?,
        })
    }

    fn to_value(&self, naming: CatalogNaming) -> Value {
        if !self.raw.is_empty() {
            return Value::Object(self.raw.clone());
        }
        let mut object = Map::new();
        object.insert(
            Field::Timestamp.key(naming).to_string(),
            Value::String(iso_millis::format(&self.timestamp)),
        );
        object.insert(Field::Price.key(naming).to_string(), self.price.map_or(Value::Null, Value::from));
        Value::Object(object)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("observation at {attempted} is older than the newest recorded one at {newest}")]
    OutOfOrder {
        attempted: DateTime<Utc>,
        newest: DateTime<Utc>,
    },
}

/// Ordered, append-only price history of a listing.
///
/// There is no way to remove, reorder or modify entries; the only mutation
/// is [`PriceHistory::append`], which refuses observations older than the
/// newest one already recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceHistory(Vec<Observation>);

impl PriceHistory {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Wraps observations as persisted, without reordering them
    #[must_use]
    pub const fn from_observations(observations: Vec<Observation>) -> Self {
        Self(observations)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Observation] {
        &self.0
    }

    /// Most recent observation timestamp, if any
    #[must_use]
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.0.iter().map(|o| o.timestamp).max()
    }

    /// Append one observation, keeping the history monotonic in time.
    pub fn append(&mut self, observation: Observation) -> Result<(), HistoryError> {
        if let Some(newest) = self.newest_timestamp() {
            if observation.timestamp < newest {
                return Err(HistoryError::OutOfOrder {
                    attempted: observation.timestamp,
                    newest,
                });
            }
        }
        self.0.push(observation);
        Ok(())
    }
}

/// A (brand, model, store) triple identifying one listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListingKey {
    pub brand: String,
    pub model: String,
    pub store: String,
}

impl ListingKey {
    pub fn new(brand: impl Into<String>, model: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            model: model.into(),
            store: store.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} @ {}", self.brand, self.model, self.store)
    }
}

/// One store's page for a model, with the locator of its price element
#[derive(Debug, Clone, PartialEq)]
pub struct StoreListing {
    pub store: String,
    pub url: String,
    pub price_selector: String,
    pub history: PriceHistory,
    raw: Map<String, Value>,
}

impl StoreListing {
    pub fn new(store: impl Into<String>, url: impl Into<String>, price_selector: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            url: url.into(),
            price_selector: price_selector.into(),
            history: PriceHistory::new(),
            raw: Map::new(),
        }
    }

    /// Any field of the persisted object, modelled or not
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    fn from_value(value: Value) -> Result<Self, CatalogFormatError> {
        let fields = ListingFields::deserialize(&value)?;
        let mut raw = into_object(value)?;
        let history = take_items(&mut raw, Field::History)?
            .into_iter()
            .map(Observation::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            store: fields.store,
            url: fields.url,
            price_selector: fields.price_selector,
            history: PriceHistory::from_observations(history),
            raw,
        })
    }

    fn to_value(&self, naming: CatalogNaming) -> Value {
        let mut object = self.raw.clone();
        put_text(&mut object, Field::Store, naming, &self.store);
        put_text(&mut object, Field::Url, naming, &self.url);
        put_text(&mut object, Field::PriceSelector, naming, &self.price_selector);
        put_items(
            &mut object,
            Field::History,
            naming,
            self.history.iter().map(|o| o.to_value(naming)).collect(),
        );
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Empty when the model sits in a brand group that does not repeat it
    pub brand: String,
    pub model: String,
    pub stores: Vec<StoreListing>,
    raw: Map<String, Value>,
}

impl Model {
    pub fn new(brand: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            model: model.into(),
            stores: Vec::new(),
            raw: Map::new(),
        }
    }

    /// The model's own brand, falling back to the enclosing group's
    #[must_use]
    pub fn brand_or<'a>(&'a self, group_brand: &'a str) -> &'a str {
        if self.brand.is_empty() { group_brand } else { &self.brand }
    }

    /// Any field of the persisted object, modelled or not
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    fn from_value(value: Value) -> Result<Self, CatalogFormatError> {
        let fields = ModelFields::deserialize(&value)?;
        let mut raw = into_object(value)?;
        let stores = take_items(&mut raw, Field::Stores)?
            .into_iter()
            .map(StoreListing::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            brand: fields.brand.unwrap_or_default(),
            model: fields.model,
            stores,
            raw,
        })
    }

    fn to_value(&self, naming: CatalogNaming) -> Value {
        let mut object = self.raw.clone();
        put_text(&mut object, Field::Brand, naming, &self.brand);
        put_text(&mut object, Field::Model, naming, &self.model);
        put_items(
            &mut object,
            Field::Stores,
            naming,
            self.stores.iter().map(|l| l.to_value(naming)).collect(),
        );
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrandGroup {
    pub brand: String,
    pub models: Vec<Model>,
    raw: Map<String, Value>,
}

impl BrandGroup {
    pub fn new(brand: impl Into<String>, models: Vec<Model>) -> Self {
        Self {
            brand: brand.into(),
            models,
            raw: Map::new(),
        }
    }

    /// Any field of the persisted object, modelled or not
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    fn from_value(value: Value) -> Result<Self, CatalogFormatError> {
        let fields = GroupFields::deserialize(&value)?;
        let mut raw = into_object(value)?;
        let models = take_items(&mut raw, Field::Models)?
            .into_iter()
            .map(Model::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            brand: fields.brand,
            models,
            raw,
        })
    }

    fn to_value(&self, naming: CatalogNaming) -> Value {
        let mut object = self.raw.clone();
        put_text(&mut object, Field::Brand, naming, &self.brand);
        put_items(
            &mut object,
            Field::Models,
            naming,
            self.models.iter().map(|m| m.to_value(naming)).collect(),
        );
        Value::Object(object)
    }
}

/// Shape of the persisted document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogLayout {
    /// `[{ "brand", "models": [...] }]`
    #[default]
    Grouped,
    /// `[{ "brand", "model", "stores": [...] }]`, one entry per model
    Flat,
}

#[derive(Error, Debug)]
pub enum CatalogFormatError {
    #[error("catalog document must be a JSON array, found {found}")]
    NotAnArray { found: &'static str },

    #[error("catalog entry must be a JSON object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("catalog field `{key}` must be a list, found {found}")]
    NotAList { key: &'static str, found: &'static str },

    #[error("catalog mixes brand groups and bare models (entry {index})")]
    MixedLayout { index: usize },

    #[error("invalid catalog entry: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// The whole tracked catalog, in persisted order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Catalog {
    pub layout: CatalogLayout,
    pub naming: CatalogNaming,
    pub brands: Vec<BrandGroup>,
}

impl Catalog {
    #[must_use]
    pub fn new(layout: CatalogLayout, brands: Vec<BrandGroup>) -> Self {
        Self {
            layout,
            naming: CatalogNaming::default(),
            brands,
        }
    }

    #[must_use]
    pub fn with_naming(mut self, naming: CatalogNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Build a catalog from a parsed document, detecting its layout and key convention
    pub fn from_value(document: Value) -> Result<Self, CatalogFormatError> {
        let Value::Array(entries) = document else {
            return Err(CatalogFormatError::NotAnArray {
                found: json_kind(&document),
            });
        };

        let naming = entries.first().map_or_else(CatalogNaming::default, CatalogNaming::detect);
        let grouped = entries.first().is_none_or(is_brand_group);
        if let Some(index) = entries.iter().position(|e| is_brand_group(e) != grouped) {
            return Err(CatalogFormatError::MixedLayout { index });
        }

        if grouped {
            let brands = entries
                .into_iter()
                .map(BrandGroup::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::new(CatalogLayout::Grouped, brands).with_naming(naming));
        }

        let mut brands: Vec<BrandGroup> = Vec::new();
        for entry in entries {
            let model = Model::from_value(entry)?;
            match brands.last_mut() {
                Some(group) if group.brand == model.brand => group.models.push(model),
                _ => brands.push(BrandGroup::new(model.brand.clone(), vec![model])),
            }
        }
        Ok(Self::new(CatalogLayout::Flat, brands).with_naming(naming))
    }

    /// Render the catalog back into the layout and key convention it was loaded from
    #[must_use]
    pub fn to_value(&self) -> Value {
        let entries = match self.layout {
            CatalogLayout::Grouped => self.brands.iter().map(|g| g.to_value(self.naming)).collect(),
            CatalogLayout::Flat => self
                .brands
                .iter()
                .flat_map(|g| g.models.iter())
                .map(|m| m.to_value(self.naming))
                .collect(),
        };
        Value::Array(entries)
    }

    /// Listing identities in traversal order (brand, then model, then store)
    #[must_use]
    pub fn listing_keys(&self) -> Vec<ListingKey> {
        self.brands
            .iter()
            .flat_map(|group| {
                group.models.iter().flat_map(move |model| {
                    model
                        .stores
                        .iter()
                        .map(move |listing| ListingKey::new(model.brand_or(&group.brand), &model.model, &listing.store))
                })
            })
            .collect()
    }

    #[must_use]
    pub fn listing_count(&self) -> usize {
        self.brands
            .iter()
            .flat_map(|g| g.models.iter())
            .map(|m| m.stores.len())
            .sum()
    }

    #[must_use]
    pub fn find_listing(&self, key: &ListingKey) -> Option<&StoreListing> {
        self.brands.iter().find_map(|group| {
            group
                .models
                .iter()
                .filter(|m| m.brand_or(&group.brand) == key.brand && m.model == key.model)
                .find_map(|m| m.stores.iter().find(|l| l.store == key.store))
        })
    }
}

fn is_brand_group(entry: &Value) -> bool {
    CatalogNaming::ALL
        .iter()
        .any(|naming| entry.get(Field::Models.key(*naming)).is_some())
}

fn into_object(value: Value) -> Result<Map<String, Value>, CatalogFormatError> {
    match value {
        Value::Object(object) => Ok(object),
        other => Err(CatalogFormatError::NotAnObject {
            found: json_kind(&other),
        }),
    }
}

/// Move the items of a list field out of `object`.
///
/// The key stays behind (an emptied array, or `null`) so that its position
/// is kept for the write back.
fn take_items(object: &mut Map<String, Value>, field: Field) -> Result<Vec<Value>, CatalogFormatError> {
    let key = field.key_in(object, CatalogNaming::default());
    match object.get_mut(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(std::mem::take(items)),
        Some(other) => Err(CatalogFormatError::NotAList {
            key,
            found: json_kind(other),
        }),
    }
}

// Empty values never create a key: whatever the persisted object held is left as is.

fn put_text(object: &mut Map<String, Value>, field: Field, naming: CatalogNaming, value: &str) {
    if !value.is_empty() {
        let key = field.key_in(object, naming);
        object.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn put_items(object: &mut Map<String, Value>, field: Field, naming: CatalogNaming, items: Vec<Value>) {
    if !items.is_empty() {
        let key = field.key_in(object, naming);
        object.insert(key.to_string(), Value::Array(items));
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-01-31T12:00:00.000Z`
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    #[must_use]
    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
