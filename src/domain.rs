//! Domain module - Catalog entities and price rules
//!
//! Pure data types and pure functions. Nothing in here performs I/O;
//! persistence and acquisition live in `infrastructure` and `crawling`.

pub mod catalog;
pub mod price;

// Re-export commonly used items for convenience
pub use catalog::{
    BrandGroup, Catalog, CatalogFormatError, CatalogLayout, CatalogNaming, HistoryError, ListingKey, Model, Observation,
    PriceHistory, StoreListing,
};
pub use price::{PriceFormat, PriceParseError, normalize_price};
