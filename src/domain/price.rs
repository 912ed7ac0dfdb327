//! # Price Normalization
//!
//! Converts the raw text content of a store's price element into a whole
//! number of currency units. The grammar is the Latin-American retail one:
//! `.` groups thousands, `,` marks decimals, and a currency symbol may appear
//! anywhere. Fractional digits are truncated, never rounded.

use thiserror::Error;

/// Reasons a raw price text cannot be turned into a price
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceParseError {
    #[error("price text is empty")]
    Empty,

    #[error("no leading digits in price text '{raw}'")]
    NoDigits { raw: String },

    #[error("negative price text '{raw}'")]
    Negative { raw: String },

    #[error("price '{digits}' does not fit in an unsigned 64-bit integer")]
    OutOfRange { digits: String },
}

/// Locale rules applied when cleaning raw price text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceFormat {
    pub currency_symbols: Vec<String>,
    pub thousands_separator: char,
    pub decimal_separator: char,
}

impl Default for PriceFormat {
    fn default() -> Self {
        Self {
            currency_symbols: vec!["$".to_string()],
            thousands_separator: '.',
            decimal_separator: ',',
        }
    }
}

impl PriceFormat {
    /// Normalize raw element text into a whole-unit price.
    ///
    /// Absent text, or text that is blank once trimmed, is reported as
    /// [`PriceParseError::Empty`] so callers can tell a missing value apart
    /// from a value that is present but unreadable.
    pub fn normalize(&self, raw: Option<&str>) -> Result<u64, PriceParseError> {
        let raw = raw.map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Err(PriceParseError::Empty);
        }

        let mut cleaned = raw.to_string();
        for symbol in &self.currency_symbols {
            cleaned = cleaned.replace(symbol.as_str(), "");
        }

        let cleaned: String = cleaned
            .chars()
            .filter(|c| *c != self.thousands_separator && !c.is_whitespace())
            .map(|c| if c == self.decimal_separator { '.' } else { c })
            .collect();

        let unsigned = match cleaned.strip_prefix('-') {
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => {
                return Err(PriceParseError::Negative { raw: raw.to_string() });
            }
            _ => cleaned.strip_prefix('+').unwrap_or(&cleaned),
        };

        let digits: String = unsigned.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(PriceParseError::NoDigits { raw: raw.to_string() });
        }

        digits
            .parse::<u64>()
            .map_err(|_| PriceParseError::OutOfRange { digits })
    }
}

/// Normalize with the default storefront format (`$`, `.` thousands, `,` decimals)
pub fn normalize_price(raw: Option<&str>) -> Result<u64, PriceParseError> {
    PriceFormat::default().normalize(raw)
}
