//! Core domain model for symbol harvesting: categories, raw and normalized records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "symharvest-core";

pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";
pub const UNKNOWN_EXCHANGE: &str = "UNKNOWN";
pub const DEFAULT_COUNTRY: &str = "Global";
pub const DEFAULT_SECTOR: &str = "N/A";
pub const DEFAULT_INDUSTRY: &str = "N/A";

/// Fixed category enumeration. `Commodities` is known but has no adapter mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Forex,
    Crypto,
    Stocks,
    Bonds,
    Actions,
    Commodities,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CategoryError {
    #[error("unknown category `{0}`")]
    Unknown(String),
    #[error("category `{0}` is disabled")]
    Disabled(Category),
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Forex,
        Category::Crypto,
        Category::Stocks,
        Category::Bonds,
        Category::Actions,
        Category::Commodities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Forex => "forex",
            Category::Crypto => "crypto",
            Category::Stocks => "stocks",
            Category::Bonds => "bonds",
            Category::Actions => "actions",
            Category::Commodities => "commodities",
        }
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, Category::Commodities)
    }

    /// Parses a category name and rejects categories without an adapter mapping.
    pub fn parse_enabled(input: &str) -> Result<Category, CategoryError> {
        let category: Category = input.parse()?;
        category.ensure_enabled()
    }

    pub fn ensure_enabled(self) -> Result<Category, CategoryError> {
        if self.is_enabled() {
            Ok(self)
        } else {
            Err(CategoryError::Disabled(self))
        }
    }

    pub fn asset_type(self) -> &'static str {
        match self {
            Category::Forex => "forex",
            Category::Crypto => "cryptocurrency",
            Category::Stocks => "stock",
            Category::Bonds => "bond",
            Category::Actions => "equity",
            Category::Commodities => "commodity",
        }
    }

    pub fn currency(self) -> &'static str {
        match self {
            Category::Forex => "USD",
            _ => "USDT",
        }
    }

    pub fn cache_key(self) -> String {
        format!("symbols:{}", self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| CategoryError::Unknown(s.to_string()))
    }
}

/// Source-provided attributes for one candidate row. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub category_tag: Option<String>,
}

impl RawRecord {
    pub fn new(symbol: &str, exchange: &str, description: &str) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            description: Some(description.to_string()),
            exchange: Some(exchange.to_string()),
            category_tag: None,
        }
    }
}

/// Canonical record shape produced by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub identity: String,
    pub display_symbol: String,
    pub name: String,
    pub description: String,
    pub asset_type: String,
    pub category: Category,
    pub exchange: String,
    pub currency: String,
    pub country: String,
    pub sector: String,
    pub industry: String,
    pub order_index: u32,
}

impl NormalizedRecord {
    /// Storage primary key: `exchange:symbol` with every whitespace character removed.
    pub fn stable_id(&self) -> String {
        stable_id(&self.exchange, &self.display_symbol)
    }
}

pub fn identity(symbol: &str, exchange: &str) -> String {
    format!("{symbol}-{exchange}")
}

pub fn stable_id(exchange: &str, symbol: &str) -> String {
    format!("{exchange}:{symbol}")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn text_or(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// Maps a raw record into the canonical schema. Never fails: missing fields get sentinels.
///
/// The returned record carries `order_index = 0`; the harvest session assigns the real one.
pub fn normalize(raw: &RawRecord, category: Category) -> NormalizedRecord {
    let symbol = text_or(raw.symbol.as_deref(), UNKNOWN_SYMBOL);
    let exchange = text_or(raw.exchange.as_deref(), UNKNOWN_EXCHANGE);
    let description = text_or(raw.description.as_deref(), "");

    NormalizedRecord {
        identity: identity(&symbol, &exchange),
        display_symbol: symbol.clone(),
        name: symbol,
        description,
        asset_type: category.asset_type().to_string(),
        category,
        exchange,
        currency: category.currency().to_string(),
        country: DEFAULT_COUNTRY.to_string(),
        sector: DEFAULT_SECTOR.to_string(),
        industry: DEFAULT_INDUSTRY.to_string(),
        order_index: 0,
    }
}

/// Store-side representation of a symbol row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSymbolRow {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub description: String,
    pub asset_type: String,
    pub category: String,
    pub exchange: String,
    pub currency: String,
    pub country: String,
    pub sector: String,
    pub industry: String,
    pub order_index: i64,
    pub last_updated: DateTime<Utc>,
}

/// Why a harvest loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationReason {
    Converged,
    MaxRoundsReached,
    Aborted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationReason::Converged => "converged",
            TerminationReason::MaxRoundsReached => "maxRoundsReached",
            TerminationReason::Aborted => "aborted",
        })
    }
}
