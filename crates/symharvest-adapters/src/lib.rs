//! Source adapter contracts, settle/retry policies and the fixture-replay adapter.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use symharvest_core::{Category, RawRecord};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "symharvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("batch failed: {0}")]
    Batch(String),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

/// One stateful session against a paginated or virtualized listing.
///
/// Calls are strictly sequential: `connect`, then rounds of
/// `next_batch` / `frontier_size` / `advance`.
#[async_trait]
pub trait SourceAdapter: Send {
    fn source_id(&self) -> &str;

    /// Delay policy applied after each `advance` before the next batch is read.
    fn settle_policy(&self) -> SettlePolicy;

    async fn connect(&mut self, category: Category) -> Result<(), AdapterError>;

    async fn next_batch(&mut self) -> Result<Vec<RawRecord>, AdapterError>;

    /// Count of items currently exposed by the source.
    async fn frontier_size(&mut self) -> Result<usize, AdapterError>;

    /// Ask the source for more data (scroll, next page, ...).
    async fn advance(&mut self) -> Result<(), AdapterError>;
}

/// Builds a fresh adapter session per category. `Ok(None)` means no adapter mapping.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(
        &self,
        category: Category,
    ) -> Result<Option<Box<dyn SourceAdapter>>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlePolicy {
    None,
    Fixed { millis: u64 },
    Jittered { min_millis: u64, max_millis: u64 },
    Exponential { base_millis: u64, max_millis: u64 },
}

impl Default for SettlePolicy {
    fn default() -> Self {
        SettlePolicy::Jittered {
            min_millis: 1_000,
            max_millis: 2_000,
        }
    }
}

impl SettlePolicy {
    /// `round` is 1-based.
    pub fn delay_for_round(&self, round: u32) -> Duration {
        match *self {
            SettlePolicy::None => Duration::ZERO,
            SettlePolicy::Fixed { millis } => Duration::from_millis(millis),
            SettlePolicy::Jittered {
                min_millis,
                max_millis,
            } => {
                let (lo, hi) = if min_millis <= max_millis {
                    (min_millis, max_millis)
                } else {
                    (max_millis, min_millis)
                };
                Duration::from_millis(rand::rng().random_range(lo..=hi))
            }
            SettlePolicy::Exponential {
                base_millis,
                max_millis,
            } => {
                let shift = round.saturating_sub(1);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                Duration::from_millis(base_millis.saturating_mul(factor).min(max_millis))
            }
        }
    }
}

/// Bounded retry schedule for connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// CSS selectors used to pull rows out of a captured listing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    pub row: String,
    pub symbol: String,
    pub description: String,
    pub exchange: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            row: "tr.listRow".to_string(),
            symbol: "a.tickerName".to_string(),
            description: "sup.tickerDescription".to_string(),
            exchange: "span.exchange".to_string(),
        }
    }
}

/// Recorded harvest session: one snapshot per round, in the order they were captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub category: Category,
    pub captured_from_url: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub selectors: SelectorSet,
    #[serde(default)]
    pub settle: Option<SettlePolicy>,
    pub rounds: Vec<FixtureRound>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureRound {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub html_path: Option<String>,
    /// Overrides the frontier size; defaults to the number of rows in the snapshot.
    #[serde(default)]
    pub frontier: Option<usize>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_html_snapshots(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_html_snapshots(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let base = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    for round in &mut bundle.rounds {
        if round.html.is_some() {
            continue;
        }
        let Some(rel_path) = &round.html_path else {
            continue;
        };
        let html_path = base.join(rel_path);
        let html = fs::read_to_string(&html_path)
            .with_context(|| format!("reading html snapshot {}", html_path.display()))?;
        round.html = Some(html);
    }
    Ok(())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extracts raw rows from a listing snapshot. Rows with missing cells are kept;
/// the normalizer fills the gaps.
pub fn parse_html_rows(
    html: &str,
    selectors: &SelectorSet,
    category: Category,
) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_fragment(html);
    let row = parse_selector(&selectors.row)?;
    let symbol = parse_selector(&selectors.symbol)?;
    let description = parse_selector(&selectors.description)?;
    let exchange = parse_selector(&selectors.exchange)?;

    Ok(document
        .select(&row)
        .map(|el| RawRecord {
            symbol: select_first_text(el, &symbol),
            description: select_first_text(el, &description),
            exchange: select_first_text(el, &exchange),
            category_tag: Some(category.as_str().to_string()),
        })
        .collect())
}

fn parse_round(
    bundle: &FixtureBundle,
    round: &FixtureRound,
) -> Result<Vec<RawRecord>, AdapterError> {
    let mut records = round.records.clone();
    if let Some(html) = &round.html {
        records.extend(parse_html_rows(html, &bundle.selectors, bundle.category)?);
    }
    Ok(records)
}

/// Replays a [`FixtureBundle`] as if it were a live virtualized listing.
///
/// `advance` steps to the next snapshot and sticks on the last one, so the
/// frontier stops growing once the recording is exhausted.
#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    bundle: FixtureBundle,
    settle: SettlePolicy,
    position: usize,
    connected: bool,
    last_batch_len: usize,
}

impl FixtureSourceAdapter {
    pub fn new(bundle: FixtureBundle) -> Self {
        let settle = bundle.settle.unwrap_or_default();
        Self {
            bundle,
            settle,
            position: 0,
            connected: false,
            last_batch_len: 0,
        }
    }

    pub fn with_settle_policy(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn current_round(&self) -> Result<&FixtureRound, AdapterError> {
        if !self.connected {
            return Err(AdapterError::Batch("adapter is not connected".to_string()));
        }
        self.bundle.rounds.get(self.position).ok_or_else(|| {
            AdapterError::Batch(format!("no snapshot at position {}", self.position))
        })
    }
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    fn settle_policy(&self) -> SettlePolicy {
        self.settle
    }

    async fn connect(&mut self, category: Category) -> Result<(), AdapterError> {
        if self.bundle.category != category {
            return Err(AdapterError::Connection(format!(
                "fixture {} captures category {} but {} was requested",
                self.bundle.fixture_id, self.bundle.category, category
            )));
        }
        if self.bundle.rounds.is_empty() {
            return Err(AdapterError::Connection(format!(
                "fixture {} has no recorded rounds",
                self.bundle.fixture_id
            )));
        }
        self.position = 0;
        self.last_batch_len = 0;
        self.connected = true;
        debug!(
            fixture_id = %self.bundle.fixture_id,
            url = %self.bundle.captured_from_url,
            "fixture session connected"
        );
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<RawRecord>, AdapterError> {
        let round = self.current_round()?;
        let records = parse_round(&self.bundle, round)?;
        self.last_batch_len = records.len();
        Ok(records)
    }

    async fn frontier_size(&mut self) -> Result<usize, AdapterError> {
        let round = self.current_round()?;
        Ok(round.frontier.unwrap_or(self.last_batch_len))
    }

    async fn advance(&mut self) -> Result<(), AdapterError> {
        self.current_round()?;
        let last = self.bundle.rounds.len() - 1;
        self.position = (self.position + 1).min(last);
        Ok(())
    }
}

/// Resolves `<fixtures_root>/<category>/bundle.json` for each enabled category.
#[derive(Debug, Clone)]
pub struct FixtureAdapterFactory {
    fixtures_root: PathBuf,
    settle_overrides: HashMap<Category, SettlePolicy>,
}

impl FixtureAdapterFactory {
    pub fn new(fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
            settle_overrides: HashMap::new(),
        }
    }

    pub fn with_settle_override(mut self, category: Category, settle: SettlePolicy) -> Self {
        self.settle_overrides.insert(category, settle);
        self
    }

    pub fn bundle_path_for(&self, category: Category) -> PathBuf {
        self.fixtures_root.join(category.as_str()).join("bundle.json")
    }
}

impl AdapterFactory for FixtureAdapterFactory {
    fn adapter_for(
        &self,
        category: Category,
    ) -> Result<Option<Box<dyn SourceAdapter>>, AdapterError> {
        if !category.is_enabled() {
            return Ok(None);
        }
        let bundle = load_fixture_bundle(self.bundle_path_for(category))?;
        let mut adapter = FixtureSourceAdapter::new(bundle);
        if let Some(settle) = self.settle_overrides.get(&category) {
            adapter = adapter.with_settle_policy(*settle);
        }
        Ok(Some(Box::new(adapter)))
    }
}
