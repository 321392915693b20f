//! Symbol persistence (Postgres / SQLite) and downstream cache contracts.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use symharvest_core::{Category, NormalizedRecord, PersistedSymbolRow};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "symharvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unsupported database url `{0}`")]
    UnsupportedUrl(String),
}

/// Persistent store contract needed by the sync writer.
#[async_trait]
pub trait SymbolStore: Send + Sync {
    /// Creates the schema. Safe to call on every start.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Deletes every row of `category` and upserts `records` in one transaction.
    ///
    /// On error nothing is committed and the category keeps its previous rows.
    async fn replace_category(
        &self,
        category: Category,
        records: &[NormalizedRecord],
    ) -> Result<u64, StoreError>;

    /// Rows of `category` in discovery order.
    async fn list_category(
        &self,
        category: Category,
    ) -> Result<Vec<PersistedSymbolRow>, StoreError>;
}

const SCHEMA_POSTGRES: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS symbols (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL CHECK (symbol <> ''),
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        asset_type TEXT NOT NULL,
        category TEXT NOT NULL,
        exchange TEXT NOT NULL,
        currency TEXT NOT NULL,
        country TEXT NOT NULL,
        sector TEXT NOT NULL,
        industry TEXT NOT NULL,
        order_index BIGINT NOT NULL,
        last_updated TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS symbols_category_order_idx ON symbols (category, order_index)",
];

const SCHEMA_SQLITE: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS symbols (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL CHECK (symbol <> ''),
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        asset_type TEXT NOT NULL,
        category TEXT NOT NULL,
        exchange TEXT NOT NULL,
        currency TEXT NOT NULL,
        country TEXT NOT NULL,
        sector TEXT NOT NULL,
        industry TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        last_updated TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS symbols_category_order_idx ON symbols (category, order_index)",
];

const DELETE_CATEGORY: &str = "DELETE FROM symbols WHERE category = $1";

// A key already owned by another category keeps that category and its
// descriptive columns; only harvest-controlled columns are refreshed.
const UPSERT_SYMBOL: &str = r#"
    INSERT INTO symbols (
        id, symbol, name, description, asset_type, category, exchange,
        currency, country, sector, industry, order_index, last_updated
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (id) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        exchange = excluded.exchange,
        currency = excluded.currency,
        order_index = excluded.order_index,
        last_updated = excluded.last_updated
"#;

const SELECT_CATEGORY: &str = r#"
    SELECT id, symbol, name, description, asset_type, category, exchange,
           currency, country, sector, industry, order_index, last_updated
    FROM symbols
    WHERE category = $1
    ORDER BY order_index, id
"#;

#[derive(Debug, sqlx::FromRow)]
struct SymbolDbRow {
    id: String,
    symbol: String,
    name: String,
    description: String,
    asset_type: String,
    category: String,
    exchange: String,
    currency: String,
    country: String,
    sector: String,
    industry: String,
    order_index: i64,
    last_updated: DateTime<Utc>,
}

impl From<SymbolDbRow> for PersistedSymbolRow {
    fn from(row: SymbolDbRow) -> Self {
        Self {
            id: row.id,
            symbol: row.symbol,
            name: row.name,
            description: row.description,
            asset_type: row.asset_type,
            category: row.category,
            exchange: row.exchange,
            currency: row.currency,
            country: row.country,
            sector: row.sector,
            industry: row.industry,
            order_index: row.order_index,
            last_updated: row.last_updated,
        }
    }
}

/// Category-scoped delete then upsert inside one transaction on `$pool`.
///
/// Dropping the transaction on an early `?` return rolls the delete back.
macro_rules! replace_in_transaction {
    ($pool:expr, $category:expr, $records:expr, $backend:literal) => {{
        let category: Category = $category;
        let now = Utc::now();
        let mut tx = $pool.begin().await?;
        let deleted = sqlx::query(DELETE_CATEGORY)
            .bind(category.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut written = 0u64;
        for record in $records {
            written += sqlx::query(UPSERT_SYMBOL)
                .bind(record.stable_id())
                .bind(&record.display_symbol)
                .bind(&record.name)
                .bind(&record.description)
                .bind(&record.asset_type)
                .bind(record.category.as_str())
                .bind(&record.exchange)
                .bind(&record.currency)
                .bind(&record.country)
                .bind(&record.sector)
                .bind(&record.industry)
                .bind(i64::from(record.order_index))
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        debug!(%category, deleted, written, backend = $backend, "category replace committed");
        Ok(written)
    }};
}

#[derive(Debug, Clone)]
pub struct PgSymbolStore {
    pool: PgPool,
}

impl PgSymbolStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SymbolStore for PgSymbolStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_POSTGRES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn replace_category(
        &self,
        category: Category,
        records: &[NormalizedRecord],
    ) -> Result<u64, StoreError> {
        replace_in_transaction!(self.pool, category, records, "postgres")
    }

    async fn list_category(
        &self,
        category: Category,
    ) -> Result<Vec<PersistedSymbolRow>, StoreError> {
        let rows = sqlx::query_as::<_, SymbolDbRow>(SELECT_CATEGORY)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSymbolStore {
    pool: SqlitePool,
}

impl SqliteSymbolStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SymbolStore for SqliteSymbolStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQLITE {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn replace_category(
        &self,
        category: Category,
        records: &[NormalizedRecord],
    ) -> Result<u64, StoreError> {
        replace_in_transaction!(self.pool, category, records, "sqlite")
    }

    async fn list_category(
        &self,
        category: Category,
    ) -> Result<Vec<PersistedSymbolRow>, StoreError> {
        let rows = sqlx::query_as::<_, SymbolDbRow>(SELECT_CATEGORY)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Opens a store for `postgres://` / `postgresql://` or `sqlite:` urls.
///
/// The schema is not touched; callers run [`SymbolStore::migrate`] once.
pub async fn connect_store(database_url: &str) -> Result<Arc<dyn SymbolStore>, StoreError> {
    let is_postgres =
        database_url.starts_with("postgres://") || database_url.starts_with("postgresql://");
    let store: Arc<dyn SymbolStore> = if database_url.starts_with("sqlite:") {
        Arc::new(SqliteSymbolStore::connect(database_url).await?)
    } else if is_postgres {
        Arc::new(PgSymbolStore::connect(database_url).await?)
    } else {
        return Err(StoreError::UnsupportedUrl(database_url.to_string()));
    };
    info!("symbol store connected");
    Ok(store)
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to invalidate `{key}`: {message}")]
    Invalidate { key: String, message: String },
}

/// Downstream cache contract: delete the given keys.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, keys: &[String]) -> Result<(), CacheError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }
}

/// In-process read-through cache of category listings keyed `symbols:<category>`.
#[derive(Clone)]
pub struct MokaSymbolCache {
    cache: Cache<String, Arc<Vec<PersistedSymbolRow>>>,
}

impl MokaSymbolCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get_or_load(
        &self,
        category: Category,
        store: &dyn SymbolStore,
    ) -> Result<Arc<Vec<PersistedSymbolRow>>, Arc<StoreError>> {
        self.cache
            .try_get_with(category.cache_key(), async move {
                store.list_category(category).await.map(Arc::new)
            })
            .await
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

#[async_trait]
impl CacheInvalidator for MokaSymbolCache {
    async fn invalidate(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }
}
