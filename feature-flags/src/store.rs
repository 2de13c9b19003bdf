use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use common_types::FlagMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use crate::config::Config;

/// Flags every fresh database starts with. Seeding never overwrites an existing row.
pub const INITIAL_FLAGS: &[(&str, bool)] = &[
    ("STORE_CHECKOUT_ENABLED", true),
    ("MAIN_STORE", false),
    // Relaunch theme
    ("SITE_RELAUNCH", false),
    // Payment API required by checkout under SITE_RELAUNCH
    ("BACKEND_V2", false),
];

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn initial_flags() -> FlagMap {
    INITIAL_FLAGS
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result of a compare-and-set on one flag's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Changed { previous: bool },
    Unchanged,
    NotFound,
}

/// The persistent default store. Only the admin path writes through it.
#[async_trait]
pub trait DefaultStore: Send + Sync {
    async fn list(&self) -> Result<FlagMap, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<bool>, StoreError>;

    /// Atomically sets `name` to `value` unless it already holds it.
    async fn compare_and_set(&self, name: &str, value: bool) -> Result<WriteResult, StoreError>;

    /// Applies every update in one transaction. Any failure rolls the whole batch back.
    async fn compare_and_set_all(
        &self,
        updates: &[(String, bool)],
    ) -> Result<Vec<(String, WriteResult)>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteFlagStore {
    pool: SqlitePool,
}

impl SqliteFlagStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the pool described by `config` and brings the schema up to date.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        Self::connect(
            &config.database_url,
            config.max_db_connections,
            config.acquire_timeout(),
        )
        .await
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout);

        // An in-memory database lives exactly as long as its connection
        if url.contains(":memory:") || url.contains("mode=memory") {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts the given flags, leaving existing rows untouched. Returns how many were added.
    #[instrument(skip_all)]
    pub async fn insert_missing(&self, flags: &FlagMap) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (name, value) in flags {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO flags (name, default_value) VALUES (?, ?)",
            )
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn seed(&self) -> Result<u64, StoreError> {
        let inserted = self.insert_missing(&initial_flags()).await?;
        tracing::info!(inserted, "default flags initialization complete");
        Ok(inserted)
    }

    /// Overwrites the default of every listed flag that exists. Returns the names written.
    #[instrument(skip_all)]
    pub async fn overwrite(&self, flags: &FlagMap) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::new();
        for (name, value) in flags {
            let result = sqlx::query("UPDATE flags SET default_value = ? WHERE name = ?")
                .bind(value)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                written.push(name.clone());
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Deletes every flag whose name is not in `keep`. Returns the deleted names.
    #[instrument(skip_all)]
    pub async fn delete_except(&self, keep: &[&str]) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM flags ORDER BY name")
            .fetch_all(&mut *tx)
            .await?;

        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|n| !keep.contains(&n.as_str())) {
            sqlx::query("DELETE FROM flags WHERE name = ?")
                .bind(&name)
                .execute(&mut *tx)
                .await?;
            deleted.push(name);
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Writes first, so the write lock is held before anything is read.
async fn compare_and_set_in(
    conn: &mut SqliteConnection,
    name: &str,
    value: bool,
) -> Result<WriteResult, sqlx::Error> {
    let result =
        sqlx::query("UPDATE flags SET default_value = ? WHERE name = ? AND default_value <> ?")
            .bind(value)
            .bind(name)
            .bind(value)
            .execute(&mut *conn)
            .await?;
    if result.rows_affected() > 0 {
        return Ok(WriteResult::Changed { previous: !value });
    }

    let current: Option<bool> =
        sqlx::query_scalar("SELECT default_value FROM flags WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(match current {
        Some(_) => WriteResult::Unchanged,
        None => WriteResult::NotFound,
    })
}

#[async_trait]
impl DefaultStore for SqliteFlagStore {
    #[instrument(skip_all)]
    async fn list(&self) -> Result<FlagMap, StoreError> {
        let rows = sqlx::query("SELECT name, default_value FROM flags")
            .fetch_all(&self.pool)
            .await?;

        let mut flags = FlagMap::new();
        for row in rows {
            flags.insert(row.try_get("name")?, row.try_get("default_value")?);
        }
        Ok(flags)
    }

    async fn get(&self, name: &str) -> Result<Option<bool>, StoreError> {
        let value = sqlx::query_scalar("SELECT default_value FROM flags WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn compare_and_set(&self, name: &str, value: bool) -> Result<WriteResult, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(compare_and_set_in(&mut conn, name, value).await?)
    }

    #[instrument(skip_all, fields(batch_size = updates.len()))]
    async fn compare_and_set_all(
        &self,
        updates: &[(String, bool)],
    ) -> Result<Vec<(String, WriteResult)>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(updates.len());
        for (name, value) in updates {
            let result = compare_and_set_in(&mut tx, name, *value).await?;
            results.push((name.clone(), result));
        }
        // Dropping `tx` on an early return above rolls everything back
        tx.commit().await?;
        Ok(results)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
