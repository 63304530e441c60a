//! SQLite implementation of [`CacheStore`].
//!
//! Migrations are embedded at compile time via `sqlx::migrate!` and run by
//! [`SqliteCacheStore::connect`]. Expiry is lazy: a stale row is deleted when
//! it is read, there is no sweeper.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use kiln_core::ConvertedFile;
use kiln_core::cache::{CacheKey, CacheStore, CacheStoreError};
use sqlx::SqlitePool;
use tracing::debug;

/// Primary result code for `SQLITE_FULL`.
const SQLITE_FULL: &str = "13";

#[derive(Clone, Debug)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://kiln-cache.db?mode=rwc"` or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn store_error(e: sqlx::Error) -> CacheStoreError {
    if let sqlx::Error::Database(db) = &e {
        // Extended codes keep the primary code in the low byte.
        let primary = db
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .map(|c| (c & 0xff).to_string());
        if primary.as_deref() == Some(SQLITE_FULL) {
            return CacheStoreError::StorageFull(e.to_string());
        }
    }
    CacheStoreError::Unavailable(e.to_string())
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<ConvertedFile>, CacheStoreError> {
        let row: Option<(String, String, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT mime, extension, bytes, expires_at \
             FROM conversion_cache WHERE cache_key = ?1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        let Some((mime, extension, bytes, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= Utc::now().timestamp_millis() {
            debug!(%key, "evicting expired cache row");
            sqlx::query("DELETE FROM conversion_cache WHERE cache_key = ?1 AND expires_at = ?2")
                .bind(key.as_str())
                .bind(expires_at)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
            return Ok(None);
        }
        Ok(Some(ConvertedFile {
            mime,
            extension,
            bytes: Bytes::from(bytes),
        }))
    }

    async fn set(&self, key: &CacheKey, value: &ConvertedFile, ttl: Duration) -> Result<(), CacheStoreError> {
        let now = Utc::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.timestamp_millis().saturating_add(ttl_ms);
        sqlx::query(
            "INSERT INTO conversion_cache (cache_key, mime, extension, bytes, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(cache_key) DO UPDATE SET \
                 mime = excluded.mime, \
                 extension = excluded.extension, \
                 bytes = excluded.bytes, \
                 expires_at = excluded.expires_at, \
                 created_at = excluded.created_at",
        )
        .bind(key.as_str())
        .bind(&value.mime)
        .bind(&value.extension)
        .bind(value.bytes.as_ref())
        .bind(expires_at)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }
}
