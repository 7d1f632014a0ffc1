//! SQLite-backed persistent store.
//!
//! Split into focused submodules:
//! - `sessions` — session lifecycle rows and credential blobs
//! - `pairing` — ephemeral pairing codes
//! - `settings` — per-number configuration with default fallback
//! - `stats` — durable counter snapshots
//!
//! The store owns TTL enforcement: reads filter on `expires_at` and
//! `purge_expired` drops dead rows on the server's periodic tick.

mod pairing;
mod sessions;
mod settings;
mod stats;


pub use settings::UserSettings;

use courier_core::config::StoreConfig;
use courier_core::error::CourierError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// How long a session row survives without activity.
pub const SESSION_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Fixed validity window of a pairing code.
pub const PAIRING_CODE_TTL_SECS: i64 = 120;

/// Persistent store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Current unix time in seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Store {
    /// Open the store, running migrations on first use.
    ///
    /// A `db_path` of `:memory:` opens a private in-memory database
    /// (used by tests).
    pub async fn new(config: &StoreConfig) -> Result<Self, CourierError> {
        let in_memory = config.db_path == ":memory:";

        if !in_memory {
            if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        CourierError::Store(format!("failed to create data dir: {e}"))
                    })?;
                }
            }
        }

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}", config.db_path)
        };

        let mut opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| CourierError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true);
        if !in_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // In-memory databases are per-connection; cap the pool at one
        // so every query sees the same schema.
        let max_connections = if in_memory { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| CourierError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("Store initialized at {}", config.db_path);

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), CourierError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS sessions (
                number TEXT PRIMARY KEY,
                creds TEXT,
                keys TEXT,
                is_active INTEGER NOT NULL DEFAULT 0,
                last_active INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pairing_codes (
                number TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                number TEXT PRIMARY KEY,
                prefix TEXT NOT NULL,
                auto_status_seen INTEGER NOT NULL,
                auto_status_react INTEGER NOT NULL,
                auto_status_reply INTEGER NOT NULL,
                channels TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS stats_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                active_connections INTEGER NOT NULL,
                total_users INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| CourierError::Store(format!("migration failed: {e}")))?;

        Ok(())
    }

    /// Drop expired sessions and pairing codes. Returns rows removed.
    pub async fn purge_expired(&self) -> Result<u64, CourierError> {
        let ts = now();
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::Store(format!("purge sessions failed: {e}")))?;
        let codes = sqlx::query("DELETE FROM pairing_codes WHERE expires_at <= ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::Store(format!("purge codes failed: {e}")))?;

        Ok(sessions.rows_affected() + codes.rows_affected())
    }
}
