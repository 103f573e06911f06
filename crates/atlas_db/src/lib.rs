//! Evidence store for Atlas.
//!
//! Documents live in a single keyed table `(id, space, content, created_at)`.
//! Rows are never updated: corrections are new writebacks.
//!
//! # Concurrency
//!
//! Writebacks take an in-process write lock so they are serialized relative to
//! each other. Grounding reads never take the lock; SQLite WAL mode lets them
//! run while a writeback transaction is open.
//!
//! # Usage
//!
//! ```rust,ignore
//! use atlas_db::AtlasDb;
//! use atlas_protocol::NewDocument;
//!
//! let db = AtlasDb::open("~/.atlas/atlas.sqlite3").await?;
//! db.evidence_writeback(&NewDocument::new("kpi", "ACME revenue grew 12%")).await?;
//! let grounding = db.evidence_ground("ACME revenue", 5, Some("kpi")).await?;
//! ```

mod error;
mod evidence;
mod schema;

pub use error::{DbError, Result};
pub use evidence::{overlap_score, query_terms};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Handle to the evidence database. Clone is cheap and shares the pool and
/// the write lock.
#[derive(Clone)]
pub struct AtlasDb {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl AtlasDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Evidence store opened");

        Ok(db)
    }

    /// Open an existing database (fails if not exists).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DbError::not_found(format!(
                "Database not found: {}",
                path.display()
            )));
        }

        let url = format!("sqlite:{}?mode=rw", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Cheap liveness probe used by readiness checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl AtlasDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}
