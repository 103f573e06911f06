//! Evidence table creation. All CREATE statements live here.

use crate::error::Result;
use crate::AtlasDb;
use tracing::info;

impl AtlasDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL lets grounding reads proceed while a writeback commits
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS evidence_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                space TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_evidence_space ON evidence_documents(space)")
            .execute(&self.pool)
            .await?;

        info!("Evidence schema verified");
        Ok(())
    }
}
