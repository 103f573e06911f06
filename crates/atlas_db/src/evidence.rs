//! Evidence operations: writeback, grounding, snapshots.

use crate::error::{DbError, Result};
use crate::AtlasDb;
use atlas_protocol::{Document, DocumentId, Grounding, NewDocument};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::debug;

/// Lowercased, deduplicated alphanumeric terms of `text`.
pub fn query_terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Number of `query` terms that appear in `content`.
pub fn overlap_score(query: &BTreeSet<String>, content: &str) -> usize {
    let doc = query_terms(content);
    query.iter().filter(|t| doc.contains(*t)).count()
}

impl AtlasDb {
    // ========================================================================
    // Writes (serialized)
    // ========================================================================

    /// Append one document and return its new id.
    pub async fn evidence_writeback(&self, doc: &NewDocument) -> Result<DocumentId> {
        if doc.space.trim().is_empty() || doc.content.trim().is_empty() {
            return Err(DbError::constraint("document needs a space and content"));
        }

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            INSERT INTO evidence_documents (space, content, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&doc.space)
        .bind(&doc.content)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, space = %doc.space, "Evidence written");
        Ok(id)
    }

    /// Append a batch in one transaction. Entries with an empty space or
    /// content are skipped; the returned ids follow the kept entries' order.
    pub async fn evidence_writeback_many(&self, docs: &[NewDocument]) -> Result<Vec<DocumentId>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(docs.len());

        for doc in docs {
            if doc.space.trim().is_empty() || doc.content.trim().is_empty() {
                debug!("Skipping evidence entry without space or content");
                continue;
            }
            let result = sqlx::query(
                "INSERT INTO evidence_documents (space, content, created_at) VALUES (?, ?, ?)",
            )
            .bind(&doc.space)
            .bind(&doc.content)
            .bind(Self::now_millis())
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        debug!(written = ids.len(), "Evidence batch written");
        Ok(ids)
    }

    // ========================================================================
    // Reads (lock-free)
    // ========================================================================

    /// Rank documents by query-term overlap, most recent first on ties, and
    /// keep the top `top_k`. `space = None` searches every space.
    pub async fn evidence_ground(
        &self,
        query: &str,
        top_k: usize,
        space: Option<&str>,
    ) -> Result<Grounding> {
        let scope = self.evidence_scope(space).await?;
        let total = scope.len();
        let terms = query_terms(query);

        // scope is newest first; the stable sort keeps that order within a score
        let mut ranked: Vec<(usize, Document)> = scope
            .into_iter()
            .map(|doc| (overlap_score(&terms, &doc.content), doc))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let documents: Vec<Document> = ranked.into_iter().take(top_k).map(|(_, d)| d).collect();

        let coverage = if total == 0 {
            0.0
        } else {
            documents.len() as f64 / total as f64
        };

        let mut caveats = Vec::new();
        if documents.is_empty() {
            caveats.push(match space {
                Some(space) => format!("No evidence found in space '{}'", space),
                None => "No evidence found".to_string(),
            });
        }

        let answer = documents
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(Grounding {
            answer,
            documents,
            coverage,
            caveats,
        })
    }

    /// Every document in a space, newest first.
    pub async fn evidence_snapshot(&self, space: &str) -> Result<Vec<Document>> {
        self.evidence_scope(Some(space)).await
    }

    pub async fn evidence_count(&self, space: Option<&str>) -> Result<i64> {
        let row = match space {
            Some(space) => {
                sqlx::query("SELECT COUNT(*) AS n FROM evidence_documents WHERE space = ?")
                    .bind(space)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT COUNT(*) AS n FROM evidence_documents")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn evidence_scope(&self, space: Option<&str>) -> Result<Vec<Document>> {
        let rows = match space {
            Some(space) => {
                sqlx::query("SELECT * FROM evidence_documents WHERE space = ? ORDER BY id DESC")
                    .bind(space)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM evidence_documents ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        space: row.try_get("space")?,
        content: row.try_get("content")?,
        created_at: AtlasDb::millis_to_datetime(row.try_get("created_at")?),
    })
}
