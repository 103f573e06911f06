//! `atlas evidence` - seed and query the evidence store.

use anyhow::{Context, Result};
use atlas_protocol::defaults::DEFAULT_TOP_K;
use atlas_protocol::NewDocument;
use atlas_server::EngineArgs;
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum EvidenceAction {
    /// Store a document
    Add {
        /// Evidence space
        #[arg(long)]
        space: String,

        /// Document text
        content: String,
    },

    /// Rank stored documents against a query
    Ground {
        /// Query text
        query: String,

        /// Restrict to one space
        #[arg(long)]
        space: Option<String>,

        /// Number of documents to return
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },
}

pub async fn run(action: EvidenceAction, engine: &EngineArgs) -> Result<()> {
    let db = match &action {
        EvidenceAction::Add { .. } => engine.open_database().await?,
        EvidenceAction::Ground { .. } => engine.open_existing_database().await?,
    };

    match action {
        EvidenceAction::Add { space, content } => {
            let id = db
                .evidence_writeback(&NewDocument::new(space.clone(), content))
                .await
                .context("Failed to store document")?;
            println!("Stored document {} in '{}'", id, space);
        }
        EvidenceAction::Ground {
            query,
            space,
            top_k,
        } => {
            let grounding = db
                .evidence_ground(&query, top_k.max(1), space.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&grounding)?);
        }
    }

    db.close().await;
    Ok(())
}
