//! Engine bootstrap shared by `serve` and the one-shot CLI commands.

use anyhow::{Context, Result};
use atlas_db::AtlasDb;
use atlas_engine::{AuditLog, CardCatalog, CardExecutor, Components, EngineConfig};
use atlas_protocol::defaults::DEFAULT_CARDS_DIR;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where the engine reads its configuration, cards and evidence from.
#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Engine configuration file (TOML). Built-in defaults when omitted.
    #[arg(long, env = "ATLAS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory of card definitions (.toml / .yaml)
    #[arg(long = "cards", env = "ATLAS_CARDS_DIR", default_value = DEFAULT_CARDS_DIR, global = true)]
    pub cards_dir: PathBuf,

    /// Evidence database file [default: ~/.atlas/atlas.sqlite3]
    #[arg(long, env = "ATLAS_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Append one NDJSON record per card run to this file
    #[arg(long, global = true)]
    pub audit_log: Option<PathBuf>,
}

impl EngineArgs {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(atlas_logging::default_database_path)
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load engine config {}", path.display())),
            None => Ok(EngineConfig::default()),
        }
    }

    pub fn components(&self) -> Result<Components> {
        let config = self.engine_config()?;
        Components::from_config(&config).context("Invalid engine configuration")
    }

    pub fn catalog(&self, components: &Components) -> Result<CardCatalog> {
        CardCatalog::load_dir(&self.cards_dir, &components.registry, &components.policy)
            .with_context(|| format!("Failed to load cards from {}", self.cards_dir.display()))
    }

    pub async fn open_database(&self) -> Result<AtlasDb> {
        let path = self.database_path();
        AtlasDb::open(&path)
            .await
            .with_context(|| format!("Failed to open evidence store {}", path.display()))
    }

    /// Open the evidence store without creating it; for read-only commands.
    pub async fn open_existing_database(&self) -> Result<AtlasDb> {
        let path = self.database_path();
        AtlasDb::open_existing(&path)
            .await
            .with_context(|| format!("Failed to open evidence store {}", path.display()))
    }

    /// Build a ready executor. Fails on any malformed card or config.
    pub async fn executor(&self) -> Result<CardExecutor> {
        let components = self.components()?;
        let catalog = self.catalog(&components)?;
        let db = self.open_database().await?;

        info!(
            cards = catalog.len(),
            backends = components.registry.len(),
            database = %self.database_path().display(),
            "Engine ready"
        );

        let mut executor = CardExecutor::new(catalog, components, db);
        if let Some(path) = &self.audit_log {
            let log = AuditLog::open(path)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?;
            executor = executor.with_audit_log(Arc::new(log));
        }
        Ok(executor)
    }
}
