//! Card catalog - every card known to the process, keyed by name.

use crate::backend::BackendRegistry;
use crate::card::{Card, CardSummary};
use crate::policy::PolicyGate;
use atlas_protocol::EngineError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const CARD_EXTENSIONS: [&str; 3] = ["toml", "yaml", "yml"];

#[derive(Debug, Clone, Default)]
pub struct CardCatalog {
    cards: BTreeMap<String, Arc<Card>>,
}

impl CardCatalog {
    /// Load every card file in `dir` (not recursive).
    ///
    /// Any malformed card, duplicate name or unknown backend/policy fails the
    /// whole load.
    pub fn load_dir(
        dir: &Path,
        backends: &BackendRegistry,
        policies: &PolicyGate,
    ) -> Result<Self, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::config(format!("cannot read cards directory {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| CARD_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut catalog = Self::default();
        for path in paths {
            let card = Card::from_path(&path)?;
            card.check_against(backends, policies)?;
            debug!(card = %card.name, path = %path.display(), "Loaded card");
            catalog.insert(card)?;
        }

        info!(dir = %dir.display(), cards = catalog.len(), "Card catalog ready");
        Ok(catalog)
    }

    /// Build from already-parsed cards. References to backends and policies
    /// are checked at execution time instead.
    pub fn from_cards(cards: impl IntoIterator<Item = Card>) -> Result<Self, EngineError> {
        let mut catalog = Self::default();
        for card in cards {
            catalog.insert(card)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, card: Card) -> Result<(), EngineError> {
        if self.cards.contains_key(&card.name) {
            return Err(EngineError::config(format!(
                "card '{}' defined twice",
                card.name
            )));
        }
        self.cards.insert(card.name.clone(), Arc::new(card));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Card>, EngineError> {
        self.cards
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCard(name.to_string()))
    }

    /// Summaries in name order.
    pub fn list(&self) -> Vec<CardSummary> {
        self.cards.values().map(|c| c.summary()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
