//! Engine configuration (TOML).
//!
//! ```toml
//! [router]
//! timeout_ms = 5000
//!
//! [arbiter]
//! faithfulness = 0.5
//! pii = 0.3
//! depth = 0.2
//!
//! [policy]
//! mask_token = "[REDACTED]"
//!
//! [[backends]]
//! id = "canned"
//! kind = "static"
//! payload = "fixed answer"
//!
//! [[policies]]
//! name = "no_secrets"
//! rules = [{ id = "api_key", action = "block", pattern = "sk-[A-Za-z0-9]{20,}" }]
//! ```
//!
//! Every section is optional. Backends listed here are registered after the
//! built-in local models; policies are added to the built-in set.

use crate::arbiter::{Arbiter, RubricWeights};
use crate::backend::{builtin_backends, BackendRegistry, BackendSpec};
use crate::policy::{PolicyGate, PolicySpec};
use crate::router::ModelRouter;
use atlas_protocol::defaults::{DEFAULT_BACKEND_TIMEOUT_MS, DEFAULT_MASK_TOKEN};
use atlas_protocol::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mask_token: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mask_token: DEFAULT_MASK_TOKEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub arbiter: RubricWeights,
    pub policy: PolicyConfig,
    /// Registered after the built-in local models.
    pub backends: Vec<BackendSpec>,
    pub policies: Vec<PolicySpec>,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), backends = config.backends.len(), "Loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.router.timeout_ms == 0 {
            return Err(EngineError::config("router.timeout_ms must be positive"));
        }
        self.arbiter.validate()
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.router.timeout_ms)
    }
}

/// Shared engine components built once from configuration.
///
/// Everything here is read-only after construction and cheap to clone.
#[derive(Debug, Clone)]
pub struct Components {
    pub registry: Arc<BackendRegistry>,
    pub router: ModelRouter,
    pub arbiter: Arbiter,
    pub policy: Arc<PolicyGate>,
    pub weights: RubricWeights,
}

impl Components {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut specs = builtin_backends();
        specs.extend(config.backends.iter().cloned());
        let registry = Arc::new(BackendRegistry::new(specs)?);
        let policy = Arc::new(PolicyGate::new(
            &config.policies,
            config.policy.mask_token.clone(),
        )?);

        Ok(Self {
            router: ModelRouter::new(registry.clone(), config.backend_timeout()),
            arbiter: Arbiter::new(registry.clone()),
            registry,
            policy,
            weights: config.arbiter,
        })
    }
}
