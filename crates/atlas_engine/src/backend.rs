//! Model backends and the process-wide registry.
//!
//! Backends are a closed set of kinds. Each kind knows how to turn a task
//! into a payload; [`Backend::invoke`] wraps that call with a timeout and
//! converts every outcome into a [`Candidate`]. Errors never escape.

use crate::metrics::METRICS;
use atlas_protocol::{Candidate, EngineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// Returns the task unchanged.
    Echo,
    /// Returns the task with its characters reversed.
    Reverse,
    /// Returns the task upper-cased.
    Uppercase,
    /// Returns a fixed payload after an optional delay.
    Static {
        payload: String,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Always fails with `message`.
    Failing {
        #[serde(default = "default_failure_message")]
        message: String,
    },
}

fn default_failure_message() -> String {
    "backend unavailable".to_string()
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Echo => "echo",
            Backend::Reverse => "reverse",
            Backend::Uppercase => "uppercase",
            Backend::Static { .. } => "static",
            Backend::Failing { .. } => "failing",
        }
    }

    async fn call(&self, task: &str) -> Result<String, String> {
        match self {
            Backend::Echo => Ok(task.to_string()),
            Backend::Reverse => Ok(task.chars().rev().collect()),
            Backend::Uppercase => Ok(task.to_uppercase()),
            Backend::Static { payload, delay_ms } => {
                if *delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
                Ok(payload.clone())
            }
            Backend::Failing { message } => Err(message.clone()),
        }
    }

    /// Run the backend under `timeout`. A timeout or failure yields a
    /// candidate with `error` set and an empty payload.
    pub async fn invoke(&self, backend_id: &str, task: &str, timeout: Duration) -> Candidate {
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.call(task)).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        METRICS.record_backend_call(start);

        let candidate = match outcome {
            Ok(Ok(payload)) => Candidate::ok(backend_id, payload, latency_ms),
            Ok(Err(message)) => {
                METRICS.inc_backend_errors();
                Candidate::failed(backend_id, message, latency_ms)
            }
            Err(_) => {
                METRICS.inc_backend_timeouts();
                Candidate::failed(
                    backend_id,
                    format!("timed out after {}ms", timeout.as_millis()),
                    latency_ms,
                )
            }
        };
        debug!(
            backend = backend_id,
            latency_ms,
            ok = candidate.is_viable(),
            "Backend call finished"
        );
        candidate
    }
}

/// Backend registered under an id, as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    #[serde(flatten)]
    pub backend: Backend,
}

impl BackendSpec {
    pub fn new(id: impl Into<String>, backend: Backend) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }
}

/// The three local mock models every installation starts with.
pub fn builtin_backends() -> Vec<BackendSpec> {
    vec![
        BackendSpec::new("local_echo", Backend::Echo),
        BackendSpec::new("local_reverse", Backend::Reverse),
        BackendSpec::new("local_uppercase", Backend::Uppercase),
    ]
}

/// Read-only table of backends in registration order.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    entries: Vec<BackendSpec>,
    index: HashMap<String, usize>,
}

impl BackendRegistry {
    pub fn new(specs: Vec<BackendSpec>) -> Result<Self, EngineError> {
        let mut registry = Self::default();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    fn register(&mut self, spec: BackendSpec) -> Result<(), EngineError> {
        if spec.id.trim().is_empty() {
            return Err(EngineError::config("backend id must not be empty"));
        }
        if self.index.contains_key(&spec.id) {
            return Err(EngineError::config(format!(
                "backend '{}' registered twice",
                spec.id
            )));
        }
        debug!(backend = %spec.id, kind = spec.backend.kind(), "Registering backend");
        self.index.insert(spec.id.clone(), self.entries.len());
        self.entries.push(spec);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Backend> {
        self.index.get(id).map(|&i| &self.entries[i].backend)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Registration position, used to order candidates and break ties.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
