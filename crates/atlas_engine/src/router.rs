//! Model Router - concurrent fan-out with per-call timeouts.
//!
//! # Ordering
//!
//! Candidates come back in backend registration order, never completion
//! order, so arbitration over the same backend set is reproducible.
//!
//! # Barrier
//!
//! `dispatch` returns only after every backend has answered or hit its own
//! timeout. One slow backend costs at most one timeout; it cannot stall the
//! step indefinitely.

use crate::backend::BackendRegistry;
use atlas_protocol::{Candidate, EngineError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ModelRouter {
    registry: Arc<BackendRegistry>,
    timeout: Duration,
}

impl ModelRouter {
    pub fn new(registry: Arc<BackendRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fan `task` out to `backend_ids` using the router's default timeout.
    pub async fn dispatch(
        &self,
        task: &str,
        backend_ids: &[String],
    ) -> Result<Vec<Candidate>, EngineError> {
        self.dispatch_with_timeout(task, backend_ids, self.timeout)
            .await
    }

    /// Fan `task` out with an explicit per-call timeout.
    ///
    /// Fails only on configuration problems (unknown or no backends). Backend
    /// failures come back as candidates with `error` set.
    pub async fn dispatch_with_timeout(
        &self,
        task: &str,
        backend_ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<Candidate>, EngineError> {
        if backend_ids.is_empty() {
            return Err(EngineError::config("dispatch requires at least one backend"));
        }

        let mut targets = Vec::with_capacity(backend_ids.len());
        for id in backend_ids {
            let position = self
                .registry
                .position(id)
                .ok_or_else(|| EngineError::unknown_backend(id.clone()))?;
            targets.push((position, id.clone()));
        }
        targets.sort_by_key(|(position, _)| *position);
        if let Some(pair) = targets.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(EngineError::config(format!(
                "backend '{}' requested more than once",
                pair[0].1
            )));
        }

        debug!(
            backends = targets.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching task"
        );

        let mut handles = Vec::with_capacity(targets.len());
        for (_, id) in targets {
            let backend = match self.registry.get(&id) {
                Some(backend) => backend.clone(),
                None => return Err(EngineError::unknown_backend(id)),
            };
            let task = task.to_string();
            let handle_id = id.clone();
            let handle = tokio::spawn(async move { backend.invoke(&handle_id, &task, timeout).await });
            handles.push((id, handle));
        }

        let mut candidates = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    warn!(backend = %id, error = %e, "Backend task aborted");
                    candidates.push(Candidate::failed(id, format!("backend task aborted: {}", e), 0));
                }
            }
        }

        Ok(candidates)
    }
}
