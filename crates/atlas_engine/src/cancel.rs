use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Token for cooperative cancellation of one card run.
///
/// The executor checks it at every step boundary. Steps already in flight
/// finish or time out on their own. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
