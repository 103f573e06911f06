//! Atlas server library: engine bootstrap and the HTTP API.
//!
//! The `atlas` binary in `main.rs` wires these into CLI subcommands; tests
//! drive [`http::router`] directly.

pub mod app;
pub mod http;
pub mod rate_limit;

pub use app::EngineArgs;
pub use http::{router, status_for, HttpConfig};
pub use rate_limit::RateLimiter;
