//! Atlas card engine.
//!
//! Loads declarative cards, runs them step by step and produces an audited
//! [`Dossier`](atlas_protocol::Dossier) per run.
//!
//! ```text
//!                 ┌──────────────┐
//!   card name ──► │ CardExecutor │ ──► Dossier
//!   + inputs      └──────┬───────┘
//!                        │ one step at a time
//!     ┌──────────────┬───┴──────────┬─────────────┐
//!     ▼              ▼              ▼             ▼
//!  retrieve       dispatch         gate        compose
//!  (AtlasDb)   (ModelRouter ──►  (PolicyGate)  (context)
//!               Arbiter)
//! ```
//!
//! Components are built once from [`EngineConfig`] and shared read-only
//! across concurrent runs. Per-run state lives in [`context::ExecutionContext`].

pub mod arbiter;
pub mod audit;
pub mod backend;
pub mod cancel;
pub mod card;
pub mod catalog;
pub mod config;
pub mod context;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod router;

pub use arbiter::{self_check, Arbiter, Rubric, RubricWeights};
pub use audit::{AuditLog, AuditLogError};
pub use backend::{builtin_backends, Backend, BackendRegistry, BackendSpec};
pub use cancel::CancellationToken;
pub use card::{Card, CardSummary, Step, Target};
pub use catalog::CardCatalog;
pub use config::{Components, EngineConfig};
pub use executor::CardExecutor;
pub use metrics::METRICS;
pub use policy::{builtin_policies, PolicyGate, PolicySpec};
pub use router::ModelRouter;
