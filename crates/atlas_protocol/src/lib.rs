//! Shared data model for the Atlas card engine.
//!
//! Everything that crosses a crate boundary lives here: the artifacts a card
//! run produces (candidates, judgements, policy results, dossiers), the audit
//! trail format, the error taxonomy and canonical defaults.
//!
//! ```text
//! card + inputs ──► retrieve ──► dispatch ──► gate ──► compose ──► Dossier
//!                   (Document)   (Candidate,  (Policy   (output)    + audit
//!                                 Judgement)   Result)
//! ```

pub mod defaults;
pub mod error;
pub mod telemetry;
pub mod types;

pub use error::{EngineError, ErrorBody, ErrorKind};
pub use types::{
    json_type_name, AuditEntry, Candidate, CandidateSummary, Document, DocumentId, Dossier,
    FieldType, Grounding, Judgement, NewDocument, PolicyResult, RunId, RunStatus, SelfCheck,
    StepKind, StepOutcome, Verdict,
};
