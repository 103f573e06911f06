//! Telemetry event names.
//!
//! Emitted as the `event` field on tracing records so log pipelines can
//! filter card lifecycle events without parsing messages.

pub mod events {
    /// Card run lifecycle.
    pub const CARD_START: &str = "card.start";
    pub const CARD_COMPLETE: &str = "card.complete";
    pub const CARD_BLOCKED: &str = "card.blocked";
    pub const CARD_FAIL: &str = "card.fail";

    /// Step lifecycle.
    pub const STEP_COMPLETE: &str = "step.complete";
    pub const STEP_FAIL: &str = "step.fail";

    /// Component calls.
    pub const BACKEND_CALL: &str = "backend.call";
    pub const POLICY_ENFORCE: &str = "policy.enforce";
    pub const EVIDENCE_GROUND: &str = "evidence.ground";
    pub const EVIDENCE_WRITEBACK: &str = "evidence.writeback";
}
