//! Error taxonomy for card execution.
//!
//! Four categories, each reported to callers as a structured [`ErrorBody`]:
//!
//! - `config_error`: bad card/backend/policy definitions, never retried
//! - `validation_error`: bad caller input
//! - `execution_error`: runtime failure inside a step
//! - `policy_blocked`: terminal business outcome, not a crash

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category, used for status mapping and the `error` field of bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    ValidationError,
    ExecutionError,
    PolicyBlocked,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::PolicyBlocked => "policy_blocked",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Unknown card: {0}")]
    UnknownCard(String),

    #[error("Unknown backend '{backend}'{}", at_step(.step))]
    UnknownBackend {
        backend: String,
        step: Option<String>,
    },

    #[error("Unknown policy '{policy}'{}", at_step(.step))]
    UnknownPolicy {
        policy: String,
        step: Option<String>,
    },

    #[error("Invalid card '{card}': {detail}")]
    InvalidCard { card: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input '{field}': {detail}")]
    Validation { field: String, detail: String },

    #[error("Step failed{}: {detail}", at_step(.step))]
    Execution {
        step: Option<String>,
        detail: String,
    },

    #[error("Blocked by policy '{policy}'{}: {}", at_step(.step), .violations.join(", "))]
    PolicyBlocked {
        step: Option<String>,
        policy: String,
        violations: Vec<String>,
    },
}

fn at_step(step: &Option<String>) -> String {
    match step {
        Some(step) => format!(" at step '{}'", step),
        None => String::new(),
    }
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_card(card: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidCard {
            card: card.into(),
            detail: detail.into(),
        }
    }

    pub fn validation(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn execution(detail: impl Into<String>) -> Self {
        Self::Execution {
            step: None,
            detail: detail.into(),
        }
    }

    pub fn unknown_backend(backend: impl Into<String>) -> Self {
        Self::UnknownBackend {
            backend: backend.into(),
            step: None,
        }
    }

    pub fn unknown_policy(policy: impl Into<String>) -> Self {
        Self::UnknownPolicy {
            policy: policy.into(),
            step: None,
        }
    }

    /// Attach the failing step id when the error does not carry one yet.
    pub fn at(self, step_id: &str) -> Self {
        let fill = |step: Option<String>| step.or_else(|| Some(step_id.to_string()));
        match self {
            Self::UnknownBackend { backend, step } => Self::UnknownBackend {
                backend,
                step: fill(step),
            },
            Self::UnknownPolicy { policy, step } => Self::UnknownPolicy {
                policy,
                step: fill(step),
            },
            Self::Execution { step, detail } => Self::Execution {
                step: fill(step),
                detail,
            },
            Self::PolicyBlocked {
                step,
                policy,
                violations,
            } => Self::PolicyBlocked {
                step: fill(step),
                policy,
                violations,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCard(_)
            | Self::UnknownBackend { .. }
            | Self::UnknownPolicy { .. }
            | Self::InvalidCard { .. }
            | Self::Config(_) => ErrorKind::ConfigError,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::Execution { .. } => ErrorKind::ExecutionError,
            Self::PolicyBlocked { .. } => ErrorKind::PolicyBlocked,
        }
    }

    /// Step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::UnknownBackend { step, .. }
            | Self::UnknownPolicy { step, .. }
            | Self::Execution { step, .. }
            | Self::PolicyBlocked { step, .. } => step.as_deref(),
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let field = match self {
            Self::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        ErrorBody {
            error: self.kind(),
            detail: self.to_string(),
            step: self.step().map(str::to_string),
            field,
        }
    }
}

/// Structured error object returned to callers instead of a stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_names_backend() {
        let err = EngineError::unknown_backend("gpt_imaginary").at("summarise");
        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(err.step(), Some("summarise"));
        assert!(err.to_string().contains("gpt_imaginary"));
        assert!(err.to_string().contains("summarise"));
    }

    #[test]
    fn test_at_keeps_existing_step() {
        let err = EngineError::Execution {
            step: Some("first".into()),
            detail: "boom".into(),
        }
        .at("second");
        assert_eq!(err.step(), Some("first"));
    }

    #[test]
    fn test_validation_body_names_field() {
        let body = EngineError::validation("accounts", "missing required field").to_body();
        assert_eq!(body.error, ErrorKind::ValidationError);
        assert_eq!(body.field.as_deref(), Some("accounts"));
        assert!(body.step.is_none());

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "validation_error");
    }

    #[test]
    fn test_policy_blocked_message_lists_violations() {
        let err = EngineError::PolicyBlocked {
            step: Some("gate".into()),
            policy: "no_secrets".into(),
            violations: vec!["no_secrets:api_key".into()],
        };
        assert_eq!(err.kind().as_str(), "policy_blocked");
        assert!(err.to_string().contains("no_secrets:api_key"));
    }
}
