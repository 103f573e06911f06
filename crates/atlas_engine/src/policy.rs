//! Policy Gate - block, redact or pass JSON payloads.
//!
//! A policy is an ordered list of rules; a rule pairs a matcher (built-in PII
//! detector or custom regex) with an action. Enforcement walks the requested
//! policies in order:
//!
//! - the first `block` rule that matches ends evaluation with `blocked`
//! - `redact` rules replace matches with the mask token, and later rules see
//!   the already-masked payload
//! - strings are scanned recursively through arrays and objects; keys are kept
//!
//! Definitions are compiled once at startup and never mutated.

use crate::metrics::METRICS;
use atlas_protocol::defaults::DEFAULT_MASK_TOKEN;
use atlas_protocol::{EngineError, PolicyResult, Verdict};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

// =============================================================================
// Detectors
// =============================================================================

/// Built-in PII detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Email,
    Ssn,
    CreditCard,
    Phone,
}

impl Detector {
    /// Evaluation order for blanket PII masking. Card numbers go before
    /// phones so a valid card is masked whole. Phones are anchored at both
    /// ends, so longer digit runs that fail the Luhn check stay intact.
    pub const ALL: [Detector; 4] = [
        Detector::Email,
        Detector::Ssn,
        Detector::CreditCard,
        Detector::Phone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Detector::Email => "email",
            Detector::Ssn => "ssn",
            Detector::CreditCard => "credit_card",
            Detector::Phone => "phone",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            Detector::Email => r"[\w.%+-]+@[\w.-]+\.[A-Za-z]{2,}",
            Detector::Ssn => r"\b\d{3}-\d{2}-\d{4}\b",
            Detector::CreditCard => r"\b(?:\d[ -]*?){13,19}\b",
            Detector::Phone => {
                r"(?:\+1[-.\s]?|\b1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b"
            }
        }
    }

    fn matcher(&self) -> &'static Matcher {
        static COMPILED: OnceLock<Vec<Matcher>> = OnceLock::new();
        let compiled = COMPILED.get_or_init(|| {
            Detector::ALL
                .iter()
                .map(|d| Matcher {
                    regex: Regex::new(d.pattern()).expect("built-in detector pattern"),
                    luhn: *d == Detector::CreditCard,
                })
                .collect()
        });
        let index = Detector::ALL
            .iter()
            .position(|d| d == self)
            .unwrap_or_default();
        &compiled[index]
    }
}

/// True when any built-in detector finds PII in `text`.
pub fn contains_pii(text: &str) -> bool {
    Detector::ALL.iter().any(|d| d.matcher().is_match(text))
}

/// Luhn checksum over the digits of `candidate`, ignoring separators.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[derive(Debug, Clone)]
struct Matcher {
    regex: Regex,
    /// Only count matches that pass the Luhn check.
    luhn: bool,
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        if self.luhn {
            self.regex.find_iter(text).any(|m| luhn_valid(m.as_str()))
        } else {
            self.regex.is_match(text)
        }
    }

    /// Mask every match, returning the new text and the number of masks.
    fn mask(&self, text: &str, token: &str) -> (String, usize) {
        let mut count = 0;
        let masked = self.regex.replace_all(text, |caps: &regex::Captures<'_>| {
            let found = &caps[0];
            if self.luhn && !luhn_valid(found) {
                found.to_string()
            } else {
                count += 1;
                token.to_string()
            }
        });
        (masked.into_owned(), count)
    }
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Redact,
}

/// One rule as declared in configuration. Exactly one of `detector` and
/// `pattern` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<Detector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl RuleSpec {
    pub fn detector(action: RuleAction, detector: Detector) -> Self {
        Self {
            id: detector.as_str().to_string(),
            action,
            detector: Some(detector),
            pattern: None,
        }
    }

    pub fn pattern(id: impl Into<String>, action: RuleAction, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            detector: None,
            pattern: Some(pattern.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    /// Report `redacted` instead of `pass` when this policy masks something.
    #[serde(default)]
    pub report_redactions: bool,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// `allow_all` and `no_pii`, always defined.
pub fn builtin_policies() -> Vec<PolicySpec> {
    vec![
        PolicySpec {
            name: "allow_all".to_string(),
            report_redactions: false,
            rules: Vec::new(),
        },
        PolicySpec {
            name: "no_pii".to_string(),
            report_redactions: false,
            rules: Detector::ALL
                .iter()
                .map(|d| RuleSpec::detector(RuleAction::Redact, *d))
                .collect(),
        },
    ]
}

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    action: RuleAction,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    name: String,
    report_redactions: bool,
    rules: Vec<CompiledRule>,
}

fn compile(spec: &PolicySpec) -> Result<CompiledPolicy, EngineError> {
    let mut rules = Vec::with_capacity(spec.rules.len());
    for rule in &spec.rules {
        let matcher = match (&rule.detector, &rule.pattern) {
            (Some(detector), None) => detector.matcher().clone(),
            (None, Some(pattern)) => Matcher {
                regex: Regex::new(pattern).map_err(|e| {
                    EngineError::config(format!(
                        "policy '{}' rule '{}': invalid pattern: {}",
                        spec.name, rule.id, e
                    ))
                })?,
                luhn: false,
            },
            _ => {
                return Err(EngineError::config(format!(
                    "policy '{}' rule '{}' needs exactly one of detector or pattern",
                    spec.name, rule.id
                )))
            }
        };
        rules.push(CompiledRule {
            id: rule.id.clone(),
            action: rule.action,
            matcher,
        });
    }
    Ok(CompiledPolicy {
        name: spec.name.clone(),
        report_redactions: spec.report_redactions,
        rules,
    })
}

// =============================================================================
// Gate
// =============================================================================

#[derive(Debug, Clone)]
pub struct PolicyGate {
    policies: HashMap<String, CompiledPolicy>,
    mask_token: String,
}

impl PolicyGate {
    /// Built-in policies plus `extra`. Redefining a name is a config error.
    pub fn new(extra: &[PolicySpec], mask_token: impl Into<String>) -> Result<Self, EngineError> {
        let mask_token = mask_token.into();
        if mask_token.is_empty() {
            return Err(EngineError::config("mask token must not be empty"));
        }

        let mut policies = HashMap::new();
        for spec in builtin_policies().iter().chain(extra.iter()) {
            if policies.contains_key(&spec.name) {
                return Err(EngineError::config(format!(
                    "policy '{}' defined twice",
                    spec.name
                )));
            }
            debug!(policy = %spec.name, rules = spec.rules.len(), "Compiling policy");
            policies.insert(spec.name.clone(), compile(spec)?);
        }

        Ok(Self {
            policies,
            mask_token,
        })
    }

    pub fn builtin() -> Self {
        // built-in specs always compile
        Self::new(&[], DEFAULT_MASK_TOKEN).unwrap_or_else(|_| Self {
            policies: HashMap::new(),
            mask_token: DEFAULT_MASK_TOKEN.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn mask_token(&self) -> &str {
        &self.mask_token
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Apply `policy_names` to `payload` in order.
    ///
    /// Unknown policy names fail before anything is evaluated.
    pub fn enforce(
        &self,
        payload: &Value,
        policy_names: &[String],
    ) -> Result<PolicyResult, EngineError> {
        let policies = policy_names
            .iter()
            .map(|name| {
                self.policies
                    .get(name)
                    .ok_or_else(|| EngineError::unknown_policy(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        METRICS.inc_policy_checks();

        let mut current = payload.clone();
        let mut violations = Vec::new();
        let mut reported = false;

        for policy in policies {
            for rule in &policy.rules {
                let violation = format!("{}:{}", policy.name, rule.id);
                match rule.action {
                    RuleAction::Block => {
                        if value_matches(&current, &rule.matcher) {
                            violations.push(violation);
                            debug!(policy = %policy.name, rule = %rule.id, "Payload blocked");
                            return Ok(PolicyResult {
                                verdict: Verdict::Blocked,
                                redacted_payload: None,
                                violations,
                            });
                        }
                    }
                    RuleAction::Redact => {
                        let (masked, count) = mask_value(&current, &rule.matcher, &self.mask_token);
                        if count > 0 {
                            METRICS.add_redactions(count as u64);
                            violations.push(violation);
                            reported |= policy.report_redactions;
                            current = masked;
                        }
                    }
                }
            }
        }

        Ok(PolicyResult {
            verdict: if reported { Verdict::Redacted } else { Verdict::Pass },
            redacted_payload: Some(current),
            violations,
        })
    }

    /// Mask every built-in PII detector match in `payload`.
    pub fn redact(&self, payload: &Value) -> Value {
        let mut current = payload.clone();
        for detector in Detector::ALL {
            let (masked, count) = mask_value(&current, detector.matcher(), &self.mask_token);
            if count > 0 {
                METRICS.add_redactions(count as u64);
                current = masked;
            }
        }
        current
    }
}

fn value_matches(value: &Value, matcher: &Matcher) -> bool {
    match value {
        Value::String(s) => matcher.is_match(s),
        Value::Array(items) => items.iter().any(|v| value_matches(v, matcher)),
        Value::Object(map) => map.values().any(|v| value_matches(v, matcher)),
        // Numbers, bools, null are never scanned
        _ => false,
    }
}

fn mask_value(value: &Value, matcher: &Matcher, token: &str) -> (Value, usize) {
    match value {
        Value::String(s) => {
            let (masked, count) = matcher.mask(s, token);
            (Value::String(masked), count)
        }
        Value::Array(items) => {
            let mut total = 0;
            let masked = items
                .iter()
                .map(|v| {
                    let (m, n) = mask_value(v, matcher, token);
                    total += n;
                    m
                })
                .collect();
            (Value::Array(masked), total)
        }
        Value::Object(map) => {
            let mut total = 0;
            let mut masked = serde_json::Map::new();
            for (k, v) in map {
                let (m, n) = mask_value(v, matcher, token);
                total += n;
                masked.insert(k.clone(), m);
            }
            (Value::Object(masked), total)
        }
        _ => (value.clone(), 0),
    }
}
