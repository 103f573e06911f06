//! Arbiter - score candidates against a weighted rubric and pick a winner.
//!
//! Score = w_f * faithfulness + w_p * (1 - pii) + w_d * depth
//!
//! - faithfulness: share of reference terms present in the payload
//! - pii: 1 when any built-in detector fires
//! - depth: word count relative to `depth_target_words`, capped at 1
//!
//! Errored candidates score 0, stay in `scores` and never win. Ties go to the
//! earliest-registered backend.

use crate::backend::BackendRegistry;
use crate::policy::contains_pii;
use atlas_db::query_terms;
use atlas_protocol::defaults::{
    DEFAULT_DEPTH_TARGET_WORDS, DEFAULT_DEPTH_WEIGHT, DEFAULT_FAITHFULNESS_WEIGHT,
    DEFAULT_PII_WEIGHT, NO_VIABLE_CANDIDATE_MESSAGE,
};
use atlas_protocol::{Candidate, EngineError, Judgement, SelfCheck};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RubricWeights {
    pub faithfulness: f64,
    pub pii: f64,
    pub depth: f64,
    pub depth_target_words: usize,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            faithfulness: DEFAULT_FAITHFULNESS_WEIGHT,
            pii: DEFAULT_PII_WEIGHT,
            depth: DEFAULT_DEPTH_WEIGHT,
            depth_target_words: DEFAULT_DEPTH_TARGET_WORDS,
        }
    }
}

impl RubricWeights {
    pub fn validate(&self) -> Result<(), EngineError> {
        let weights = [self.faithfulness, self.pii, self.depth];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::config(
                "rubric weights must be finite and non-negative",
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(EngineError::config("at least one rubric weight must be positive"));
        }
        if self.depth_target_words == 0 {
            return Err(EngineError::config("depth_target_words must be positive"));
        }
        Ok(())
    }
}

/// Weights plus the reference text faithfulness is measured against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rubric {
    pub weights: RubricWeights,
    pub reference: String,
}

impl Rubric {
    pub fn new(weights: RubricWeights) -> Self {
        Self {
            weights,
            reference: String::new(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }
}

/// Per-heuristic values behind one candidate's score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub faithfulness: f64,
    pub pii: bool,
    pub depth: f64,
    pub total: f64,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Score one payload. Pure function of its inputs.
pub fn score_payload(payload: &str, rubric: &Rubric) -> ScoreBreakdown {
    let reference = query_terms(&rubric.reference);
    let faithfulness = if reference.is_empty() {
        1.0
    } else {
        let present = query_terms(payload);
        reference.iter().filter(|t| present.contains(*t)).count() as f64 / reference.len() as f64
    };

    let pii = contains_pii(payload);
    let words = payload.split_whitespace().count();
    let depth = (words as f64 / rubric.weights.depth_target_words.max(1) as f64).min(1.0);

    let w = &rubric.weights;
    let total = w.faithfulness * faithfulness + w.pii * if pii { 0.0 } else { 1.0 } + w.depth * depth;

    ScoreBreakdown {
        faithfulness,
        pii,
        depth,
        total: round4(total),
    }
}

#[derive(Debug, Clone)]
pub struct Arbiter {
    registry: Arc<BackendRegistry>,
}

impl Arbiter {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Rank `candidates` and select a winner.
    ///
    /// Fails with `no viable candidate` when every candidate errored.
    pub fn adjudicate(
        &self,
        candidates: &[Candidate],
        rubric: &Rubric,
    ) -> Result<Judgement, EngineError> {
        // registration order first, unregistered ids after in input order
        let mut ordered: Vec<(usize, usize, &Candidate)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let rank = self.registry.position(&c.backend_id).unwrap_or(usize::MAX);
                (rank, i, c)
            })
            .collect();
        ordered.sort_by_key(|(rank, i, _)| (*rank, *i));

        // scores are keyed by backend id
        let mut seen: HashSet<&str> = HashSet::with_capacity(candidates.len());
        for candidate in candidates {
            if !seen.insert(candidate.backend_id.as_str()) {
                return Err(EngineError::validation(
                    "candidates",
                    format!("backend '{}' appears more than once", candidate.backend_id),
                ));
            }
        }

        let mut scores = BTreeMap::new();
        let mut best: Option<(&Candidate, ScoreBreakdown)> = None;
        let mut viable = Vec::new();

        for (_, _, candidate) in &ordered {
            if !candidate.is_viable() {
                scores.insert(candidate.backend_id.clone(), 0.0);
                continue;
            }
            let breakdown = score_payload(&candidate.payload, rubric);
            scores.insert(candidate.backend_id.clone(), breakdown.total);
            viable.push(candidate.backend_id.clone());

            let better = match &best {
                Some((_, current)) => breakdown.total > current.total,
                None => true,
            };
            if better {
                best = Some((*candidate, breakdown));
            }
        }

        let (winner, breakdown) =
            best.ok_or_else(|| EngineError::execution(NO_VIABLE_CANDIDATE_MESSAGE))?;

        let dissent: Vec<String> = viable
            .iter()
            .filter(|id| **id != winner.backend_id)
            .cloned()
            .collect();

        let rationale = format!(
            "{} scored {:.4} (faithfulness {:.2}, pii {}, depth {:.2}); {} of {} candidates viable",
            winner.backend_id,
            breakdown.total,
            breakdown.faithfulness,
            if breakdown.pii { "present" } else { "absent" },
            breakdown.depth,
            viable.len(),
            candidates.len(),
        );
        debug!(winner = %winner.backend_id, score = breakdown.total, "Adjudicated");

        Ok(Judgement {
            winner: winner.backend_id.clone(),
            payload: winner.payload.clone(),
            scores,
            rationale,
            dissent,
            candidates: ordered.iter().map(|(_, _, c)| (*c).clone()).collect(),
        })
    }
}

/// Heuristic quality checks over a single output.
///
/// Known checks: `faithfulness`, `pii`, `reasoning`. Unknown checks score 0.5.
/// The overall score is the mean, or 1.0 when no checks are requested.
pub fn self_check(output: &str, checks: &[String]) -> SelfCheck {
    let mut details = BTreeMap::new();
    for check in checks {
        let value = match check.as_str() {
            "faithfulness" => {
                if output.to_lowercase().contains("hallucinate") {
                    0.0
                } else {
                    1.0
                }
            }
            "pii" => {
                if contains_pii(output) {
                    0.0
                } else {
                    1.0
                }
            }
            "reasoning" => {
                if output.split_whitespace().count() > 20 {
                    1.0
                } else {
                    0.5
                }
            }
            _ => 0.5,
        };
        details.insert(check.clone(), value);
    }

    let score = if checks.is_empty() {
        1.0
    } else {
        // mean over requested checks, duplicates included
        let sum: f64 = checks.iter().filter_map(|c| details.get(c)).sum();
        round4(sum / checks.len() as f64)
    };

    SelfCheck { score, details }
}
