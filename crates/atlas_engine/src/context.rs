//! Per-run execution context and argument resolution.
//!
//! Owned by exactly one run. Holds the validated inputs, each finished step's
//! output and the evidence documents gathered so far.

use crate::card::{ArgValue, Reference, Segment};
use atlas_protocol::{Document, EngineError};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct ExecutionContext {
    inputs: Value,
    outputs: HashMap<String, Value>,
    evidence: Vec<Document>,
    seen_evidence: HashSet<i64>,
}

impl ExecutionContext {
    pub fn new(inputs: Value) -> Self {
        Self {
            inputs,
            outputs: HashMap::new(),
            evidence: Vec::new(),
            seen_evidence: HashSet::new(),
        }
    }

    pub fn record_output(&mut self, step_id: &str, output: Value) {
        self.outputs.insert(step_id.to_string(), output);
    }

    /// Keep documents in first-seen order, once each.
    pub fn add_evidence(&mut self, documents: &[Document]) {
        for doc in documents {
            if self.seen_evidence.insert(doc.id) {
                self.evidence.push(doc.clone());
            }
        }
    }

    pub fn into_evidence(self) -> Vec<Document> {
        self.evidence
    }

    pub fn resolve(&self, arg: &ArgValue) -> Result<Value, EngineError> {
        match arg {
            ArgValue::Literal(value) => Ok(value.clone()),
            ArgValue::Ref(reference) => self.lookup(reference).cloned(),
            ArgValue::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(reference) => out.push_str(&render(self.lookup(reference)?)),
                    }
                }
                Ok(Value::String(out))
            }
            ArgValue::List(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ArgValue::Map(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.resolve(value)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    fn lookup(&self, reference: &Reference) -> Result<&Value, EngineError> {
        let root = if reference.is_input() {
            &self.inputs
        } else {
            self.outputs.get(&reference.root).ok_or_else(|| {
                EngineError::execution(format!(
                    "step '{}' has not produced output",
                    reference.root
                ))
            })?
        };

        let mut current = root;
        for (depth, part) in reference.path.iter().enumerate() {
            let next = match current {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| {
                let walked = reference.path[..=depth].join(".");
                if reference.is_input() {
                    EngineError::execution(format!("input field '{}' not found", walked))
                } else {
                    EngineError::execution(format!(
                        "field '{}' not found in output of step '{}'",
                        walked, reference.root
                    ))
                }
            })?;
        }
        Ok(current)
    }
}

/// Text form of a value spliced into a template.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arg(value: Value) -> ArgValue {
        ArgValue::parse(&value).unwrap()
    }

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(json!({
            "accounts": ["ACME", "Globex"],
            "time_window": "Q3",
            "limits": {"top": 3}
        }));
        ctx.record_output(
            "summarise",
            json!({"winner": "local_echo", "payload": "Revenue grew", "scores": {"local_echo": 0.9}}),
        );
        ctx.record_output("optional", Value::Null);
        ctx
    }

    #[test]
    fn test_whole_value_reference_keeps_type() {
        let ctx = context();
        assert_eq!(ctx.resolve(&arg(json!("${inputs.accounts}"))).unwrap(), json!(["ACME", "Globex"]));
        assert_eq!(ctx.resolve(&arg(json!("${inputs.limits.top}"))).unwrap(), json!(3));
        assert_eq!(
            ctx.resolve(&arg(json!("${summarise.scores.local_echo}"))).unwrap(),
            json!(0.9)
        );
    }

    #[test]
    fn test_template_rendering() {
        let ctx = context();
        assert_eq!(
            ctx.resolve(&arg(json!("KPIs for ${inputs.accounts} in ${inputs.time_window}"))).unwrap(),
            json!("KPIs for ACME, Globex in Q3")
        );
        assert_eq!(
            ctx.resolve(&arg(json!("top=${inputs.limits.top}"))).unwrap(),
            json!("top=3")
        );
    }

    #[test]
    fn test_nested_structures_resolve() {
        let ctx = context();
        let resolved = ctx
            .resolve(&arg(json!({
                "summary": "${summarise.payload}",
                "meta": ["${summarise.winner}", 1]
            })))
            .unwrap();
        assert_eq!(
            resolved,
            json!({"summary": "Revenue grew", "meta": ["local_echo", 1]})
        );
    }

    #[test]
    fn test_array_index_in_path() {
        let ctx = context();
        assert_eq!(ctx.resolve(&arg(json!("${inputs.accounts.1}"))).unwrap(), json!("Globex"));
    }

    #[test]
    fn test_missing_field_is_execution_error() {
        let ctx = context();
        let err = ctx.resolve(&arg(json!("${summarise.nope}"))).unwrap_err();
        assert_eq!(
            err,
            EngineError::execution("field 'nope' not found in output of step 'summarise'")
        );

        // output of a skipped optional step is null
        let err = ctx.resolve(&arg(json!("${optional.payload}"))).unwrap_err();
        assert!(err.to_string().contains("optional"));
    }

    #[test]
    fn test_evidence_deduplicated() {
        let mut ctx = ExecutionContext::new(json!({}));
        let doc = Document {
            id: 7,
            space: "kpi".into(),
            content: "ACME revenue".into(),
            created_at: chrono::Utc::now(),
        };
        ctx.add_evidence(&[doc.clone()]);
        ctx.add_evidence(&[doc]);
        assert_eq!(ctx.into_evidence().len(), 1);
    }
}
