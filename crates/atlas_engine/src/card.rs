//! Card definitions - parsed and validated once, shared read-only.
//!
//! # File format
//!
//! One card per `.toml` / `.yaml` / `.yml` file:
//!
//! ```toml
//! name = "QBR"
//! version = "1.0"
//!
//! [inputs.accounts]
//! type = "list"
//!
//! [[steps]]
//! id = "ground"
//! kind = "retrieve"
//! target = "evidence.ground"
//! args = { query = "KPIs for ${inputs.accounts}", top_k = 5 }
//! ```
//!
//! # Arguments
//!
//! A string that is exactly `${root.path}` is a reference and resolves to the
//! referenced JSON value. A string mixing text and `${...}` is a template.
//! Arrays and objects are resolved element-wise. Everything else is a literal.
//! `root` is `inputs` or the id of an earlier step, so the plan is a DAG by
//! construction; this is checked here, not at run time.

use crate::backend::BackendRegistry;
use crate::policy::PolicyGate;
use atlas_protocol::{json_type_name, EngineError, FieldType, StepKind};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

pub const INPUTS_ROOT: &str = "inputs";

// =============================================================================
// References & argument values
// =============================================================================

/// `${root.path.to.field}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: String,
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty reference".to_string());
        }
        let mut parts = expr.split('.');
        let root = parts.next().unwrap_or_default().to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if root.is_empty() || path.iter().any(|p| p.is_empty()) {
            return Err(format!("malformed reference '${{{}}}'", expr));
        }
        Ok(Self { root, path })
    }

    pub fn is_input(&self) -> bool {
        self.root == INPUTS_ROOT
    }

    pub fn path_string(&self) -> String {
        self.path.join(".")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "${{{}}}", self.root)
        } else {
            write!(f, "${{{}.{}}}", self.root, self.path_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// A step argument after load-time parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Literal(Value),
    Ref(Reference),
    Template(Vec<Segment>),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => parse_string(s),
            Value::Array(items) => {
                let parsed = items.iter().map(ArgValue::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(|a| matches!(a, ArgValue::Literal(_))) {
                    Ok(ArgValue::Literal(value.clone()))
                } else {
                    Ok(ArgValue::List(parsed))
                }
            }
            Value::Object(map) => {
                let mut parsed = BTreeMap::new();
                for (k, v) in map {
                    parsed.insert(k.clone(), ArgValue::parse(v)?);
                }
                if parsed.values().all(|a| matches!(a, ArgValue::Literal(_))) {
                    Ok(ArgValue::Literal(value.clone()))
                } else {
                    Ok(ArgValue::Map(parsed))
                }
            }
            other => Ok(ArgValue::Literal(other.clone())),
        }
    }

    /// Every reference inside this argument, depth first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            ArgValue::Literal(_) => {}
            ArgValue::Ref(r) => out.push(r),
            ArgValue::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        out.push(r);
                    }
                }
            }
            ArgValue::List(items) => items.iter().for_each(|a| a.collect_refs(out)),
            ArgValue::Map(map) => map.values().for_each(|a| a.collect_refs(out)),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ArgValue::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Literal strings of a list argument; references are skipped.
    pub fn literal_strings(&self) -> Vec<&str> {
        match self {
            ArgValue::Literal(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).collect()
            }
            ArgValue::Literal(Value::String(s)) => vec![s.as_str()],
            ArgValue::List(items) => items
                .iter()
                .filter_map(|a| a.as_literal().and_then(Value::as_str))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Render back to the on-disk form.
    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::Ref(r) => Value::String(r.to_string()),
            ArgValue::Template(segments) => Value::String(
                segments
                    .iter()
                    .map(|s| match s {
                        Segment::Text(t) => t.clone(),
                        Segment::Ref(r) => r.to_string(),
                    })
                    .collect(),
            ),
            ArgValue::List(items) => Value::Array(items.iter().map(ArgValue::to_json).collect()),
            ArgValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn parse_string(s: &str) -> Result<ArgValue, String> {
    if !s.contains("${") {
        return Ok(ArgValue::Literal(Value::String(s.to_string())));
    }

    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated reference in '{}'", s))?;
        segments.push(Segment::Ref(Reference::parse(&after[..end])?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    if let [Segment::Ref(r)] = segments.as_slice() {
        return Ok(ArgValue::Ref(r.clone()));
    }
    Ok(ArgValue::Template(segments))
}

// =============================================================================
// Targets
// =============================================================================

/// Component a step invokes. Valid targets depend on the step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    EvidenceGround,
    EvidenceSnapshot,
    EvidenceWriteback,
    Router,
    Policy,
    Dossier,
}

impl Target {
    pub fn parse(kind: StepKind, name: &str) -> Option<Self> {
        match (kind, name) {
            (StepKind::Retrieve, "evidence.ground") => Some(Target::EvidenceGround),
            (StepKind::Retrieve, "evidence.snapshot") => Some(Target::EvidenceSnapshot),
            (StepKind::Retrieve, "evidence.writeback") => Some(Target::EvidenceWriteback),
            (StepKind::Dispatch, "router") => Some(Target::Router),
            (StepKind::Gate, "policy") => Some(Target::Policy),
            (StepKind::Compose, "dossier") => Some(Target::Dossier),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::EvidenceGround => "evidence.ground",
            Target::EvidenceSnapshot => "evidence.snapshot",
            Target::EvidenceWriteback => "evidence.writeback",
            Target::Router => "router",
            Target::Policy => "policy",
            Target::Dossier => "dossier",
        }
    }

    /// (required, optional) argument names; `None` accepts anything.
    fn arg_names(&self) -> Option<(&'static [&'static str], &'static [&'static str])> {
        match self {
            Target::EvidenceGround => Some((&["query"], &["top_k", "space"])),
            Target::EvidenceSnapshot => Some((&["space"], &[])),
            Target::EvidenceWriteback => Some((&["documents"], &[])),
            Target::Router => Some((
                &["task", "backends"],
                &["reference", "min_score", "timeout_ms"],
            )),
            Target::Policy => Some((&["subject", "policies"], &["halt_on"])),
            Target::Dossier => None,
        }
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// =============================================================================
// Card & step
// =============================================================================

fn yes() -> bool {
    true
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Declared input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "yes")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    id: String,
    kind: StepKind,
    target: String,
    #[serde(default = "yes")]
    required: bool,
    #[serde(default)]
    args: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CardFile {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    inputs: BTreeMap<String, InputField>,
    steps: Vec<StepFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub target: Target,
    pub required: bool,
    pub args: BTreeMap<String, ArgValue>,
}

impl Step {
    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }

    /// Ids of earlier steps this step reads from.
    pub fn depends_on(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .args
            .values()
            .flat_map(|a| a.references())
            .filter(|r| !r.is_input())
            .map(|r| r.root.clone())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Validated, immutable plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Card {
    pub name: String,
    pub version: String,
    pub description: String,
    pub inputs: BTreeMap<String, InputField>,
    pub steps: Vec<Step>,
}

/// Listing entry for `cards list`.
#[derive(Debug, Clone, Serialize)]
pub struct CardSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub steps: usize,
}

impl Card {
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let file: CardFile =
            toml::from_str(text).map_err(|e| EngineError::invalid_card("<toml>", e.to_string()))?;
        Self::from_file_model(file)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, EngineError> {
        let file: CardFile = serde_yaml::from_str(text)
            .map_err(|e| EngineError::invalid_card("<yaml>", e.to_string()))?;
        Self::from_file_model(file)
    }

    /// Load a card file, choosing the parser by extension.
    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let label = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::invalid_card(label.clone(), e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let parsed = match ext.as_str() {
            "toml" => Self::from_toml_str(&text),
            "yaml" | "yml" => Self::from_yaml_str(&text),
            other => {
                return Err(EngineError::invalid_card(
                    label,
                    format!("unsupported extension '{}'", other),
                ))
            }
        };
        parsed.map_err(|e| match e {
            EngineError::InvalidCard { card, detail } if card.starts_with('<') => {
                EngineError::invalid_card(label, detail)
            }
            other => other,
        })
    }

    fn from_file_model(file: CardFile) -> Result<Self, EngineError> {
        let name = file.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::invalid_card("<unnamed>", "card name must not be empty"));
        }
        let invalid = |detail: String| EngineError::invalid_card(name.clone(), detail);

        for (field, spec) in &file.inputs {
            if let Some(default) = &spec.default {
                if !spec.field_type.matches(default) {
                    return Err(invalid(format!(
                        "default for input '{}' is {}, expected {}",
                        field,
                        json_type_name(default),
                        spec.field_type
                    )));
                }
            }
        }

        if file.steps.is_empty() {
            return Err(invalid("card has no steps".to_string()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut steps = Vec::with_capacity(file.steps.len());

        for raw in file.steps {
            let id = raw.id.trim().to_string();
            if id.is_empty() || id.contains('.') || id == INPUTS_ROOT {
                return Err(invalid(format!("invalid step id '{}'", raw.id)));
            }
            if seen.contains(&id) {
                return Err(invalid(format!("duplicate step id '{}'", id)));
            }

            let target = Target::parse(raw.kind, &raw.target).ok_or_else(|| {
                invalid(format!(
                    "step '{}': target '{}' is not valid for kind '{}'",
                    id, raw.target, raw.kind
                ))
            })?;

            if let Some((required, optional)) = target.arg_names() {
                for arg in required {
                    if !raw.args.contains_key(*arg) {
                        return Err(invalid(format!("step '{}': missing argument '{}'", id, arg)));
                    }
                }
                for arg in raw.args.keys() {
                    if !required.contains(&arg.as_str()) && !optional.contains(&arg.as_str()) {
                        return Err(invalid(format!(
                            "step '{}': unknown argument '{}' for {}",
                            id,
                            arg,
                            target.as_str()
                        )));
                    }
                }
            }

            let mut args = BTreeMap::new();
            for (arg, value) in &raw.args {
                let parsed = ArgValue::parse(value)
                    .map_err(|e| invalid(format!("step '{}' argument '{}': {}", id, arg, e)))?;
                for reference in parsed.references() {
                    check_reference(reference, &file.inputs, &seen, &id).map_err(&invalid)?;
                }
                args.insert(arg.clone(), parsed);
            }

            let step = Step {
                id: id.clone(),
                kind: raw.kind,
                target,
                required: raw.required,
                args,
            };
            check_literal_args(&step).map_err(&invalid)?;

            seen.insert(id);
            steps.push(step);
        }

        Ok(Self {
            name,
            version: file.version,
            description: file.description,
            inputs: file.inputs,
            steps,
        })
    }

    pub fn summary(&self) -> CardSummary {
        CardSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            steps: self.steps.len(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Backend ids named literally by dispatch steps, with the step id.
    pub fn literal_backends(&self) -> Vec<(&str, &str)> {
        self.literal_list(Target::Router, "backends")
    }

    /// Policy names named literally by gate steps, with the step id.
    pub fn literal_policies(&self) -> Vec<(&str, &str)> {
        self.literal_list(Target::Policy, "policies")
    }

    fn literal_list(&self, target: Target, arg: &str) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|s| s.target == target)
            .flat_map(|s| {
                s.arg(arg)
                    .map(ArgValue::literal_strings)
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |name| (s.id.as_str(), name))
            })
            .collect()
    }

    /// Every literal backend and policy must be registered.
    pub fn check_against(
        &self,
        backends: &BackendRegistry,
        policies: &PolicyGate,
    ) -> Result<(), EngineError> {
        for (step, backend) in self.literal_backends() {
            if !backends.contains(backend) {
                return Err(EngineError::UnknownBackend {
                    backend: backend.to_string(),
                    step: Some(step.to_string()),
                });
            }
        }
        for (step, policy) in self.literal_policies() {
            if !policies.contains(policy) {
                return Err(EngineError::UnknownPolicy {
                    policy: policy.to_string(),
                    step: Some(step.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Check `payload` against the declared inputs and apply defaults.
    ///
    /// Fields are checked in name order so the first reported field is stable.
    /// Undeclared fields pass through untouched.
    pub fn validate_inputs(&self, payload: &Value) -> Result<Value, EngineError> {
        let mut resolved = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(EngineError::validation(
                    INPUTS_ROOT,
                    format!("expected an object, got {}", json_type_name(other)),
                ))
            }
        };

        for (field, spec) in &self.inputs {
            match resolved.get(field) {
                Some(value) if !value.is_null() => {
                    if !spec.field_type.matches(value) {
                        return Err(EngineError::validation(
                            field.clone(),
                            format!(
                                "expected {}, got {}",
                                spec.field_type,
                                json_type_name(value)
                            ),
                        ));
                    }
                }
                _ => match &spec.default {
                    Some(default) => {
                        resolved.insert(field.clone(), default.clone());
                    }
                    None if spec.required => {
                        return Err(EngineError::validation(
                            field.clone(),
                            "missing required field",
                        ));
                    }
                    None => {}
                },
            }
        }

        Ok(Value::Object(resolved))
    }
}

fn check_reference(
    reference: &Reference,
    inputs: &BTreeMap<String, InputField>,
    earlier: &HashSet<String>,
    step_id: &str,
) -> Result<(), String> {
    if reference.is_input() {
        let field = reference
            .path
            .first()
            .ok_or_else(|| format!("step '{}': {} must name an input field", step_id, reference))?;
        if !inputs.contains_key(field) {
            return Err(format!(
                "step '{}': {} refers to undeclared input '{}'",
                step_id, reference, field
            ));
        }
        return Ok(());
    }

    if reference.root == step_id {
        return Err(format!("step '{}': {} refers to itself", step_id, reference));
    }
    if !earlier.contains(&reference.root) {
        return Err(format!(
            "step '{}': {} refers to '{}', which is not an earlier step",
            step_id, reference, reference.root
        ));
    }
    Ok(())
}

/// Shape checks on literal arguments; referenced values are checked at run time.
fn check_literal_args(step: &Step) -> Result<(), String> {
    let literal = |name: &str| step.arg(name).and_then(ArgValue::as_literal);

    match step.target {
        Target::Router => {
            if let Some(value) = literal("backends") {
                let ok = value
                    .as_array()
                    .map(|a| !a.is_empty() && a.iter().all(Value::is_string))
                    .unwrap_or(false);
                if !ok {
                    return Err(format!(
                        "step '{}': backends must be a non-empty list of ids",
                        step.id
                    ));
                }
                let mut ids: Vec<&str> = string_items(value);
                ids.sort_unstable();
                if ids.windows(2).any(|w| w[0] == w[1]) {
                    return Err(format!("step '{}': backend listed twice", step.id));
                }
            }
            if let Some(value) = literal("timeout_ms") {
                if value.as_u64().filter(|ms| *ms > 0).is_none() {
                    return Err(format!("step '{}': timeout_ms must be a positive integer", step.id));
                }
            }
            if let Some(value) = literal("min_score") {
                if !value.is_number() {
                    return Err(format!("step '{}': min_score must be a number", step.id));
                }
            }
        }
        Target::Policy => {
            if let Some(value) = literal("policies") {
                let ok = value
                    .as_array()
                    .map(|a| !a.is_empty() && a.iter().all(Value::is_string))
                    .unwrap_or(false);
                if !ok {
                    return Err(format!(
                        "step '{}': policies must be a non-empty list of names",
                        step.id
                    ));
                }
            }
            if let Some(value) = literal("halt_on") {
                let ok = value
                    .as_array()
                    .map(|a| a.iter().all(|v| matches!(v.as_str(), Some("redacted" | "pass"))))
                    .unwrap_or(false);
                if !ok {
                    return Err(format!(
                        "step '{}': halt_on accepts 'redacted' and 'pass'",
                        step.id
                    ));
                }
            }
        }
        Target::EvidenceGround => {
            if let Some(value) = literal("top_k") {
                if value.as_u64().filter(|k| *k > 0).is_none() {
                    return Err(format!("step '{}': top_k must be a positive integer", step.id));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn string_items(value: &Value) -> Vec<&str> {
    value
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}
