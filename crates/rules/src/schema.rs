//! Rule document JSON surface.
//!
//! A rule file is a single UTF-8 JSON object with exactly one member whose
//! name is the rule kind:
//!
//! ```json
//! {"threshold": {
//!     "name": "simplethreshold",
//!     "class": "example class",
//!     "categories": ["CAT_ALL"],
//!     "metrics": "abc",
//!     "assets": "fff",
//!     "results": [{"low_critical": {"action": [{"action": "EMAIL"}],
//!                                   "description": "low critical"}}],
//!     "values": [{"low_critical": "30"}],
//!     "evaluation": "fn main(v) ... end"
//! }}
//! ```
//!
//! `metrics` and `assets` accept a bare string or an array; `results` and
//! `values` are arrays of single-member objects so label order survives the
//! round trip. Actions accept the legacy bare-string form and the object
//! form; `GPO_INTERACTION` objects are normalized to
//! `GPO_INTERACTION:<asset>:<mode>` strings on load.

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::warn;

use vigil_core::error::EngineError;

// ── Document types ──────────────────────────────────────────────────

/// One named branch of a rule.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    pub severity: String,
    pub description: String,
    /// Normalized action tokens (`EMAIL`, `SMS`, `GPO_INTERACTION:<asset>:<mode>`).
    pub actions: Vec<String>,
    pub threshold_name: String,
}

/// Parsed rule document, kind-agnostic.
///
/// Kind-specific invariants are enforced by `rule::Rule`, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDoc {
    pub kind: String,
    pub name: String,
    pub description: String,
    pub class: String,
    pub categories: Vec<String>,
    pub metrics: Vec<String>,
    pub assets: Vec<String>,
    pub results: IndexMap<String, Outcome>,
    pub variables: IndexMap<String, String>,
    pub expression: String,
    pub outcome_items: usize,
    pub source: String,
    pub values_unit: String,
    pub hierarchy: String,
    /// Device families a flexible template applies to.
    pub models: Vec<String>,
}

// ── Field extraction helpers ────────────────────────────────────────

fn mandatory_str(obj: &Map<String, Value>, key: &str) -> Result<String, EngineError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EngineError::Json(format!("'{}' must be a string", key))),
        None => Err(EngineError::Json(format!("missing mandatory field '{}'", key))),
    }
}

fn optional_str(obj: &Map<String, Value>, key: &str) -> Result<String, EngineError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EngineError::Json(format!("'{}' must be a string", key))),
        None => Ok(String::new()),
    }
}

fn string_item(value: &Value, key: &str) -> Result<String, EngineError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(EngineError::Json(format!(
            "'{}' items must be strings",
            key
        ))),
    }
}

fn mandatory_array(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, EngineError> {
    match obj.get(key) {
        Some(Value::Array(items)) => items.iter().map(|v| string_item(v, key)).collect(),
        Some(_) => Err(EngineError::Json(format!("'{}' must be an array", key))),
        None => Err(EngineError::Json(format!("missing mandatory field '{}'", key))),
    }
}

fn optional_array(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, EngineError> {
    match obj.get(key) {
        Some(_) => mandatory_array(obj, key),
        None => Ok(Vec::new()),
    }
}

/// `metrics` and `assets` accept `"abc"` as shorthand for `["abc"]`.
fn mandatory_array_or_value(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, EngineError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items.iter().map(|v| string_item(v, key)).collect(),
        Some(_) => Err(EngineError::Json(format!(
            "'{}' must be a string or an array",
            key
        ))),
        None => Err(EngineError::Json(format!("missing mandatory field '{}'", key))),
    }
}

// ── Outcome parsing ─────────────────────────────────────────────────

fn parse_action(value: &Value) -> Result<String, EngineError> {
    match value {
        // legacy format: ["EMAIL", "SMS"]
        Value::String(s) => Ok(s.clone()),
        // object format: [{"action": "EMAIL"}, {"action": "GPO_INTERACTION", ...}]
        Value::Object(obj) => {
            let kind = mandatory_str(obj, "action")?;
            if kind == "GPO_INTERACTION" {
                let asset = mandatory_str(obj, "asset")?;
                let mode = mandatory_str(obj, "mode")?;
                Ok(format!("{}:{}:{}", kind, asset, mode))
            } else {
                if kind != "EMAIL" && kind != "SMS" {
                    warn!(action = %kind, "unknown action type");
                }
                Ok(kind)
            }
        }
        _ => Err(EngineError::Json("invalid action format".into())),
    }
}

fn parse_outcome(label: &str, value: &Value) -> Result<Outcome, EngineError> {
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::Json(format!("result '{}' must be an object", label)))?;

    let mut actions = Vec::new();
    if let Some(list) = obj.get("action") {
        let list = list
            .as_array()
            .ok_or_else(|| EngineError::Json("'action' must be an array".into()))?;
        for item in list {
            actions.push(parse_action(item)?);
        }
    }

    let mut severity = optional_str(obj, "severity")?;
    if severity.is_empty() {
        // Threshold-band labels carry an implied severity.
        severity = match label {
            "low_critical" | "high_critical" => "CRITICAL".to_string(),
            "low_warning" | "high_warning" => "WARNING".to_string(),
            _ => {
                return Err(EngineError::Semantic(format!(
                    "result '{}' has no severity",
                    label
                )))
            }
        };
    }

    Ok(Outcome {
        severity,
        description: optional_str(obj, "description")?,
        actions,
        threshold_name: optional_str(obj, "threshold_name")?,
    })
}

/// Parse the `results` array of single-member objects.
fn parse_results(value: &Value) -> Result<IndexMap<String, Outcome>, EngineError> {
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::Json("'results' must be an array".into()))?;

    let mut results = IndexMap::new();
    for item in items {
        let obj = item
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| EngineError::Json("each result must have exactly one member".into()))?;
        let (label, body) = obj.iter().next().expect("checked single member");
        results.insert(label.clone(), parse_outcome(label, body)?);
    }
    Ok(results)
}

/// Parse the `values` array of single-member objects.
fn parse_values(value: &Value) -> Result<IndexMap<String, String>, EngineError> {
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::Json("'values' must be an array".into()))?;

    let mut variables = IndexMap::new();
    for item in items {
        let obj = item
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| EngineError::Json("each value must have exactly one member".into()))?;
        let (name, raw) = obj.iter().next().expect("checked single member");
        variables.insert(name.clone(), string_item(raw, "values")?);
    }
    Ok(variables)
}

// ── Document parsing ────────────────────────────────────────────────

/// Parse a rule document from JSON text.
pub fn parse_rule_doc(text: &str) -> Result<RuleDoc, EngineError> {
    let root: Value = serde_json::from_str(text)?;
    parse_rule_value(&root)
}

/// Parse a rule document from an already-decoded JSON value.
pub fn parse_rule_value(root: &Value) -> Result<RuleDoc, EngineError> {
    let root = root
        .as_object()
        .ok_or_else(|| EngineError::Json("rule document root must be an object".into()))?;
    if root.len() != 1 {
        return Err(EngineError::Json(
            "rule document root must have exactly one member keyed by the rule kind".into(),
        ));
    }
    let (kind, body) = root.iter().next().expect("checked single member");
    let body = body
        .as_object()
        .ok_or_else(|| EngineError::Json(format!("'{}' body must be an object", kind)))?;

    let results = parse_results(
        body.get("results")
            .ok_or_else(|| EngineError::Json("missing mandatory field 'results'".into()))?,
    )?;

    let variables = match body.get("values") {
        Some(v) => parse_values(v)?,
        None => IndexMap::new(),
    };

    let outcome_items = match body.get("outcome_item_count") {
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|&n| n > 0)
            .ok_or_else(|| EngineError::Semantic("'outcome_item_count' must be positive".into()))?
            as usize,
        Some(_) => return Err(EngineError::Json("'outcome_item_count' must be an integer".into())),
        None => 1,
    };

    Ok(RuleDoc {
        kind: kind.clone(),
        name: mandatory_str(body, "name")?,
        description: optional_str(body, "description")?,
        class: optional_str(body, "class")?,
        categories: mandatory_array(body, "categories")?,
        metrics: mandatory_array_or_value(body, "metrics")?,
        assets: mandatory_array_or_value(body, "assets")?,
        results,
        variables,
        expression: optional_str(body, "evaluation")?,
        outcome_items,
        source: optional_str(body, "source")?,
        values_unit: optional_str(body, "values_unit")?,
        hierarchy: optional_str(body, "hierarchy")?,
        models: optional_array(body, "models")?,
    })
}

// ── Serialization ───────────────────────────────────────────────────

fn action_to_value(action: &str) -> Value {
    if let Some(rest) = action.strip_prefix("GPO_INTERACTION:") {
        // GPO_INTERACTION:<asset>:<mode>; the mode never contains ':'.
        let (asset, mode) = rest.rsplit_once(':').unwrap_or((rest, ""));
        json!({"action": "GPO_INTERACTION", "asset": asset, "mode": mode})
    } else {
        json!({ "action": action })
    }
}

fn outcome_to_value(outcome: &Outcome) -> Value {
    json!({
        "action": outcome.actions.iter().map(|a| action_to_value(a)).collect::<Vec<_>>(),
        "severity": outcome.severity,
        "description": outcome.description,
        "threshold_name": outcome.threshold_name,
    })
}

/// Serialize a rule document back to its canonical JSON value.
pub fn doc_to_value(doc: &RuleDoc) -> Value {
    let mut body = Map::new();
    body.insert("name".into(), json!(doc.name));
    if !doc.description.is_empty() {
        body.insert("description".into(), json!(doc.description));
    }
    if !doc.class.is_empty() {
        body.insert("class".into(), json!(doc.class));
    }
    body.insert("categories".into(), json!(doc.categories));
    body.insert("metrics".into(), json!(doc.metrics));
    body.insert(
        "results".into(),
        Value::Array(
            doc.results
                .iter()
                .map(|(label, outcome)| json!({ label: outcome_to_value(outcome) }))
                .collect(),
        ),
    );
    if !doc.source.is_empty() {
        body.insert("source".into(), json!(doc.source));
    }
    body.insert("assets".into(), json!(doc.assets));
    body.insert(
        "values".into(),
        Value::Array(
            doc.variables
                .iter()
                .map(|(name, value)| json!({ name: value }))
                .collect(),
        ),
    );
    if !doc.values_unit.is_empty() {
        body.insert("values_unit".into(), json!(doc.values_unit));
    }
    if !doc.hierarchy.is_empty() {
        body.insert("hierarchy".into(), json!(doc.hierarchy));
    }
    if !doc.expression.is_empty() {
        body.insert("evaluation".into(), json!(doc.expression));
        body.insert("outcome_item_count".into(), json!(doc.outcome_items));
    }
    if !doc.models.is_empty() {
        body.insert("models".into(), json!(doc.models));
    }

    let mut root = Map::new();
    root.insert(doc.kind.clone(), Value::Object(body));
    Value::Object(root)
}

/// Serialize a rule document to pretty-printed JSON text.
pub fn doc_to_json(doc: &RuleDoc) -> String {
    serde_json::to_string_pretty(&doc_to_value(doc)).expect("rule doc serialization cannot fail")
}
