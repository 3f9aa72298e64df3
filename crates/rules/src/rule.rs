//! Rule kinds and their evaluation semantics.
//!
//! All five kinds share the same document fields; what differs is how the
//! argument vector for the expression is shaped:
//!
//! - `single`, `threshold`, `flexible`: one call per declared asset, reading
//!   each declared metric at `<metric>@<asset>`; the asset is skipped when any
//!   of its metrics is inactive or missing.
//! - `pattern`: the single metric is a regex over metric keys; one call per
//!   matching active key with `(key, value)` arguments.
//! - `generic`: parsed and stored but never evaluates.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use regex::Regex;

use vigil_core::error::EngineError;

use crate::expr::Sandbox;
use crate::schema::{self, Outcome, RuleDoc};

// ── Kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Single,
    Pattern,
    Threshold,
    Flexible,
    Generic,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Single => "single",
            RuleKind::Pattern => "pattern",
            RuleKind::Threshold => "threshold",
            RuleKind::Flexible => "flexible",
            RuleKind::Generic => "generic",
        }
    }

    pub fn from_str(kind: &str) -> Option<Self> {
        Some(match kind {
            "single" => RuleKind::Single,
            "pattern" => RuleKind::Pattern,
            "threshold" => RuleKind::Threshold,
            "flexible" => RuleKind::Flexible,
            "generic" => RuleKind::Generic,
            _ => return None,
        })
    }
}

/// Threshold rules may only bind these variables.
const THRESHOLD_VARIABLES: [&str; 4] =
    ["low_critical", "low_warning", "high_critical", "high_warning"];

// ── Per-kind evaluation state ───────────────────────────────────────

#[derive(Debug, Clone)]
enum EvalEngine {
    /// single / threshold / flexible: compiled expression over declared metrics.
    Scripted(Sandbox),
    /// pattern: metric regex plus compiled expression.
    Pattern { regex: Regex, sandbox: Sandbox },
    /// generic: never evaluates.
    Generic,
}

/// One evaluation result: outcome labels plus the element they apply to.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalHit {
    /// `outcome_item_count` strings; the first is the outcome label.
    pub labels: Vec<String>,
    /// Subject of the resulting alert (asset id, or key suffix for patterns).
    pub element: String,
    /// Metric keys that produced this result (drives alert TTL derivation).
    pub metric_keys: Vec<String>,
}

// ── Rule ────────────────────────────────────────────────────────────

/// A named, persisted evaluation unit. Immutable after construction except
/// for [`set_global_variables`](Rule::set_global_variables), which rebinds
/// the variables and recompiles the expression.
#[derive(Debug, Clone)]
pub struct Rule {
    doc: RuleDoc,
    kind: RuleKind,
    engine: EvalEngine,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        // Compiled state is derived; document equality is rule equality.
        self.doc == other.doc
    }
}

impl Rule {
    /// The factory: parse, validate kind invariants, compile the expression.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        Self::from_doc(schema::parse_rule_doc(text)?)
    }

    pub fn from_doc(doc: RuleDoc) -> Result<Self, EngineError> {
        let kind = RuleKind::from_str(&doc.kind)
            .ok_or_else(|| EngineError::Json(format!("unknown rule kind '{}'", doc.kind)))?;

        match kind {
            RuleKind::Single => {
                if doc.assets.len() != 1 {
                    return Err(EngineError::Semantic(
                        "single rule requires exactly one asset".into(),
                    ));
                }
            }
            RuleKind::Pattern => {
                if doc.metrics.len() != 1 {
                    return Err(EngineError::Semantic(
                        "pattern rule requires exactly one metric".into(),
                    ));
                }
                if doc.assets.len() != 1 {
                    return Err(EngineError::Semantic(
                        "pattern rule requires exactly one asset".into(),
                    ));
                }
            }
            RuleKind::Threshold => {
                if doc.variables.is_empty() {
                    return Err(EngineError::Semantic(
                        "threshold rule requires values".into(),
                    ));
                }
                for name in doc.variables.keys() {
                    if !THRESHOLD_VARIABLES.contains(&name.as_str()) {
                        return Err(EngineError::Semantic(format!(
                            "threshold rule does not accept value '{}'",
                            name
                        )));
                    }
                }
            }
            RuleKind::Flexible | RuleKind::Generic => {}
        }

        let engine = match kind {
            RuleKind::Generic => EvalEngine::Generic,
            _ => {
                if doc.expression.is_empty() {
                    return Err(EngineError::Semantic(
                        "missing mandatory item 'evaluation'".into(),
                    ));
                }
                let sandbox =
                    Sandbox::compile(&doc.expression, &doc.variables, doc.outcome_items)
                        .map_err(|e| EngineError::Script(e.to_string()))?;
                if kind == RuleKind::Pattern {
                    // Full-key matching, like the store's metric keys demand.
                    let regex = Regex::new(&format!("^(?:{})$", doc.metrics[0]))
                        .map_err(|e| EngineError::Semantic(format!("invalid metric pattern: {}", e)))?;
                    EvalEngine::Pattern { regex, sandbox }
                } else {
                    EvalEngine::Scripted(sandbox)
                }
            }
        };

        Ok(Rule { doc, kind, engine })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn class(&self) -> &str {
        &self.doc.class
    }

    pub fn categories(&self) -> &[String] {
        &self.doc.categories
    }

    pub fn metrics(&self) -> &[String] {
        &self.doc.metrics
    }

    pub fn assets(&self) -> &[String] {
        &self.doc.assets
    }

    pub fn results(&self) -> &IndexMap<String, Outcome> {
        &self.doc.results
    }

    pub fn variables(&self) -> &IndexMap<String, String> {
        &self.doc.variables
    }

    pub fn expression(&self) -> &str {
        &self.doc.expression
    }

    pub fn outcome_items(&self) -> usize {
        self.doc.outcome_items
    }

    pub fn models(&self) -> &[String] {
        &self.doc.models
    }

    pub fn has_asset(&self, asset: &str) -> bool {
        self.doc.assets.iter().any(|a| a == asset)
    }

    /// Serialize back to the canonical rule-file JSON.
    pub fn to_json(&self) -> String {
        schema::doc_to_json(&self.doc)
    }

    pub fn to_value(&self) -> serde_json::Value {
        schema::doc_to_value(&self.doc)
    }

    /// Rebind the expression globals and recompile.
    ///
    /// This is the only mutation a constructed rule supports; the previously
    /// compiled expression is invalidated.
    pub fn set_global_variables(
        &mut self,
        variables: IndexMap<String, String>,
    ) -> Result<(), EngineError> {
        self.doc.variables = variables;
        match &mut self.engine {
            EvalEngine::Generic => {}
            EvalEngine::Scripted(sandbox) | EvalEngine::Pattern { sandbox, .. } => {
                *sandbox =
                    Sandbox::compile(&self.doc.expression, &self.doc.variables, self.doc.outcome_items)
                        .map_err(|e| EngineError::Script(e.to_string()))?;
            }
        }
        Ok(())
    }

    // ── Evaluation ──────────────────────────────────────────────────

    /// Run the expression over an explicit argument vector.
    pub fn evaluate(&self, args: &[String]) -> Result<Vec<String>, EngineError> {
        match &self.engine {
            EvalEngine::Generic => Ok(Vec::new()),
            EvalEngine::Scripted(sandbox) => sandbox
                .evaluate(args)
                .map_err(|e| EngineError::Evaluation(e.to_string())),
            EvalEngine::Pattern { sandbox, .. } => {
                // A bare value gets the pattern itself as the matched key.
                let shaped;
                let args = if args.len() == 1 {
                    shaped = vec![self.doc.metrics[0].clone(), args[0].clone()];
                    &shaped[..]
                } else {
                    args
                };
                sandbox
                    .evaluate(args)
                    .map_err(|e| EngineError::Evaluation(e.to_string()))
            }
        }
    }

    /// Evaluate against the metric tables, producing one hit per element.
    pub fn evaluate_over(
        &self,
        active: &HashMap<String, String>,
        inactive: &HashSet<String>,
    ) -> Result<Vec<EvalHit>, EngineError> {
        match &self.engine {
            EvalEngine::Generic => Ok(Vec::new()),
            EvalEngine::Scripted(_) => self.evaluate_per_asset(active, inactive),
            EvalEngine::Pattern { regex, .. } => self.evaluate_matches(regex, active),
        }
    }

    fn evaluate_per_asset(
        &self,
        active: &HashMap<String, String>,
        inactive: &HashSet<String>,
    ) -> Result<Vec<EvalHit>, EngineError> {
        let mut hits = Vec::new();
        'assets: for asset in &self.doc.assets {
            let mut args = Vec::with_capacity(self.doc.metrics.len());
            let mut keys = Vec::with_capacity(self.doc.metrics.len());
            for metric in &self.doc.metrics {
                let key = format!("{}@{}", metric, asset);
                if inactive.contains(&key) {
                    continue 'assets;
                }
                match active.get(&key) {
                    Some(value) => {
                        args.push(value.clone());
                        keys.push(key);
                    }
                    None => continue 'assets,
                }
            }
            hits.push(EvalHit {
                labels: self.evaluate(&args)?,
                element: asset.clone(),
                metric_keys: keys,
            });
        }
        Ok(hits)
    }

    fn evaluate_matches(
        &self,
        regex: &Regex,
        active: &HashMap<String, String>,
    ) -> Result<Vec<EvalHit>, EngineError> {
        // Unavailable metrics are ignored: patterns never alert on outages.
        let mut keys: Vec<&String> = active.keys().filter(|k| regex.is_match(k)).collect();
        keys.sort();

        let mut hits = Vec::new();
        for key in keys {
            let value = &active[key];
            let labels = self.evaluate(&[key.clone(), value.clone()])?;
            let element = match key.find('@') {
                Some(at) => key[at + 1..].to_string(),
                None => key.clone(),
            };
            hits.push(EvalHit {
                labels,
                element,
                metric_keys: vec![key.clone()],
            });
        }
        Ok(hits)
    }
}

// ── Matchers ────────────────────────────────────────────────────────

/// Predicate over rules, used by bulk store operations.
pub trait RuleMatcher {
    fn matches(&self, rule: &Rule) -> bool;
}

pub struct RuleNameMatcher(pub String);

impl RuleMatcher for RuleNameMatcher {
    fn matches(&self, rule: &Rule) -> bool {
        rule.name() == self.0
    }
}

/// Matches every rule whose `assets` list contains the element.
pub struct RuleElementMatcher(pub String);

impl RuleMatcher for RuleElementMatcher {
    fn matches(&self, rule: &Rule) -> bool {
        rule.has_asset(&self.0)
    }
}
