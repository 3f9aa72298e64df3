//! Alert representation and state machine.
//!
//! An alert is identified by `(rule, element)` and carries a snapshot of its
//! rule's outcome map taken when the alert attached. Repeated evaluation
//! results mutate the alert through a small state machine; each mutation
//! produces one published record.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use vigil_core::error::EngineError;
use vigil_rules::schema::Outcome;
use vigil_transport::events::AlertRecord;

// ── States ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Active,
    AckWip,
    AckPause,
    AckIgnore,
    AckSilence,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Active => "ACTIVE",
            AlertState::AckWip => "ACK-WIP",
            AlertState::AckPause => "ACK-PAUSE",
            AlertState::AckIgnore => "ACK-IGNORE",
            AlertState::AckSilence => "ACK-SILENCE",
            AlertState::Resolved => "RESOLVED",
        }
    }

    pub fn from_str(token: &str) -> Option<Self> {
        Some(match token {
            "ACTIVE" => AlertState::Active,
            "ACK-WIP" => AlertState::AckWip,
            "ACK-PAUSE" => AlertState::AckPause,
            "ACK-IGNORE" => AlertState::AckIgnore,
            "ACK-SILENCE" => AlertState::AckSilence,
            "RESOLVED" => AlertState::Resolved,
            _ => return None,
        })
    }

    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            AlertState::AckWip | AlertState::AckPause | AlertState::AckIgnore | AlertState::AckSilence
        )
    }
}

// ── Description templating ──────────────────────────────────────────

/// Values substituted into outcome description templates.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    pub severity: String,
    pub name: String,
    pub ename: String,
    pub logical_asset_iname: String,
    pub logical_asset_ename: String,
    pub normal_state: String,
    pub port: String,
}

/// Left-to-right token substitution.
///
/// `__logicalasset_iname__` is listed before `__logicalasset__` so the
/// longer token wins; `__rule_result__` is the lowercased severity.
pub fn expand_description(template: &str, ctx: &TokenContext) -> String {
    let rule_result = ctx.severity.to_lowercase();
    let pairs: [(&str, &str); 8] = [
        ("__severity__", &ctx.severity),
        ("__name__", &ctx.name),
        ("__ename__", &ctx.ename),
        ("__logicalasset_iname__", &ctx.logical_asset_iname),
        ("__logicalasset__", &ctx.logical_asset_ename),
        ("__normalstate__", &ctx.normal_state),
        ("__port__", &ctx.port),
        ("__rule_result__", &rule_result),
    ];

    let mut result = template.to_string();
    for (token, replacement) in pairs {
        result = result.replace(token, replacement);
    }
    result
}

// ── Alert ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule: String,
    pub element: String,
    /// `outcome_item_count` strings from the last non-ok evaluation.
    pub outcome: Vec<String>,
    pub state: AlertState,
    pub severity: String,
    pub description: String,
    pub actions: Vec<String>,
    /// Creation time, seconds.
    pub ctime: u64,
    /// Last mutation time, seconds.
    pub mtime: u64,
    /// Seconds after `mtime` at which the alert is considered stale.
    pub ttl: u64,
    /// Snapshot of the rule's outcome map at attach time.
    pub results: IndexMap<String, Outcome>,
}

impl Alert {
    /// Create a newly-started alert from a non-ok evaluation result.
    pub fn start(
        rule: &str,
        element: &str,
        results: IndexMap<String, Outcome>,
        labels: Vec<String>,
        ttl: u64,
        now: u64,
    ) -> Self {
        let mut alert = Alert {
            rule: rule.to_string(),
            element: element.to_string(),
            outcome: Vec::new(),
            state: AlertState::Active,
            severity: String::new(),
            description: String::new(),
            actions: Vec::new(),
            ctime: now,
            mtime: now,
            ttl,
            results,
        };
        alert.apply_outcome(labels, ttl, now);
        alert
    }

    pub fn id(&self) -> String {
        format!("{}@{}", self.rule, self.element)
    }

    /// Copy severity, description and actions from the outcome snapshot.
    fn apply_outcome(&mut self, labels: Vec<String>, ttl: u64, now: u64) {
        if let Some(outcome) = self.results.get(&labels[0]) {
            self.severity = outcome.severity.clone();
            self.description = outcome.description.clone();
            self.actions = outcome.actions.clone();
        }
        self.outcome = labels;
        self.ttl = ttl;
        self.mtime = now;
    }

    /// A further `START` evaluation: payload may change, state survives.
    pub fn update(&mut self, labels: Vec<String>, ttl: u64, now: u64) {
        self.apply_outcome(labels, ttl, now);
    }

    /// `RESOLVED` + `START`: the condition fired again after resolution.
    pub fn reactivate(&mut self, labels: Vec<String>, ttl: u64, now: u64) {
        self.state = AlertState::Active;
        self.ctime = now;
        self.apply_outcome(labels, ttl, now);
    }

    /// Resolution from evaluation, rule withdrawal or asset retirement.
    pub fn resolve(&mut self, description: Option<&str>, now: u64) {
        self.state = AlertState::Resolved;
        self.outcome = vec!["ok".to_string()];
        self.mtime = now;
        if let Some(description) = description {
            self.description = description.to_string();
        }
    }

    /// Operator acknowledgement request.
    ///
    /// Resolution is never an operator action, unknown tokens are refused,
    /// and a resolved alert cannot be acknowledged.
    pub fn switch_state(&mut self, requested: &str) -> Result<(), EngineError> {
        let requested = AlertState::from_str(requested)
            .ok_or_else(|| EngineError::BadStatus(format!("unknown state '{}'", requested)))?;
        match requested {
            AlertState::Resolved => Err(EngineError::BadStatus(
                "alerts cannot be resolved manually".into(),
            )),
            AlertState::Active => {
                // Evaluation owns the ACTIVE state; an acknowledged alert
                // stays acknowledged until resolution.
                if self.state.is_ack() {
                    Err(EngineError::BadStatus(
                        "acknowledged alerts cannot be reactivated manually".into(),
                    ))
                } else {
                    self.state = AlertState::Active;
                    Ok(())
                }
            }
            ack => {
                if self.state == AlertState::Resolved {
                    Err(EngineError::BadStatus(
                        "resolved alerts cannot be acknowledged".into(),
                    ))
                } else {
                    self.state = ack;
                    Ok(())
                }
            }
        }
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.mtime) > self.ttl
    }

    // ── Record encoding ─────────────────────────────────────────────

    /// Full record with the description template expanded.
    ///
    /// Triggered (non-resolved) emissions carry the outcome in `aux`; the
    /// per-index `outcome.<i>` entries hold the labels themselves.
    pub fn to_record(&self, ctx: &TokenContext) -> AlertRecord {
        let mut aux = BTreeMap::new();
        aux.insert("ctime".to_string(), self.ctime.to_string());
        if self.state != AlertState::Resolved && !self.outcome.is_empty() {
            aux.insert("outcome".to_string(), self.outcome[0].clone());
            if self.outcome.len() > 1 {
                aux.insert("outcome_count".to_string(), self.outcome.len().to_string());
                for (i, label) in self.outcome.iter().enumerate() {
                    aux.insert(format!("outcome.{}", i), label.clone());
                }
            }
        }

        AlertRecord {
            aux,
            mtime: self.mtime,
            ttl: self.ttl,
            rule: self.rule.clone(),
            element: self.element.clone(),
            state: self.state.as_str().to_string(),
            severity: self.severity.clone(),
            description: expand_description(&self.description, ctx),
            actions: self.actions.clone(),
        }
    }

    /// Stale record: severity and description cleared, identity preserved.
    pub fn stale_record(&self) -> AlertRecord {
        let mut aux = BTreeMap::new();
        aux.insert("ctime".to_string(), self.ctime.to_string());
        AlertRecord {
            aux,
            mtime: self.mtime,
            ttl: self.ttl,
            rule: self.rule.clone(),
            element: self.element.clone(),
            state: self.state.as_str().to_string(),
            severity: String::new(),
            description: String::new(),
            actions: Vec::new(),
        }
    }
}
