//! Rule management request/reply surface.
//!
//! The trigger mailbox serves the operator command set; every reply carries
//! either a payload or the numeric error code from the engine error table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vigil_core::error::EngineError;
use vigil_rules::rule::{RuleElementMatcher, RuleKind};

use crate::trigger::{now_secs, EngineState};

/// Mailbox name the trigger listens on.
pub const TRIGGER_MAILBOX: &str = "vigil-trigger";

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum RuleCommand {
    #[serde(rename = "LIST")]
    List {
        /// Rule kind or "all".
        #[serde(default)]
        kind: String,
        /// Optional class filter; empty matches everything.
        #[serde(default)]
        class: String,
    },
    #[serde(rename = "GET")]
    Get { name: String },
    #[serde(rename = "ADD")]
    Add { json: String },
    #[serde(rename = "UPDATE")]
    Update { json: String, old_name: String },
    #[serde(rename = "DELETE")]
    Delete { name: String },
    #[serde(rename = "DELETE_ELEMENT")]
    DeleteElement { element: String },
    #[serde(rename = "TOUCH")]
    Touch { name: String },
    #[serde(rename = "ACK")]
    Ack {
        rule: String,
        element: String,
        state: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result")]
pub enum RuleResponse {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "RULES")]
    Rules { rules: Vec<Value> },
    #[serde(rename = "RULE")]
    Rule { rule: Value },
    #[serde(rename = "ERROR")]
    Error { code: i32, message: String },
}

impl RuleResponse {
    fn error(e: EngineError) -> Self {
        RuleResponse::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────────

/// Executes mailbox commands against the shared engine state.
#[derive(Clone)]
pub struct RuleApi {
    state: EngineState,
}

impl RuleApi {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    pub fn handle(&self, command: RuleCommand) -> RuleResponse {
        match self.try_handle(command) {
            Ok(response) => response,
            Err(e) => RuleResponse::error(e),
        }
    }

    fn try_handle(&self, command: RuleCommand) -> Result<RuleResponse, EngineError> {
        match command {
            RuleCommand::List { kind, class } => {
                let kind_filter = match kind.as_str() {
                    "" | "all" => None,
                    other => Some(
                        RuleKind::from_str(other)
                            .ok_or_else(|| EngineError::Json(format!("unknown kind '{}'", other)))?,
                    ),
                };
                let class_filter = if class.is_empty() { None } else { Some(class.as_str()) };
                let store = self.state.store.lock().expect("rule store lock poisoned");
                let rules = store
                    .list(kind_filter, class_filter)
                    .iter()
                    .map(|r| r.to_value())
                    .collect();
                Ok(RuleResponse::Rules { rules })
            }
            RuleCommand::Get { name } => {
                let store = self.state.store.lock().expect("rule store lock poisoned");
                let rule = store
                    .get(&name)
                    .ok_or_else(|| EngineError::NotFound(name))?;
                Ok(RuleResponse::Rule { rule: rule.to_value() })
            }
            RuleCommand::Add { json } => {
                self.state
                    .store
                    .lock()
                    .expect("rule store lock poisoned")
                    .add(&json)?;
                Ok(RuleResponse::Ok)
            }
            RuleCommand::Update { json, old_name } => {
                self.state
                    .store
                    .lock()
                    .expect("rule store lock poisoned")
                    .update(&json, &old_name)?;
                Ok(RuleResponse::Ok)
            }
            RuleCommand::Delete { name } => {
                self.state
                    .store
                    .lock()
                    .expect("rule store lock poisoned")
                    .delete(&name)?;
                Ok(RuleResponse::Ok)
            }
            RuleCommand::DeleteElement { element } => {
                self.state
                    .store
                    .lock()
                    .expect("rule store lock poisoned")
                    .delete_matching(&RuleElementMatcher(element))?;
                Ok(RuleResponse::Ok)
            }
            RuleCommand::Touch { name } => {
                // Force the rule's alerts to RESOLVED; the next tick
                // re-evaluates from scratch.
                if !self
                    .state
                    .store
                    .lock()
                    .expect("rule store lock poisoned")
                    .contains(&name)
                {
                    return Err(EngineError::NotFound(name));
                }
                self.state
                    .resolve_rule_alerts(&name, "Rule was changed implicitly", now_secs());
                Ok(RuleResponse::Ok)
            }
            RuleCommand::Ack {
                rule,
                element,
                state,
            } => {
                self.state.ack_alert(&rule, &element, &state, now_secs())?;
                Ok(RuleResponse::Ok)
            }
        }
    }
}
