//! The configurator: asset lifecycle events drive per-asset rules.
//!
//! For every CREATE the template library is consulted and each applicable
//! template is instantiated for the asset (subject to the store's
//! suitability predicates). UPDATE re-derives the asset's rule set and asks
//! the trigger for an immediate re-evaluation; DELETE and RETIRE withdraw
//! the rules, resolving their alerts on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_core::asset::{BasicAsset, ExtendedAsset, FullAsset};
use vigil_core::error::EngineError;
use vigil_rules::rule::RuleElementMatcher;
use vigil_rules::templates::TemplateLibrary;
use vigil_transport::events::{AssetEvent, AssetOp};

use crate::trigger::EngineState;

/// Mailbox name the configurator listens on.
pub const CONFIG_MAILBOX: &str = "vigil-config";

/// Nudges from the configurator to the trigger-stream actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Evaluate the rule set now instead of waiting for the next tick.
    Reevaluate,
    /// Resolve every alert attached to an element (asset went dormant).
    ResolveElement(String),
}

// ── Mailbox surface ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum ConfigCommand {
    #[serde(rename = "LIST_TEMPLATES")]
    ListTemplates {
        /// Asset type filter, or "all".
        #[serde(rename = "type", default)]
        type_: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result")]
pub enum ConfigResponse {
    #[serde(rename = "TEMPLATES")]
    Templates { templates: Vec<Value> },
}

// ── Configurator ────────────────────────────────────────────────────

pub struct Configurator {
    state: EngineState,
    templates: TemplateLibrary,
    control: mpsc::Sender<Control>,
}

impl Configurator {
    pub fn new(
        state: EngineState,
        templates: TemplateLibrary,
        control: mpsc::Sender<Control>,
    ) -> Self {
        Self {
            state,
            templates,
            control,
        }
    }

    /// Serve `LIST_TEMPLATES`.
    pub fn handle_command(&self, command: ConfigCommand) -> ConfigResponse {
        match command {
            ConfigCommand::ListTemplates { type_ } => {
                let templates = self
                    .templates
                    .list(&type_)
                    .iter()
                    .filter_map(|t| match serde_json::from_str(&t.body) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(template = %t.name, error = %e, "template is not valid JSON");
                            None
                        }
                    })
                    .collect();
                ConfigResponse::Templates { templates }
            }
        }
    }

    /// Apply one asset lifecycle event.
    pub fn handle_event(&self, event: &AssetEvent) {
        match event.operation {
            AssetOp::Delete | AssetOp::Retire => {
                self.state.assets.remove(&event.name);
                self.withdraw_rules(&event.name);
                return;
            }
            AssetOp::Create | AssetOp::Update | AssetOp::Inventory => {
                self.state.assets.upsert(asset_from_event(event));
            }
        }

        // A dormant asset keeps its rules but its alerts resolve.
        if !event.status.is_empty() && event.status != "active" {
            debug!(asset = %event.name, status = %event.status, "asset dormant, resolving alerts");
            self.send_control(Control::ResolveElement(event.name.clone()));
            return;
        }

        match event.operation {
            AssetOp::Create => {
                if event.type_.is_empty() {
                    warn!(asset = %event.name, "asset event without type, no rules created");
                    return;
                }
                self.synthesize_rules(event);
            }
            AssetOp::Update => {
                if event.type_.is_empty() {
                    warn!(asset = %event.name, "asset event without type, no rules created");
                    return;
                }
                self.withdraw_rules(&event.name);
                self.synthesize_rules(event);
                self.send_control(Control::Reevaluate);
            }
            AssetOp::Inventory => {} // nothing beyond the asset db refresh
            AssetOp::Delete | AssetOp::Retire => unreachable!("handled above"),
        }
    }

    /// Instantiate every applicable template for the asset.
    fn synthesize_rules(&self, event: &AssetEvent) {
        for template in self.templates.for_asset_family(&event.type_, &event.subtype) {
            let body = template.instantiate(&event.name);
            let result = {
                let mut store = self.state.store.lock().expect("rule store lock poisoned");
                store.add(&body)
            };
            match result {
                Ok(rule) => info!(rule = %rule.name(), asset = %event.name, "rule instantiated"),
                Err(EngineError::RejectedBySuitability(name, code)) => {
                    debug!(rule = %name, code, "template rejected by suitability")
                }
                Err(EngineError::Duplicate(name)) => {
                    debug!(rule = %name, "rule already instantiated")
                }
                Err(e) => {
                    warn!(template = %template.name, asset = %event.name, error = %e,
                        "template instantiation failed")
                }
            }
        }
    }

    /// Remove every rule attached to the asset; observers resolve alerts.
    fn withdraw_rules(&self, asset: &str) {
        let result = {
            let mut store = self.state.store.lock().expect("rule store lock poisoned");
            store.delete_matching(&RuleElementMatcher(asset.to_string()))
        };
        match result {
            Ok(deleted) if !deleted.is_empty() => {
                info!(asset = %asset, count = deleted.len(), "rules withdrawn")
            }
            Ok(_) => {}
            Err(e) => warn!(asset = %asset, error = %e, "rule withdrawal failed"),
        }
    }

    fn send_control(&self, control: Control) {
        if let Err(e) = self.control.try_send(control) {
            warn!(error = %e, "trigger control queue full, dropping nudge");
        }
    }
}

fn asset_from_event(event: &AssetEvent) -> FullAsset {
    let priority = event
        .priority
        .trim_start_matches(['P', 'p'])
        .parse()
        .unwrap_or(0);
    FullAsset {
        ext: ExtendedAsset {
            basic: BasicAsset {
                id: event.name.clone(),
                status: event.status.clone(),
                type_: event.type_.clone(),
                subtype: event.subtype.clone(),
            },
            ename: event.ext.get("name").cloned().unwrap_or_default(),
            parent: event.parent.clone(),
            priority,
        },
        aux: event.ext.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    use crate::trigger::RuleChangeQueue;
    use vigil_rules::store::RuleStore;

    fn template_body(family: &str) -> String {
        format!(
            r#"{{"single": {{
                "name": "{family}@__name__",
                "categories": ["CAT_ALL"],
                "metrics": ["{family}"],
                "assets": ["__name__"],
                "results": [
                    {{"fail": {{"action": [], "severity": "CRITICAL", "description": "fail on __name__"}}}}
                ],
                "values": [{{"var1": "50"}}],
                "evaluation": "fn main(v) if num(v) < num(var1) then return \"ok\" end return \"fail\" end"
            }}}}"#
        )
    }

    struct Fixture {
        _rules_dir: TempDir,
        _templates_dir: TempDir,
        state: EngineState,
        configurator: Configurator,
        control_rx: mpsc::Receiver<Control>,
    }

    fn fixture(templates: &[(&str, String)]) -> Fixture {
        let rules_dir = TempDir::new().unwrap();
        let templates_dir = TempDir::new().unwrap();
        for (name, body) in templates {
            fs::write(templates_dir.path().join(format!("{}.rule", name)), body).unwrap();
        }

        let store = RuleStore::new(rules_dir.path()).unwrap();
        let state = EngineState::new(store, RuleChangeQueue::new());
        let mut library = TemplateLibrary::new(templates_dir.path());
        library.load_all();

        let (control_tx, control_rx) = mpsc::channel(16);
        let configurator = Configurator::new(state.clone(), library, control_tx);
        Fixture {
            _rules_dir: rules_dir,
            _templates_dir: templates_dir,
            state,
            configurator,
            control_rx,
        }
    }

    fn event(name: &str, op: AssetOp, type_: &str, subtype: &str, status: &str) -> AssetEvent {
        AssetEvent {
            name: name.into(),
            operation: op,
            status: status.into(),
            type_: type_.into(),
            subtype: subtype.into(),
            priority: "P1".into(),
            parent: String::new(),
            ext: HashMap::new(),
        }
    }

    #[test]
    fn create_instantiates_applicable_templates() {
        let mut fx = fixture(&[
            ("average.temperature@__datacenter__", template_body("average.temperature")),
            ("load.default@__device_epdu__", template_body("load.default")),
        ]);

        fx.configurator
            .handle_event(&event("dc-1", AssetOp::Create, "datacenter", "", "active"));

        let store = fx.state.store.lock().unwrap();
        assert!(store.contains("average.temperature@dc-1"));
        assert!(!store.contains("load.default@dc-1"));
        drop(store);
        assert!(fx.state.assets.contains("dc-1"));
        assert!(fx.control_rx.try_recv().is_err());
    }

    #[test]
    fn update_rederives_rules_and_forces_reevaluation() {
        let mut fx = fixture(&[
            ("average.temperature@__datacenter__", template_body("average.temperature")),
            ("load.default@__device_epdu__", template_body("load.default")),
        ]);

        fx.configurator
            .handle_event(&event("test", AssetOp::Create, "datacenter", "", "active"));
        assert!(fx.state.store.lock().unwrap().contains("average.temperature@test"));

        // The asset turns into an ePDU: datacenter rules go, epdu rules come.
        fx.configurator
            .handle_event(&event("test", AssetOp::Update, "device", "epdu", "active"));

        let store = fx.state.store.lock().unwrap();
        assert!(!store.contains("average.temperature@test"));
        assert!(store.contains("load.default@test"));
        drop(store);
        assert_eq!(fx.control_rx.try_recv().unwrap(), Control::Reevaluate);
    }

    #[test]
    fn delete_withdraws_rules_and_asset() {
        let mut fx = fixture(&[(
            "average.temperature@__datacenter__",
            template_body("average.temperature"),
        )]);

        fx.configurator
            .handle_event(&event("test", AssetOp::Create, "datacenter", "", "active"));
        fx.configurator
            .handle_event(&event("test", AssetOp::Delete, "datacenter", "", "active"));

        assert!(fx.state.store.lock().unwrap().is_empty());
        assert!(!fx.state.assets.contains("test"));
        assert!(fx.control_rx.try_recv().is_err());
    }

    #[test]
    fn dormant_status_resolves_alerts_without_touching_rules() {
        let mut fx = fixture(&[(
            "average.temperature@__datacenter__",
            template_body("average.temperature"),
        )]);

        fx.configurator
            .handle_event(&event("dc-1", AssetOp::Create, "datacenter", "", "active"));
        fx.configurator
            .handle_event(&event("dc-1", AssetOp::Update, "datacenter", "", "nonactive"));

        // Rules survive; the trigger is asked to resolve the element.
        assert!(fx.state.store.lock().unwrap().contains("average.temperature@dc-1"));
        assert_eq!(
            fx.control_rx.try_recv().unwrap(),
            Control::ResolveElement("dc-1".into())
        );
    }

    #[test]
    fn inventory_is_a_noop_beyond_the_asset_db() {
        let mut fx = fixture(&[(
            "average.temperature@__datacenter__",
            template_body("average.temperature"),
        )]);

        fx.configurator
            .handle_event(&event("dc-1", AssetOp::Inventory, "datacenter", "", "active"));

        assert!(fx.state.store.lock().unwrap().is_empty());
        assert!(fx.state.assets.contains("dc-1"));
        assert!(fx.control_rx.try_recv().is_err());
    }

    #[test]
    fn suitability_rejection_blocks_instantiation() {
        let fx = fixture(&[(
            "voltage.input_1phase@__device_ups__",
            template_body("voltage.input_1phase"),
        )]);

        // The device reports a second phase: the 1-phase template is refused.
        fx.state
            .metrics
            .lock()
            .unwrap()
            .update("voltage.input.L2@ups-7", "231", 60, 1000);

        fx.configurator
            .handle_event(&event("ups-7", AssetOp::Create, "device", "ups", "active"));

        let store = fx.state.store.lock().unwrap();
        assert!(!store.contains("voltage.input_1phase@ups-7"));
        assert!(!store.dir().join("voltage.input_1phase@ups-7.rule").exists());
    }

    #[test]
    fn list_templates_by_type() {
        let fx = fixture(&[
            ("a@__datacenter__", template_body("a")),
            ("b@__device_ups__", template_body("b")),
        ]);

        match fx.configurator.handle_command(ConfigCommand::ListTemplates { type_: "all".into() }) {
            ConfigResponse::Templates { templates } => assert_eq!(templates.len(), 2),
        }
        match fx.configurator.handle_command(ConfigCommand::ListTemplates {
            type_: "device".into(),
        }) {
            ConfigResponse::Templates { templates } => {
                assert_eq!(templates.len(), 1);
                assert_eq!(templates[0]["single"]["name"], "b@__name__");
            }
        }
    }
}
