//! End-to-end scenarios over the engine's synchronous core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::mpsc;

use vigil_engine::configurator::Configurator;
use vigil_engine::trigger::{EngineState, RuleChangeQueue, Trigger};
use vigil_rules::store::RuleStore;
use vigil_rules::templates::TemplateLibrary;
use vigil_transport::events::{AlertRecord, AssetEvent, AssetOp, MetricUpdate};

fn engine(rules_dir: &TempDir) -> (EngineState, Trigger) {
    let changes = RuleChangeQueue::new();
    let store = RuleStore::new(rules_dir.path()).unwrap();
    let state = EngineState::new(store, changes.clone());
    let trigger = Trigger::new(state.clone(), changes, 30);
    (state, trigger)
}

fn drain(state: &EngineState) -> Vec<AlertRecord> {
    state.emissions.lock().unwrap().take_all()
}

fn feed(trigger: &Trigger, metric: &str, asset: &str, value: &str, now: u64) {
    trigger.handle_metric(
        &MetricUpdate {
            metric: metric.into(),
            asset: asset.into(),
            value: value.into(),
            unit: String::new(),
            ttl: 300,
        },
        now,
    );
}

const SIMPLETHRESHOLD: &str = r#"{"threshold": {
    "name": "simplethreshold",
    "description": "a simple threshold",
    "class": "example class",
    "categories": ["CAT_ALL"],
    "metrics": "abc",
    "assets": "fff",
    "results": [
        {"low_critical":  {"action": [{"action": "EMAIL"}, {"action": "SMS"}],
                           "description": "WOW low critical description"}},
        {"low_warning":   {"action": [{"action": "EMAIL"}],
                           "description": "wow LOW warning description"}},
        {"high_warning":  {"action": [{"action": "EMAIL"}],
                           "description": "wow high WARNING description"}},
        {"high_critical": {"action": [{"action": "EMAIL"}],
                           "description": "wow high critical DESCRIPTION"}}
    ],
    "values": [
        {"low_critical": "30"}, {"low_warning": "40"},
        {"high_warning": "50"}, {"high_critical": "60"}
    ],
    "evaluation": "fn main(v) if num(v) < num(low_critical) then return \"low_critical\" end if num(v) < num(low_warning) then return \"low_warning\" end if num(v) > num(high_critical) then return \"high_critical\" end if num(v) > num(high_warning) then return \"high_warning\" end return \"ok\" end"
}}"#;

#[test]
fn threshold_hot_path() {
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    // 25 trips the low critical band.
    feed(&trigger, "abc", "fff", "25", 1000);
    trigger.tick(1000);
    let records = drain(&state);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule, "simplethreshold");
    assert_eq!(records[0].element, "fff");
    assert_eq!(records[0].state, "ACTIVE");
    assert_eq!(records[0].severity, "CRITICAL");
    assert_eq!(
        records[0].aux.get("outcome").map(String::as_str),
        Some("low_critical")
    );
    assert_eq!(records[0].actions, vec!["EMAIL", "SMS"]);

    // 45 is inside the normal band: the alert resolves.
    feed(&trigger, "abc", "fff", "45", 1030);
    trigger.tick(1030);
    let records = drain(&state);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, "RESOLVED");

    // 55 trips the high warning band: a fresh activation.
    feed(&trigger, "abc", "fff", "55", 1060);
    trigger.tick(1060);
    let records = drain(&state);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, "ACTIVE");
    assert_eq!(records[0].severity, "WARNING");
    assert_eq!(
        records[0].aux.get("outcome").map(String::as_str),
        Some("high_warning")
    );
}

#[test]
fn pattern_rule_alerts_per_matching_key() {
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state
        .store
        .lock()
        .unwrap()
        .add(
            r#"{"pattern": {
                "name": "pattern1@asset5",
                "categories": ["CAT_ALL"],
                "metrics": ["pattern..metric1@.*"],
                "assets": ["asset5"],
                "results": [
                    {"fail": {"action": [], "severity": "CRITICAL", "description": "pattern fail"}}
                ],
                "values": [{"var1": "50"}],
                "evaluation": "fn main(metric, v) if num(v) < num(var1) then return \"ok\", metric end return \"fail\", metric end",
                "outcome_item_count": 2
            }}"#,
        )
        .unwrap();

    trigger.handle_metric(
        &MetricUpdate { metric: "pattern1.metric1".into(), asset: "asset5".into(), value: "40".into(), unit: String::new(), ttl: 300 },
        1000,
    );
    trigger.handle_metric(
        &MetricUpdate { metric: "pattern2.metric1".into(), asset: "asset6".into(), value: "60".into(), unit: String::new(), ttl: 300 },
        1000,
    );
    trigger.handle_metric(
        &MetricUpdate { metric: "patern5.metric1".into(), asset: "asset8".into(), value: "40".into(), unit: String::new(), ttl: 300 },
        1000,
    );

    trigger.tick(1000);
    let records = drain(&state);

    // Only the failing match raises an alert, attached to its key's element.
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule, "pattern1@asset5");
    assert_eq!(records[0].element, "asset6");
    assert_eq!(records[0].state, "ACTIVE");
    assert_eq!(records[0].aux.get("outcome").map(String::as_str), Some("fail"));
    assert_eq!(records[0].aux.get("outcome_count").map(String::as_str), Some("2"));
    assert_eq!(
        records[0].aux.get("outcome.1").map(String::as_str),
        Some("pattern2.metric1@asset6")
    );
}

#[test]
fn acknowledgement_does_not_block_resolution() {
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    feed(&trigger, "abc", "fff", "25", 1000);
    trigger.tick(1000);
    drain(&state);

    state
        .ack_alert("simplethreshold", "fff", "ACK-SILENCE", 1010)
        .unwrap();
    let records = drain(&state);
    assert_eq!(records[0].state, "ACK-SILENCE");

    // Resolution is not an operator action: it lands from any state.
    feed(&trigger, "abc", "fff", "45", 1030);
    trigger.tick(1030);
    let records = drain(&state);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, "RESOLVED");
}

#[test]
fn acknowledged_alert_stays_acknowledged_while_firing() {
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    feed(&trigger, "abc", "fff", "25", 1000);
    trigger.tick(1000);
    drain(&state);
    state
        .ack_alert("simplethreshold", "fff", "ACK-WIP", 1010)
        .unwrap();
    drain(&state);

    // Still firing, band moved: payload updates, state survives.
    feed(&trigger, "abc", "fff", "55", 1030);
    trigger.tick(1030);
    let records = drain(&state);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, "ACK-WIP");
    assert_eq!(records[0].severity, "WARNING");
}

#[test]
fn rename_resolves_old_alerts_and_swaps_files() {
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    feed(&trigger, "abc", "fff", "25", 1000);
    trigger.tick(1000);
    drain(&state);

    let renamed = SIMPLETHRESHOLD.replace("\"simplethreshold\"", "\"betterthreshold\"");
    state
        .store
        .lock()
        .unwrap()
        .update(&renamed, "simplethreshold")
        .unwrap();

    // The next tick drains the store change and resolves the orphan.
    trigger.tick(1030);
    let records = drain(&state);
    let resolution = records
        .iter()
        .find(|r| r.rule == "simplethreshold" && r.state == "RESOLVED")
        .expect("old rule's alert must resolve");
    assert_eq!(resolution.description, "Rule was changed implicitly");

    assert!(!dir.path().join("simplethreshold.rule").exists());
    assert!(dir.path().join("betterthreshold.rule").exists());
    let store = state.store.lock().unwrap();
    assert!(store.get("simplethreshold").is_none());
    assert!(store.get("betterthreshold").is_some());
}

fn single_template(family: &str) -> String {
    format!(
        r#"{{"single": {{
            "name": "{family}@__name__",
            "categories": ["CAT_ALL"],
            "metrics": ["{family}"],
            "assets": ["__name__"],
            "results": [
                {{"fail": {{"action": [], "severity": "CRITICAL", "description": "fail on __name__"}}}}
            ],
            "values": [{{"limit": "50"}}],
            "evaluation": "fn main(v) if num(v) < num(limit) then return \"ok\" end return \"fail\" end"
        }}}}"#
    )
}

#[test]
fn asset_delete_withdraws_rules_and_resolves_alerts() {
    let rules_dir = TempDir::new().unwrap();
    let templates_dir = TempDir::new().unwrap();
    std::fs::write(
        templates_dir.path().join("load.default@__datacenter__.rule"),
        single_template("load.default"),
    )
    .unwrap();

    let (state, mut trigger) = engine(&rules_dir);
    let mut library = TemplateLibrary::new(templates_dir.path());
    library.load_all();
    let (control_tx, _control_rx) = mpsc::channel(16);
    let configurator = Configurator::new(state.clone(), library, control_tx);

    configurator.handle_event(&AssetEvent {
        name: "test".into(),
        operation: AssetOp::Create,
        status: "active".into(),
        type_: "datacenter".into(),
        subtype: String::new(),
        priority: "P1".into(),
        parent: String::new(),
        ext: HashMap::new(),
    });
    assert!(state.store.lock().unwrap().contains("load.default@test"));

    // Raise an alert on the instantiated rule.
    feed(&trigger, "load.default", "test", "75", 1000);
    trigger.tick(1000);
    let records = drain(&state);
    assert_eq!(records[0].state, "ACTIVE");

    // Deleting the asset withdraws the rule and resolves its alert.
    configurator.handle_event(&AssetEvent {
        name: "test".into(),
        operation: AssetOp::Delete,
        status: String::new(),
        type_: "datacenter".into(),
        subtype: String::new(),
        priority: String::new(),
        parent: String::new(),
        ext: HashMap::new(),
    });
    trigger.tick(1030);
    let records = drain(&state);
    let resolution = records
        .iter()
        .find(|r| r.rule == "load.default@test" && r.state == "RESOLVED")
        .expect("alert must resolve on asset delete");
    assert_eq!(resolution.description, "Rule deleted");

    assert!(state.store.lock().unwrap().is_empty());
    assert!(!rules_dir.path().join("load.default@test.rule").exists());
    assert!(state.alerts.lock().unwrap().is_empty());
}

#[test]
fn one_phase_template_rejected_on_three_phase_device() {
    let rules_dir = TempDir::new().unwrap();
    let (state, trigger) = engine(&rules_dir);

    // ups-7 reports a second input phase.
    feed(&trigger, "voltage.input.L2", "ups-7", "231", 1000);

    let err = state
        .store
        .lock()
        .unwrap()
        .add(&single_template("voltage.input_1phase").replace("__name__", "ups-7"))
        .unwrap_err();
    assert_eq!(err.code(), -101);
    assert!(!rules_dir.path().join("voltage.input_1phase@ups-7.rule").exists());
}

#[test]
fn orphan_alerts_are_always_resolved() {
    // Universal invariant: every alert's rule exists in the store, or the
    // alert is RESOLVED.
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    feed(&trigger, "abc", "fff", "25", 1000);
    trigger.tick(1000);
    state.store.lock().unwrap().delete("simplethreshold").unwrap();
    trigger.tick(1030);

    let store = state.store.lock().unwrap();
    let alerts = state.alerts.lock().unwrap();
    for alert in alerts.iter() {
        assert!(
            store.contains(&alert.rule) || alert.state == vigil_engine::AlertState::Resolved,
            "orphan alert {} left unresolved",
            alert.id()
        );
    }
}

#[test]
fn store_files_parse_back_to_equal_rules() {
    // Universal invariant: for every rule in the store, its file exists and
    // parses back to an equal rule.
    let dir = TempDir::new().unwrap();
    let (state, _trigger) = engine(&dir);
    {
        let mut store = state.store.lock().unwrap();
        store.add(SIMPLETHRESHOLD).unwrap();
        store
            .add(&single_template("load.default").replace("__name__", "dc-1"))
            .unwrap();
    }

    let store = state.store.lock().unwrap();
    for rule in store.list(None, None) {
        let path = dir.path().join(format!("{}.rule", rule.name()));
        let text = std::fs::read_to_string(&path).unwrap();
        let reparsed = vigil_rules::Rule::from_json(&text).unwrap();
        assert_eq!(&reparsed, rule.as_ref());
    }
}

#[test]
fn concurrent_readers_share_the_state() {
    // The mailbox side reads snapshots while the stream side evaluates.
    let dir = TempDir::new().unwrap();
    let (state, mut trigger) = engine(&dir);
    state.store.lock().unwrap().add(SIMPLETHRESHOLD).unwrap();

    let reader_state = state.clone();
    let reader = std::thread::spawn(move || {
        let mut seen = 0;
        for _ in 0..50 {
            let store = reader_state.store.lock().unwrap();
            seen += store.list(None, None).len();
            drop(store);
            std::thread::yield_now();
        }
        seen
    });

    let resolved = Arc::new(Mutex::new(0usize));
    for i in 0..50u64 {
        feed(&trigger, "abc", "fff", "25", 1000 + i);
        trigger.tick(1000 + i);
        *resolved.lock().unwrap() += drain(&state).len();
    }

    assert!(reader.join().unwrap() > 0);
    assert!(*resolved.lock().unwrap() > 0);
}
