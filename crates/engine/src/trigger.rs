//! The trigger: metric intake, tick evaluation and alert emission.
//!
//! Each tick the evaluator sweeps expired metrics, walks the rule store in
//! name order, evaluates every rule over its declared assets and feeds the
//! results through the alert state machine. An element that produced no
//! result this tick counts as resolved. Emissions go through a bounded
//! queue; when the output stream is not draining, the oldest non-ACTIVE
//! transitions are dropped first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use vigil_core::asset::AssetDb;
use vigil_core::error::EngineError;
use vigil_core::metrics::{MetricSnapshot, MetricTable};
use vigil_rules::rule::Rule;
use vigil_rules::store::{RuleObserver, RuleStore};
use vigil_transport::events::{topics, AlertRecord, MetricUpdate};
use vigil_transport::{Bus, Message};

use crate::alert::{Alert, AlertState, TokenContext};

/// Default emission queue capacity.
pub const EMISSION_CAPACITY: usize = 1024;

/// Current wall-clock seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ── Alert table ─────────────────────────────────────────────────────

/// All live alerts, keyed by `(rule, element)`.
///
/// Elements are kept ordered per rule so resolutions for absent elements
/// are emitted deterministically.
#[derive(Debug, Default)]
pub struct AlertTable {
    by_rule: HashMap<String, BTreeMap<String, Alert>>,
}

impl AlertTable {
    pub fn get_mut(&mut self, rule: &str, element: &str) -> Option<&mut Alert> {
        self.by_rule.get_mut(rule)?.get_mut(element)
    }

    pub fn insert(&mut self, alert: Alert) {
        self.by_rule
            .entry(alert.rule.clone())
            .or_default()
            .insert(alert.element.clone(), alert);
    }

    pub fn remove(&mut self, rule: &str, element: &str) -> Option<Alert> {
        let alerts = self.by_rule.get_mut(rule)?;
        let removed = alerts.remove(element);
        if alerts.is_empty() {
            self.by_rule.remove(rule);
        }
        removed
    }

    /// Remove a rule's whole alert set, returning it.
    pub fn take_rule(&mut self, rule: &str) -> Vec<Alert> {
        self.by_rule
            .remove(rule)
            .map(|alerts| alerts.into_values().collect())
            .unwrap_or_default()
    }

    pub fn rule_elements(&self, rule: &str) -> Vec<String> {
        self.by_rule
            .get(rule)
            .map(|alerts| alerts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        self.by_rule.values().flat_map(|alerts| alerts.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Alert> {
        self.by_rule.values_mut().flat_map(|alerts| alerts.values_mut())
    }

    pub fn len(&self) -> usize {
        self.by_rule.values().map(|alerts| alerts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Emission queue ──────────────────────────────────────────────────

/// Bounded buffer between the evaluator and the output stream.
#[derive(Debug)]
pub struct EmissionQueue {
    queue: VecDeque<AlertRecord>,
    capacity: usize,
}

impl EmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue a record; on overflow the oldest non-ACTIVE record is dropped
    /// first, then the oldest outright.
    pub fn push(&mut self, record: AlertRecord) {
        if self.queue.len() >= self.capacity {
            let victim = self
                .queue
                .iter()
                .position(|r| !r.is_active())
                .unwrap_or(0);
            let dropped = self.queue.remove(victim);
            if let Some(dropped) = dropped {
                warn!(
                    rule = %dropped.rule,
                    element = %dropped.element,
                    "emission queue overflow, dropping transition"
                );
            }
        }
        self.queue.push_back(record);
    }

    pub fn pop_front(&mut self) -> Option<AlertRecord> {
        self.queue.pop_front()
    }

    /// Put an unsent record back for the next flush attempt.
    pub fn push_front(&mut self, record: AlertRecord) {
        self.queue.push_front(record);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain everything (used by tests and shutdown).
    pub fn take_all(&mut self) -> Vec<AlertRecord> {
        self.queue.drain(..).collect()
    }
}

impl Default for EmissionQueue {
    fn default() -> Self {
        Self::new(EMISSION_CAPACITY)
    }
}

// ── Rule change feed ────────────────────────────────────────────────

/// Store mutations relevant to the evaluator, recorded by the observer and
/// drained by the trigger (observers must not reenter the store).
#[derive(Debug, Clone, PartialEq)]
pub enum RuleChange {
    /// A rule was replaced; alerts under the old name resolve.
    Updated { old_name: String },
    /// A rule was withdrawn; its alerts resolve with "Rule deleted".
    Deleted { name: String },
}

#[derive(Debug, Clone, Default)]
pub struct RuleChangeQueue(Arc<Mutex<VecDeque<RuleChange>>>);

impl RuleChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: RuleChange) {
        self.0.lock().expect("rule change lock poisoned").push_back(change);
    }

    pub fn drain(&self) -> Vec<RuleChange> {
        self.0
            .lock()
            .expect("rule change lock poisoned")
            .drain(..)
            .collect()
    }
}

/// Store observer forwarding changes to the trigger.
pub struct StoreWatcher(pub RuleChangeQueue);

impl RuleObserver for StoreWatcher {
    fn on_update(&self, old: &Arc<Rule>, _new: &Arc<Rule>) {
        self.0.push(RuleChange::Updated {
            old_name: old.name().to_string(),
        });
    }

    fn on_delete(&self, rule: &Arc<Rule>) {
        self.0.push(RuleChange::Deleted {
            name: rule.name().to_string(),
        });
    }
}

// ── Shared engine state ─────────────────────────────────────────────

/// Handles shared by the three actors; one mutex per structure.
#[derive(Clone)]
pub struct EngineState {
    pub store: Arc<Mutex<RuleStore>>,
    pub metrics: Arc<Mutex<MetricTable>>,
    pub alerts: Arc<Mutex<AlertTable>>,
    pub emissions: Arc<Mutex<EmissionQueue>>,
    pub assets: AssetDb,
}

impl EngineState {
    /// Wire shared state around a store: the store's suitability probe reads
    /// the metric table, the store's observer feeds `changes`.
    pub fn new(mut store: RuleStore, changes: RuleChangeQueue) -> Self {
        let metrics = Arc::new(Mutex::new(MetricTable::new()));
        let probe_metrics = metrics.clone();
        store.set_probe(Arc::new(move |metric, asset| {
            probe_metrics
                .lock()
                .expect("metric table lock poisoned")
                .has_active(metric, asset)
        }));
        store.add_observer(Box::new(StoreWatcher(changes)));

        Self {
            store: Arc::new(Mutex::new(store)),
            metrics,
            alerts: Arc::new(Mutex::new(AlertTable::default())),
            emissions: Arc::new(Mutex::new(EmissionQueue::default())),
            assets: AssetDb::new(),
        }
    }

    /// Token values for an element, pulled from the asset database.
    pub fn token_context(&self, element: &str, severity: &str) -> TokenContext {
        let asset = self.assets.get(element);
        let (logical_iname, normal_state, port) = match &asset {
            Some(a) => (
                a.aux_value("logical_asset").unwrap_or_default().to_string(),
                a.aux_value("normal_state").unwrap_or_default().to_string(),
                a.aux_value("port").unwrap_or_default().to_string(),
            ),
            None => Default::default(),
        };
        let logical_ename = if logical_iname.is_empty() {
            String::new()
        } else {
            self.assets.ename_or_id(&logical_iname)
        };
        TokenContext {
            severity: severity.to_string(),
            name: element.to_string(),
            ename: self.assets.ename_or_id(element),
            logical_asset_iname: logical_iname,
            logical_asset_ename: logical_ename,
            normal_state,
            port,
        }
    }

    fn emit(&self, alert: &Alert) {
        let ctx = self.token_context(&alert.element, &alert.severity);
        self.emissions
            .lock()
            .expect("emission lock poisoned")
            .push(alert.to_record(&ctx));
    }

    /// Resolve and prune every alert attached to a rule, emitting one
    /// transition per alert. Used on rule withdrawal and TOUCH.
    pub fn resolve_rule_alerts(&self, rule: &str, description: &str, now: u64) -> usize {
        let mut alerts = self.alerts.lock().expect("alert table lock poisoned");
        let mut resolved = alerts.take_rule(rule);
        drop(alerts);

        for alert in &mut resolved {
            alert.resolve(Some(description), now);
            self.emit(alert);
        }
        resolved.len()
    }

    /// Resolve (but keep) every alert whose element matches; used when an
    /// asset leaves the active status.
    pub fn resolve_element_alerts(&self, element: &str, now: u64) -> usize {
        let mut emitted = Vec::new();
        {
            let mut alerts = self.alerts.lock().expect("alert table lock poisoned");
            for alert in alerts.iter_mut() {
                if alert.element == element && alert.state != AlertState::Resolved {
                    alert.resolve(None, now);
                    emitted.push(alert.clone());
                }
            }
        }
        for alert in &emitted {
            self.emit(alert);
        }
        emitted.len()
    }

    /// Apply an operator acknowledgement and emit the transition.
    pub fn ack_alert(
        &self,
        rule: &str,
        element: &str,
        requested: &str,
        _now: u64,
    ) -> Result<(), EngineError> {
        let updated = {
            let mut alerts = self.alerts.lock().expect("alert table lock poisoned");
            let alert = alerts
                .get_mut(rule, element)
                .ok_or_else(|| EngineError::NotFound(format!("{}@{}", rule, element)))?;
            alert.switch_state(requested)?;
            alert.clone()
        };
        self.emit(&updated);
        Ok(())
    }
}

// ── Trigger ─────────────────────────────────────────────────────────

/// The evaluator driven by the trigger-stream actor.
pub struct Trigger {
    state: EngineState,
    changes: RuleChangeQueue,
    enabled: bool,
    tick_secs: u64,
}

impl Trigger {
    pub fn new(state: EngineState, changes: RuleChangeQueue, tick_secs: u64) -> Self {
        Self {
            state,
            changes,
            enabled: true,
            tick_secs: tick_secs.max(1),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Fallback alert TTL when no contributing metric carries one.
    fn default_ttl(&self) -> u64 {
        3 * self.tick_secs
    }

    // ── Stream intake ───────────────────────────────────────────────

    pub fn handle_metric(&self, update: &MetricUpdate, now: u64) {
        self.state
            .metrics
            .lock()
            .expect("metric table lock poisoned")
            .update(&update.key(), &update.value, update.ttl, now);
    }

    pub fn handle_unavailable(&self, key: &str) {
        self.state
            .metrics
            .lock()
            .expect("metric table lock poisoned")
            .mark_unavailable(key);
    }

    /// Licensing announcements gate the whole evaluator.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(enabled, "evaluator licensing state changed");
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // ── Rule-change intake ──────────────────────────────────────────

    /// Apply store mutations recorded since the last call.
    pub fn drain_rule_changes(&self, now: u64) {
        for change in self.changes.drain() {
            match change {
                RuleChange::Updated { old_name } => {
                    self.state
                        .resolve_rule_alerts(&old_name, "Rule was changed implicitly", now);
                }
                RuleChange::Deleted { name } => {
                    self.state.resolve_rule_alerts(&name, "Rule deleted", now);
                }
            }
        }
    }

    // ── Tick ────────────────────────────────────────────────────────

    /// One evaluator iteration; returns the number of queued emissions.
    pub fn tick(&mut self, now: u64) -> usize {
        self.drain_rule_changes(now);
        if !self.enabled {
            debug!("evaluator disabled, skipping tick");
            return 0;
        }

        let snapshot = {
            let mut metrics = self.state.metrics.lock().expect("metric table lock poisoned");
            metrics.sweep(now);
            metrics.snapshot()
        };

        let rules: Vec<Arc<Rule>> = {
            let store = self.state.store.lock().expect("rule store lock poisoned");
            store.iter().cloned().collect()
        };

        let mut emitted = 0;
        for rule in rules {
            emitted += self.evaluate_rule(&rule, &snapshot, now);
        }
        emitted += self.sweep_stale(now);
        emitted
    }

    /// Evaluate one rule and run its results through the state machine.
    fn evaluate_rule(&self, rule: &Rule, snapshot: &MetricSnapshot, now: u64) -> usize {
        let hits = match rule.evaluate_over(&snapshot.values, &snapshot.inactive) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(rule = %rule.name(), error = %e, "evaluation failed, skipping rule");
                return 0;
            }
        };
        // An unknown outcome label is an evaluation error too.
        for hit in &hits {
            let label = &hit.labels[0];
            if label != "ok" && !rule.results().contains_key(label) {
                warn!(rule = %rule.name(), outcome = %label, "unknown outcome label, skipping rule");
                return 0;
            }
        }

        let mut emitted = 0;
        let mut seen: HashSet<String> = HashSet::new();

        for hit in hits {
            seen.insert(hit.element.clone());
            let ttl = hit
                .metric_keys
                .iter()
                .filter_map(|key| snapshot.ttls.get(key).copied())
                .filter(|&ttl| ttl > 0)
                .max()
                .unwrap_or_else(|| self.default_ttl());
            let resolved = hit.labels[0] == "ok";

            let mut alerts = self.state.alerts.lock().expect("alert table lock poisoned");
            let outgoing = match alerts.get_mut(rule.name(), &hit.element) {
                None => {
                    if resolved {
                        None
                    } else {
                        let alert = Alert::start(
                            rule.name(),
                            &hit.element,
                            rule.results().clone(),
                            hit.labels,
                            ttl,
                            now,
                        );
                        debug!(rule = %rule.name(), element = %hit.element, "alert started");
                        alerts.insert(alert.clone());
                        Some(alert)
                    }
                }
                Some(alert) => {
                    if resolved {
                        if alert.state == AlertState::Resolved {
                            None
                        } else {
                            alert.resolve(None, now);
                            Some(alert.clone())
                        }
                    } else if alert.state == AlertState::Resolved {
                        alert.reactivate(hit.labels, ttl, now);
                        Some(alert.clone())
                    } else {
                        alert.update(hit.labels, ttl, now);
                        Some(alert.clone())
                    }
                }
            };
            drop(alerts);

            if let Some(alert) = outgoing {
                self.state.emit(&alert);
                emitted += 1;
            }
        }

        // Elements that produced no result this tick count as resolved.
        let absent: Vec<String> = {
            let alerts = self.state.alerts.lock().expect("alert table lock poisoned");
            alerts
                .rule_elements(rule.name())
                .into_iter()
                .filter(|element| !seen.contains(element))
                .collect()
        };
        for element in absent {
            let resolved = {
                let mut alerts = self.state.alerts.lock().expect("alert table lock poisoned");
                match alerts.get_mut(rule.name(), &element) {
                    Some(alert) if alert.state != AlertState::Resolved => {
                        alert.resolve(None, now);
                        Some(alert.clone())
                    }
                    _ => None,
                }
            };
            if let Some(alert) = resolved {
                self.state.emit(&alert);
                emitted += 1;
            }
        }
        emitted
    }

    /// Emit stale records; drop stale alerts unless they are ACTIVE.
    fn sweep_stale(&self, now: u64) -> usize {
        let stale: Vec<(String, String, AlertRecord, AlertState)> = {
            let alerts = self.state.alerts.lock().expect("alert table lock poisoned");
            alerts
                .iter()
                .filter(|a| a.is_stale(now))
                .map(|a| (a.rule.clone(), a.element.clone(), a.stale_record(), a.state))
                .collect()
        };

        let emitted = stale.len();
        for (rule, element, record, state) in stale {
            debug!(rule = %rule, element = %element, "alert went stale");
            self.state
                .emissions
                .lock()
                .expect("emission lock poisoned")
                .push(record);
            if state != AlertState::Active {
                self.state
                    .alerts
                    .lock()
                    .expect("alert table lock poisoned")
                    .remove(&rule, &element);
            }
        }
        emitted
    }
}

// ── Emission flushing ───────────────────────────────────────────────

/// Push queued records onto the output stream.
///
/// Best-effort: a transport failure puts the record back and stops; the
/// next tick retries.
pub fn flush_emissions(state: &EngineState, bus: &Bus) -> usize {
    let mut sent = 0;
    loop {
        let record = {
            let mut emissions = state.emissions.lock().expect("emission lock poisoned");
            emissions.pop_front()
        };
        let Some(record) = record else {
            return sent;
        };

        let message = match Message::new(topics::ALERTS, &record) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "cannot encode alert record, dropping");
                continue;
            }
        };
        match bus.publish(&message) {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(error = %e, "alert stream not draining, retrying next tick");
                state
                    .emissions
                    .lock()
                    .expect("emission lock poisoned")
                    .push_front(record);
                return sent;
            }
        }
    }
}
