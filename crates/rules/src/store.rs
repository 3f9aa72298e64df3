//! Persistent rule store.
//!
//! The store owns every rule exclusively and hands out shared read-only
//! references. It is the single writer of its on-disk directory: one
//! `<name>.rule` file per rule, updated atomically by writing
//! `<name>.rule.new`, removing the old file, then renaming. Every mutating
//! operation is persisted before the in-memory change is published to
//! observers; on persistence failure the in-memory state is untouched.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use vigil_core::error::EngineError;

use crate::rule::{Rule, RuleKind, RuleMatcher};

/// Probe for the metric last-value store: `(metric, asset) → exists`.
///
/// Suitability predicates use this to inspect the device's phase wiring
/// before a templated rule is admitted.
pub type MetricProbe = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

// ── Observers ───────────────────────────────────────────────────────

/// Store change notifications.
///
/// Callbacks run synchronously while the caller holds the store's write
/// lock, after the change is durable on disk. The delete callback fires
/// before the rule is dropped. Calling back into the store is forbidden.
pub trait RuleObserver: Send {
    fn on_create(&self, _rule: &Arc<Rule>) {}
    fn on_update(&self, _old: &Arc<Rule>, _new: &Arc<Rule>) {}
    fn on_delete(&self, _rule: &Arc<Rule>) {}
}

// ── Store ───────────────────────────────────────────────────────────

pub struct RuleStore {
    dir: PathBuf,
    rules: BTreeMap<String, Arc<Rule>>,
    /// Declared metric (patterns: the pattern string verbatim) → rule names.
    metric_index: HashMap<String, Vec<String>>,
    observers: Vec<Box<dyn RuleObserver>>,
    probe: MetricProbe,
}

impl RuleStore {
    /// Open a store over `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Persistence(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            rules: BTreeMap::new(),
            metric_index: HashMap::new(),
            observers: Vec::new(),
            probe: Arc::new(|_, _| false),
        })
    }

    /// Install the metric probe used by suitability predicates.
    pub fn set_probe(&mut self, probe: MetricProbe) {
        self.probe = probe;
    }

    pub fn add_observer(&mut self, observer: Box<dyn RuleObserver>) {
        self.observers.push(observer);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Scan the directory and load every valid `*.rule` file.
    ///
    /// Before loading, interrupted renames are repaired: a `.rule.new`
    /// orphan without its committed counterpart is promoted, one alongside
    /// a committed file is dropped. Files whose basename differs from the
    /// rule name inside, unparsable files, and duplicate names are skipped
    /// with a warning (first wins); nothing is deleted from disk.
    pub fn load_all(&mut self) -> Result<usize, EngineError> {
        self.recover_interrupted_renames()?;

        let mut loaded = 0;
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "rule").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read rule file");
                    continue;
                }
            };
            let rule = match Rule::from_json(&text) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot parse rule file");
                    continue;
                }
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if stem != rule.name() {
                warn!(
                    path = %path.display(),
                    rule = %rule.name(),
                    "file name differs from rule name, ignoring"
                );
                continue;
            }
            if self.rules.contains_key(rule.name()) {
                warn!(rule = %rule.name(), path = %path.display(), "duplicate rule name, ignoring");
                continue;
            }
            let rule = Arc::new(rule);
            self.index_add(&rule);
            self.rules.insert(rule.name().to_string(), rule);
            loaded += 1;
        }

        info!(count = loaded, dir = %self.dir.display(), "rules loaded");
        Ok(loaded)
    }

    fn recover_interrupted_renames(&self) -> Result<(), EngineError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let Some(committed_name) = name.strip_suffix(".new") else {
                continue;
            };
            if !committed_name.ends_with(".rule") {
                continue;
            }
            let committed = self.dir.join(committed_name);
            if committed.exists() {
                warn!(path = %path.display(), "dropping uncommitted rule update");
                let _ = fs::remove_file(&path);
            } else {
                warn!(path = %path.display(), "recovering interrupted rule rename");
                fs::rename(&path, &committed)?;
            }
        }
        Ok(())
    }

    // ── Persistence primitives ──────────────────────────────────────

    fn rule_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.rule", name))
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.rule.new", name))
    }

    fn remove_committed(&self, name: &str) -> Result<(), EngineError> {
        match fs::remove_file(self.rule_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Persistence(format!("{}.rule: {}", name, e))),
        }
    }

    /// Write-new, remove-old, rename. Leaves the previous file intact on
    /// failure.
    fn persist(&self, rule: &Rule, replaces: &str) -> Result<(), EngineError> {
        let staging = self.staging_path(rule.name());
        fs::write(&staging, rule.to_json())
            .map_err(|e| EngineError::Persistence(format!("{}: {}", staging.display(), e)))?;

        if let Err(e) = self.remove_committed(replaces) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        fs::rename(&staging, self.rule_path(rule.name()))
            .map_err(|e| EngineError::Persistence(format!("{}: {}", staging.display(), e)))?;
        debug!(rule = %rule.name(), "rule persisted");
        Ok(())
    }

    // ── Suitability predicates ──────────────────────────────────────

    fn check_suitability(&self, rule: &Rule) -> Result<(), EngineError> {
        let name = rule.name();

        // Sensor ambient rules are only ever instantiated via their logical
        // asset, never directly against the sensor.
        if name.starts_with("humidity.default@sensor-")
            || name.starts_with("temperature.default@sensor-")
        {
            return Err(EngineError::RejectedBySuitability(name.to_string(), -100));
        }

        let asset = name.split_once('@').map(|(_, a)| a).unwrap_or("");
        let has = |metric: &str| (self.probe)(metric, asset);

        let reject = if name.starts_with("voltage.input_1phase@ups-")
            || name.starts_with("voltage.input_1phase@epdu-")
        {
            // 1-phase rule on a 3-phase device
            has("voltage.input.L2") || has("voltage.input.L3")
        } else if name.starts_with("voltage.input_3phase@ups-")
            || name.starts_with("voltage.input_3phase@epdu-")
        {
            // 3-phase rule on a 1-phase device
            !(has("voltage.input.L2") && has("voltage.input.L3"))
        } else if name.starts_with("load.input_1phase@epdu-") {
            has("load.input.L2") || has("load.input.L3")
        } else if name.starts_with("load.input_3phase@epdu-") {
            !(has("load.input.L2") && has("load.input.L3"))
        } else if name.starts_with("phase_imbalance@") {
            !(has("realpower.output.L2") && has("realpower.output.L3"))
        } else {
            false
        };

        if reject {
            debug!(rule = %name, "rule rejected by phase suitability");
            Err(EngineError::RejectedBySuitability(name.to_string(), -101))
        } else {
            Ok(())
        }
    }

    // ── Metric index ────────────────────────────────────────────────

    fn index_add(&mut self, rule: &Arc<Rule>) {
        for metric in rule.metrics() {
            self.metric_index
                .entry(metric.clone())
                .or_default()
                .push(rule.name().to_string());
        }
    }

    fn index_remove(&mut self, rule: &Rule) {
        for metric in rule.metrics() {
            if let Some(names) = self.metric_index.get_mut(metric) {
                names.retain(|n| n != rule.name());
                if names.is_empty() {
                    self.metric_index.remove(metric);
                }
            }
        }
    }

    /// Rules subscribed to a declared metric identifier.
    pub fn rules_for_metric(&self, metric: &str) -> Vec<Arc<Rule>> {
        self.metric_index
            .get(metric)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.rules.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn metric_index(&self) -> &HashMap<String, Vec<String>> {
        &self.metric_index
    }

    // ── Mutating operations ─────────────────────────────────────────

    /// Parse, vet and persist a new rule, then publish it.
    pub fn add(&mut self, json: &str) -> Result<Arc<Rule>, EngineError> {
        let rule = Rule::from_json(json)?;
        self.check_suitability(&rule)?;
        if self.rules.contains_key(rule.name()) {
            return Err(EngineError::Duplicate(rule.name().to_string()));
        }

        self.persist(&rule, rule.name())?;

        let rule = Arc::new(rule);
        self.index_add(&rule);
        self.rules.insert(rule.name().to_string(), rule.clone());
        for observer in &self.observers {
            observer.on_create(&rule);
        }
        info!(rule = %rule.name(), "rule added");
        Ok(rule)
    }

    /// Replace `old_name` with a new document, possibly under a new name.
    ///
    /// The new rule is materialized on disk first; only then is the old file
    /// and in-memory entry removed and the new entry inserted.
    pub fn update(&mut self, json: &str, old_name: &str) -> Result<Arc<Rule>, EngineError> {
        if !self.rules.contains_key(old_name) {
            return Err(EngineError::NotFound(old_name.to_string()));
        }
        let rule = Rule::from_json(json)?;
        if rule.name() != old_name && self.rules.contains_key(rule.name()) {
            return Err(EngineError::NameConflict(rule.name().to_string()));
        }

        self.persist(&rule, old_name)?;

        let old = self
            .rules
            .remove(old_name)
            .expect("checked above while holding the lock");
        self.index_remove(&old);

        let rule = Arc::new(rule);
        self.index_add(&rule);
        self.rules.insert(rule.name().to_string(), rule.clone());
        for observer in &self.observers {
            observer.on_update(&old, &rule);
        }
        info!(old = %old_name, new = %rule.name(), "rule updated");
        Ok(rule)
    }

    /// Delete one rule by name.
    pub fn delete(&mut self, name: &str) -> Result<Arc<Rule>, EngineError> {
        if !self.rules.contains_key(name) {
            return Err(EngineError::NotFound(name.to_string()));
        }
        self.remove_committed(name)?;

        let rule = self.rules.remove(name).expect("checked above");
        self.index_remove(&rule);
        for observer in &self.observers {
            observer.on_delete(&rule);
        }
        info!(rule = %name, "rule deleted");
        Ok(rule)
    }

    /// Delete every rule accepted by the matcher; returns the outgoing rules.
    pub fn delete_matching(
        &mut self,
        matcher: &dyn RuleMatcher,
    ) -> Result<Vec<Arc<Rule>>, EngineError> {
        let names: Vec<String> = self
            .rules
            .values()
            .filter(|r| matcher.matches(r))
            .map(|r| r.name().to_string())
            .collect();

        let mut deleted = Vec::with_capacity(names.len());
        for name in names {
            deleted.push(self.delete(&name)?);
        }
        Ok(deleted)
    }

    // ── Read operations ─────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Rules filtered by kind (`None` = all) and class (`None` = all),
    /// ordered by name.
    pub fn list(&self, kind: Option<RuleKind>, class: Option<&str>) -> Vec<Arc<Rule>> {
        self.rules
            .values()
            .filter(|r| kind.map(|k| r.kind() == k).unwrap_or(true))
            .filter(|r| class.map(|c| r.class() == c).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// All rules ordered by name (the evaluator's deterministic order).
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
