//! Metric last-value table.
//!
//! Stores the most recent value for each `<metric>@<asset>` key together with
//! its TTL. Expired entries migrate to the inactive set, which evaluating
//! rules treat as an outage. The table is written by the trigger stream actor
//! only; everyone else works from a [`MetricSnapshot`].

use std::collections::{HashMap, HashSet};

use tracing::debug;

// ── Entries and snapshots ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct MetricEntry {
    value: String,
    ttl: u64,
    deadline: u64,
}

/// Point-in-time copy of the table handed to the evaluator.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    /// `key → value` for every live metric.
    pub values: HashMap<String, String>,
    /// `key → ttl` (seconds) for every live metric.
    pub ttls: HashMap<String, u64>,
    /// Keys announced or detected as unavailable.
    pub inactive: HashSet<String>,
}

// ── Metric table ────────────────────────────────────────────────────

/// Last-value store keyed by `<metric>@<asset>`.
#[derive(Debug, Default)]
pub struct MetricTable {
    active: HashMap<String, MetricEntry>,
    inactive: HashSet<String>,
}

impl MetricTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a metric arrival. A TTL of zero means the value never expires.
    pub fn update(&mut self, key: &str, value: &str, ttl: u64, now: u64) {
        let deadline = if ttl == 0 { u64::MAX } else { now + ttl };
        self.inactive.remove(key);
        self.active.insert(
            key.to_string(),
            MetricEntry {
                value: value.to_string(),
                ttl,
                deadline,
            },
        );
    }

    /// Mark a key unavailable (explicit outage announcement).
    pub fn mark_unavailable(&mut self, key: &str) {
        self.active.remove(key);
        self.inactive.insert(key.to_string());
    }

    /// Migrate expired entries to the inactive set; returns the expired keys.
    pub fn sweep(&mut self, now: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, e)| e.deadline < now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            debug!(key = %key, "metric expired");
            self.active.remove(key);
            self.inactive.insert(key.clone());
        }
        expired
    }

    /// Whether an active value exists for `<metric>@<asset>`.
    pub fn has_active(&self, metric: &str, asset: &str) -> bool {
        self.active.contains_key(&format!("{}@{}", metric, asset))
    }

    /// Copy out the current state for evaluation.
    pub fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            values: self
                .active
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
            ttls: self.active.iter().map(|(k, e)| (k.clone(), e.ttl)).collect(),
            inactive: self.inactive.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.inactive.clear();
    }
}
