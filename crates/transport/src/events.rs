//! Typed payloads exchanged with the engine's collaborators.
//!
//! These are the decoded forms the core consumes and emits; the framing
//! around them is a transport concern.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Stream topics.
pub mod topics {
    /// Metric arrivals (`MetricUpdate`).
    pub const METRICS: &str = "metrics";
    /// Outage announcements (`MetricUnavailable`).
    pub const METRICS_UNAVAILABLE: &str = "metrics.unavailable";
    /// Licensing announcements enabling/disabling the evaluator.
    pub const LICENSING: &str = "licensing";
    /// Asset inventory lifecycle events (`AssetEvent`).
    pub const ASSETS: &str = "assets";
    /// Published alert transitions (`AlertRecord`).
    pub const ALERTS: &str = "alerts";
}

// ── Metric stream ───────────────────────────────────────────────────

/// A metric arrival on the telemetry stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricUpdate {
    pub metric: String,
    pub asset: String,
    pub value: String,
    #[serde(default)]
    pub unit: String,
    /// Seconds until the value goes stale; 0 = never.
    pub ttl: u64,
}

impl MetricUpdate {
    /// The `<metric>@<asset>` key this update lands under.
    pub fn key(&self) -> String {
        format!("{}@{}", self.metric, self.asset)
    }
}

/// An explicit outage announcement for a metric key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricUnavailable {
    pub key: String,
}

/// Licensing announcement gating the whole evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LicensingUpdate {
    pub enabled: bool,
}

// ── Asset inventory feed ────────────────────────────────────────────

/// Asset lifecycle operations announced by the inventory feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssetOp {
    Create,
    Update,
    Delete,
    Retire,
    Inventory,
}

/// One asset lifecycle event.
///
/// `status`, `type`, `subtype`, `priority` and `parent_name.1` are the
/// auxiliary fields the engine interprets; everything else rides along in
/// `ext` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetEvent {
    pub name: String,
    pub operation: AssetOp,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub priority: String,
    #[serde(rename = "parent_name.1", default)]
    pub parent: String,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

// ── Published alert record ──────────────────────────────────────────

/// One alert transition as published on the output stream.
///
/// Two tables (`aux`, `actions`) and seven scalars, in the wire order
/// `mtime`, `ttl`, `rule`, `element`, `state`, `severity`, `description`.
/// `aux` always carries `ctime`; triggered emissions add `outcome` and, for
/// multi-item outcomes, `outcome_count` plus one `outcome.<i>` per label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRecord {
    pub aux: BTreeMap<String, String>,
    pub mtime: u64,
    pub ttl: u64,
    pub rule: String,
    pub element: String,
    pub state: String,
    pub severity: String,
    pub description: String,
    pub actions: Vec<String>,
}

impl AlertRecord {
    /// Whether this record still names an active (non-resolved) condition.
    pub fn is_active(&self) -> bool {
        self.state == "ACTIVE"
    }
}
