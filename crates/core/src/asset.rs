//! Asset model and in-memory asset database.
//!
//! Assets are described at three levels of detail sharing one underlying
//! record: [`BasicAsset`] (identity, status, type/subtype), [`ExtendedAsset`]
//! (friendly name, parent, priority) and [`FullAsset`] (arbitrary auxiliary
//! attributes passed through from the inventory feed). The database hands out
//! the full record; callers needing less borrow the coarser view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

// ── Layered asset views ─────────────────────────────────────────────

/// Identity-level view of an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BasicAsset {
    /// Internal asset identifier (e.g. "ups-7").
    pub id: String,
    /// Inventory status string; everything except "active" is dormant.
    pub status: String,
    /// Asset type (e.g. "device", "datacenter", "rack").
    #[serde(rename = "type")]
    pub type_: String,
    /// Asset subtype (e.g. "ups", "epdu", "sensor"); may be empty.
    pub subtype: String,
}

impl BasicAsset {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Adds operator-facing attributes on top of [`BasicAsset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtendedAsset {
    #[serde(flatten)]
    pub basic: BasicAsset,
    /// Friendly (external) name shown in alert descriptions.
    pub ename: String,
    /// Identifier of the parent asset; empty at topology roots.
    pub parent: String,
    /// Operator priority (1 = highest).
    pub priority: u8,
}

/// Complete asset record: extended view plus untouched auxiliary attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FullAsset {
    #[serde(flatten)]
    pub ext: ExtendedAsset,
    /// Auxiliary attributes from the inventory feed, passed through untouched.
    #[serde(default)]
    pub aux: HashMap<String, String>,
}

impl FullAsset {
    /// Coarsest view of this asset.
    pub fn as_basic(&self) -> &BasicAsset {
        &self.ext.basic
    }

    /// Mid-level view of this asset.
    pub fn as_extended(&self) -> &ExtendedAsset {
        &self.ext
    }

    pub fn id(&self) -> &str {
        &self.ext.basic.id
    }

    pub fn is_active(&self) -> bool {
        self.ext.basic.is_active()
    }

    /// Look up an auxiliary attribute.
    pub fn aux_value(&self, key: &str) -> Option<&str> {
        self.aux.get(key).map(String::as_str)
    }
}

// ── Asset database ──────────────────────────────────────────────────

/// Process-wide asset inventory with explicit construction and clearing.
///
/// Cheap to clone; all clones share the same underlying map. Written by the
/// configurator, read by the trigger.
#[derive(Debug, Clone, Default)]
pub struct AssetDb {
    inner: Arc<RwLock<HashMap<String, FullAsset>>>,
}

impl AssetDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an asset record.
    pub fn upsert(&self, asset: FullAsset) {
        let mut map = self.inner.write().expect("asset db lock poisoned");
        map.insert(asset.id().to_string(), asset);
    }

    /// Remove an asset, returning the outgoing record if present.
    pub fn remove(&self, id: &str) -> Option<FullAsset> {
        self.inner
            .write()
            .expect("asset db lock poisoned")
            .remove(id)
    }

    /// Clone out an asset record.
    pub fn get(&self, id: &str) -> Option<FullAsset> {
        self.inner
            .read()
            .expect("asset db lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .expect("asset db lock poisoned")
            .contains_key(id)
    }

    /// Friendly name of an asset, or the id itself when unknown.
    pub fn ename_or_id(&self, id: &str) -> String {
        match self.get(id) {
            Some(a) if !a.ext.ename.is_empty() => a.ext.ename.clone(),
            _ => id.to_string(),
        }
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.inner.write().expect("asset db lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("asset db lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FullAsset {
        FullAsset {
            ext: ExtendedAsset {
                basic: BasicAsset {
                    id: "ups-7".into(),
                    status: "active".into(),
                    type_: "device".into(),
                    subtype: "ups".into(),
                },
                ename: "Server room UPS".into(),
                parent: "room-1".into(),
                priority: 1,
            },
            aux: HashMap::from([("port".to_string(), "4".to_string())]),
        }
    }

    #[test]
    fn views_share_one_record() {
        let asset = sample();
        assert_eq!(asset.as_basic().id, "ups-7");
        assert_eq!(asset.as_extended().ename, "Server room UPS");
        assert_eq!(asset.aux_value("port"), Some("4"));
        assert_eq!(asset.aux_value("missing"), None);
    }

    #[test]
    fn db_upsert_get_remove() {
        let db = AssetDb::new();
        db.upsert(sample());
        assert!(db.contains("ups-7"));
        assert_eq!(db.get("ups-7").unwrap().ext.priority, 1);
        assert_eq!(db.ename_or_id("ups-7"), "Server room UPS");
        assert_eq!(db.ename_or_id("unknown"), "unknown");

        let gone = db.remove("ups-7").unwrap();
        assert_eq!(gone.id(), "ups-7");
        assert!(db.get("ups-7").is_none());
    }

    #[test]
    fn clones_share_state_and_clear_empties() {
        let db = AssetDb::new();
        let other = db.clone();
        db.upsert(sample());
        assert_eq!(other.len(), 1);
        other.clear();
        assert!(db.is_empty());
    }

    #[test]
    fn nonactive_status() {
        let mut asset = sample();
        asset.ext.basic.status = "nonactive".into();
        assert!(!asset.is_active());
    }
}
