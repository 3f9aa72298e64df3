//! Rule template library.
//!
//! Templates are ordinary rule documents containing `__name__` placeholders,
//! stored one per `*.rule` file. The part of the file stem after `@` names
//! the asset family the template applies to: `__device_ups__` targets
//! `(type=device, subtype=ups)`, `__datacenter__` targets any datacenter.
//! Instantiation substitutes the asset identifier for every placeholder and
//! hands the result to the rule factory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use vigil_core::error::EngineError;

use crate::rule::Rule;

/// Placeholder replaced by the asset identifier at instantiation time.
pub const NAME_PLACEHOLDER: &str = "__name__";

// ── Template ────────────────────────────────────────────────────────

/// One template document, not yet bound to an asset.
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    /// File stem, e.g. `voltage.input_1phase@__device_ups__`.
    pub name: String,
    /// Raw document text with placeholders.
    pub body: String,
}

impl RuleTemplate {
    /// The `__…__` family token after `@` in the template name.
    fn target(&self) -> Option<&str> {
        let (_, suffix) = self.name.split_once('@')?;
        suffix
            .strip_prefix("__")
            .and_then(|s| s.strip_suffix("__"))
    }

    /// Whether this template targets the given asset family.
    pub fn applies_to(&self, type_: &str, subtype: &str) -> bool {
        match self.target() {
            Some(target) => {
                target == type_
                    || (!subtype.is_empty() && target == format!("{}_{}", type_, subtype))
            }
            None => false,
        }
    }

    /// Substitute the asset identifier into the template body.
    pub fn instantiate(&self, asset: &str) -> String {
        self.body.replace(NAME_PLACEHOLDER, asset)
    }

    /// Instantiate and run the result through the rule factory.
    pub fn instantiate_rule(&self, asset: &str) -> Result<Rule, EngineError> {
        Rule::from_json(&self.instantiate(asset))
    }
}

// ── Library ─────────────────────────────────────────────────────────

/// All templates found in the template directory.
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    dir: PathBuf,
    templates: Vec<RuleTemplate>,
}

impl TemplateLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            templates: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the template directory.
    ///
    /// A missing directory is not fatal: the engine simply synthesizes no
    /// rules for new assets.
    pub fn load_all(&mut self) -> usize {
        self.templates.clear();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot read template directory");
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "rule").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            match fs::read_to_string(&path) {
                Ok(body) => {
                    debug!(template = %name, "template loaded");
                    self.templates.push(RuleTemplate { name, body });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read template"),
            }
        }
        self.templates.len()
    }

    /// Templates applicable to an asset family, in name order.
    pub fn for_asset_family(&self, type_: &str, subtype: &str) -> Vec<&RuleTemplate> {
        self.templates
            .iter()
            .filter(|t| t.applies_to(type_, subtype))
            .collect()
    }

    /// Template bodies for the `LIST_TEMPLATES` surface.
    ///
    /// `type_filter` of `"all"` (or empty) returns everything; otherwise only
    /// templates targeting that type are returned.
    pub fn list(&self, type_filter: &str) -> Vec<&RuleTemplate> {
        self.templates
            .iter()
            .filter(|t| {
                type_filter.is_empty()
                    || type_filter == "all"
                    || t.target()
                        .map(|target| {
                            target == type_filter
                                || target.starts_with(&format!("{}_", type_filter))
                        })
                        .unwrap_or(false)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
