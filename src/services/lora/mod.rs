//! Style adapters: the catalog, how several adapters collapse into one
//! generation-time configuration, and LLM-assisted choice of optional ones.

pub mod combine;
pub mod selector;

pub use combine::{combine, prepend_missing, AppliedLora, CombinedLora, IgnoredSettings, LoraPlan};
pub use selector::{LoraSelection, LoraSelector, SelectionPolicy};

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::core::io::Storage;

/// Sampler settings an adapter was trained to look best with.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct RecommendedSettings {
    #[serde(default)]
    pub cfg: Option<f64>,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub steps: Option<u32>,
}

impl RecommendedSettings {
    pub fn is_empty(&self) -> bool {
        self.cfg.is_none() && self.sampler.is_none() && self.steps.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TriggerWords {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

fn default_strength() -> f64 {
    1.0
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoraDescriptor {
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub trigger_words: Option<TriggerWords>,
    #[serde(default = "default_strength")]
    pub strength_model: f64,
    #[serde(default = "default_strength")]
    pub strength_clip: f64,
    #[serde(default, rename = "recommended_settings")]
    pub recommended: Option<RecommendedSettings>,
    #[serde(default)]
    pub description: String,
}

impl LoraDescriptor {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            trigger: None,
            trigger_words: None,
            strength_model: default_strength(),
            strength_clip: default_strength(),
            recommended: None,
            description: String::new(),
        }
    }

    /// The explicit trigger, or the required trigger words joined with `", "`.
    pub fn trigger(&self) -> String {
        match &self.trigger {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => self
                .trigger_words
                .as_ref()
                .map(|w| crate::utils::text::join_nonempty(&w.required))
                .unwrap_or_default(),
        }
    }

    /// Recommended settings, treating an all-empty block as absent.
    pub fn recommended(&self) -> Option<&RecommendedSettings> {
        self.recommended.as_ref().filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    key: String,
    descriptor: LoraDescriptor,
}

/// The adapters available for one base model family.
#[derive(Debug, Clone, Default)]
pub struct LoraCatalog {
    pub model_type: String,
    pub description: String,
    entries: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct ModelSection {
    #[serde(default)]
    description: String,
    loras: serde_json::Map<String, Value>,
}

impl LoraCatalog {
    pub fn from_descriptors(model_type: &str, descriptors: Vec<LoraDescriptor>) -> Self {
        Self {
            model_type: model_type.to_string(),
            description: String::new(),
            entries: descriptors
                .into_iter()
                .enumerate()
                .map(|(i, descriptor)| CatalogEntry {
                    key: (i + 1).to_string(),
                    descriptor,
                })
                .collect(),
        }
    }

    /// Parses the catalog file. `model_type` may be a section name or an alias
    /// listed under `_model_mapping`.
    pub fn from_json(json: &str, model_type: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(json).context("Invalid JSON in LoRA catalog")?;
        let key = root
            .get("_model_mapping")
            .and_then(|m| m.get(model_type))
            .and_then(Value::as_str)
            .unwrap_or(model_type)
            .to_string();

        let section = root
            .get(&key)
            .ok_or_else(|| anyhow!("Unknown model type in LoRA catalog: {}", model_type))?;
        let section: ModelSection = serde_json::from_value(section.clone())
            .with_context(|| format!("Malformed LoRA section {}", key))?;

        let mut entries = Vec::with_capacity(section.loras.len());
        for (entry_key, value) in section.loras {
            let descriptor: LoraDescriptor = serde_json::from_value(value)
                .with_context(|| format!("Malformed LoRA entry {}/{}", key, entry_key))?;
            entries.push(CatalogEntry { key: entry_key, descriptor });
        }
        // Menu keys are "1", "2", ..., "10"; keep them in numeric order.
        entries.sort_by(|a, b| match (a.key.parse::<u32>(), b.key.parse::<u32>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.key.cmp(&b.key),
        });

        Ok(Self {
            model_type: key,
            description: section.description,
            entries,
        })
    }

    pub async fn load(storage: &dyn Storage, path: &str, model_type: &str) -> Result<Self> {
        let json = storage
            .read_to_string(path)
            .await
            .with_context(|| format!("LoRA catalog not found at {}", path))?;
        Self::from_json(&json, model_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &LoraDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Looks an adapter up by its display name or its catalog key.
    pub fn get(&self, name: &str) -> Option<&LoraDescriptor> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .or_else(|| self.entries.iter().find(|e| e.key == name))
            .map(|e| &e.descriptor)
    }

    /// Exact display-name lookup; catalog keys are not accepted.
    pub fn get_by_name(&self, name: &str) -> Option<&LoraDescriptor> {
        self.descriptors().find(|d| d.name == name)
    }

    /// Resolves names in order, skipping (and logging) unknown ones.
    pub fn resolve(&self, names: &[String]) -> Vec<LoraDescriptor> {
        names
            .iter()
            .filter_map(|name| {
                let found = self.get(name).cloned();
                if found.is_none() {
                    warn!("LoRA '{}' not found in {} catalog, skipping", name, self.model_type);
                }
                found
            })
            .collect()
    }

    /// A catalog restricted to `names` (every entry when empty), never
    /// containing anything in `exclude`.
    pub fn subset(&self, names: &[String], exclude: &[LoraDescriptor]) -> Self {
        let excluded: HashSet<&str> = exclude.iter().map(|d| d.name.as_str()).collect();
        let entries = self
            .entries
            .iter()
            .filter(|e| !excluded.contains(e.descriptor.name.as_str()))
            .filter(|e| {
                names.is_empty() || names.iter().any(|n| *n == e.descriptor.name || *n == e.key)
            })
            .cloned()
            .collect();
        Self {
            model_type: self.model_type.clone(),
            description: self.description.clone(),
            entries,
        }
    }

    /// Non-fatal consistency problems, one line each.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for entry in &self.entries {
            let d = &entry.descriptor;
            if !seen.insert(d.name.as_str()) {
                problems.push(format!("duplicate LoRA name '{}'", d.name));
            }
            if d.file.trim().is_empty() {
                problems.push(format!("LoRA '{}' has no file", d.name));
            }
            for (label, value) in [("model", d.strength_model), ("clip", d.strength_clip)] {
                if !validate_strength(value) {
                    problems.push(format!(
                        "LoRA '{}' {} strength {} outside 0.1..=1.0",
                        d.name, label, value
                    ));
                }
            }
        }
        problems
    }
}

pub fn validate_strength(strength: f64) -> bool {
    (0.1..=1.0).contains(&strength)
}
