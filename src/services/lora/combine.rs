use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{LoraDescriptor, RecommendedSettings};
use crate::utils::text::join_nonempty;

/// One loader entry as it ends up in the image graph.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppliedLora {
    pub name: String,
    pub file: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

impl From<&LoraDescriptor> for AppliedLora {
    fn from(d: &LoraDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            file: d.file.clone(),
            strength_model: d.strength_model,
            strength_clip: d.strength_clip,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum LoraPlan {
    /// Loader removed from the graph entirely.
    Bypass,
    Single(AppliedLora),
    /// Loaders chained in order.
    Chain(Vec<AppliedLora>),
}

/// Recommendations of a later adapter that lost to the first one.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IgnoredSettings {
    pub lora: String,
    pub settings: RecommendedSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CombinedLora {
    pub name: String,
    pub plan: LoraPlan,
    pub trigger: String,
    pub sampler: Option<RecommendedSettings>,
    pub sampler_source: Option<String>,
    pub ignored: Vec<IgnoredSettings>,
}

impl CombinedLora {
    pub fn bypass() -> Self {
        Self {
            name: "No LoRA".to_string(),
            plan: LoraPlan::Bypass,
            trigger: String::new(),
            sampler: None,
            sampler_source: None,
            ignored: Vec::new(),
        }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self.plan, LoraPlan::Bypass)
    }

    pub fn adapters(&self) -> &[AppliedLora] {
        match &self.plan {
            LoraPlan::Bypass => &[],
            LoraPlan::Single(one) => std::slice::from_ref(one),
            LoraPlan::Chain(many) => many,
        }
    }

    /// Prepends the trigger words the prompt does not already contain.
    pub fn apply_trigger(&self, prompt: &str) -> String {
        prepend_missing(&self.trigger, prompt)
    }

    pub fn describe(&self) -> String {
        match &self.plan {
            LoraPlan::Bypass => self.name.clone(),
            LoraPlan::Single(one) => format!(
                "{} ({}, model {:.2}, clip {:.2})",
                one.name, one.file, one.strength_model, one.strength_clip
            ),
            LoraPlan::Chain(many) => format!(
                "{}: {}",
                self.name,
                many.iter().map(|l| l.name.as_str()).collect::<Vec<_>>().join(" -> ")
            ),
        }
    }
}

/// `"{missing parts of trigger}, {prompt}"`. Parts are compared case-insensitively.
pub fn prepend_missing(trigger: &str, prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    let missing: Vec<&str> = trigger
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty() && !lower.contains(&part.to_lowercase()))
        .collect();
    join_nonempty(missing.into_iter().chain(std::iter::once(prompt)))
}

/// Collapses required then optional adapters into one configuration.
///
/// Only the first adapter's recommended sampler settings are applied; the
/// recommendations of every later adapter are kept in `ignored` and logged.
pub fn combine(required: &[LoraDescriptor], optional: &[LoraDescriptor]) -> CombinedLora {
    let mut all: Vec<&LoraDescriptor> = Vec::with_capacity(required.len() + optional.len());
    for d in required.iter().chain(optional.iter()) {
        if all.iter().any(|seen| seen.name == d.name) {
            debug!("LoRA '{}' listed twice, applying it once", d.name);
            continue;
        }
        all.push(d);
    }

    let first = match all.as_slice() {
        [] => return CombinedLora::bypass(),
        [first, ..] => *first,
    };

    let trigger = join_nonempty(all.iter().map(|d| d.trigger()));
    let sampler = first.recommended().cloned();
    let sampler_source = sampler.as_ref().map(|_| first.name.clone());

    if all.len() == 1 {
        return CombinedLora {
            name: first.name.clone(),
            plan: LoraPlan::Single(AppliedLora::from(first)),
            trigger,
            sampler,
            sampler_source,
            ignored: Vec::new(),
        };
    }

    let ignored: Vec<IgnoredSettings> = all[1..]
        .iter()
        .filter_map(|d| {
            d.recommended().map(|settings| IgnoredSettings {
                lora: d.name.clone(),
                settings: settings.clone(),
            })
        })
        .collect();

    if let Some(source) = &sampler_source {
        info!("Using recommended sampler settings from first LoRA '{}'", source);
    }
    for skipped in &ignored {
        warn!(
            "Ignoring recommended settings of LoRA '{}' (cfg {:?}, sampler {:?}, steps {:?}): only the first LoRA's settings apply",
            skipped.lora, skipped.settings.cfg, skipped.settings.sampler, skipped.settings.steps
        );
    }

    CombinedLora {
        name: format!("Combined LoRAs ({} total)", all.len()),
        plan: LoraPlan::Chain(all.iter().map(|d| AppliedLora::from(*d)).collect()),
        trigger,
        sampler,
        sampler_source,
        ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lora(name: &str, trigger: &str, steps: Option<u32>) -> LoraDescriptor {
        let mut d = LoraDescriptor::new(name, format!("{}.safetensors", name.to_lowercase()));
        if !trigger.is_empty() {
            d.trigger = Some(trigger.to_string());
        }
        d.recommended = steps.map(|s| RecommendedSettings {
            cfg: Some(5.0),
            sampler: Some("euler".to_string()),
            steps: Some(s),
        });
        d
    }

    #[test]
    fn test_adapter_in_both_lists_applied_once() {
        let ink = lora("Ink", "ink wash", None);
        let glow = lora("Glow", "soft glow", None);
        let combined = combine(&[ink.clone()], &[ink.clone(), glow]);
        let names: Vec<_> = combined.adapters().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Ink", "Glow"]);
        assert_eq!(combined.trigger, "ink wash, soft glow");

        let single = combine(&[ink.clone()], &[ink]);
        assert!(matches!(single.plan, LoraPlan::Single(_)));
    }

    #[test]
    fn test_zero_adapters_bypass() {
        let combined = combine(&[], &[]);
        assert!(combined.is_bypass());
        assert!(combined.trigger.is_empty());
        assert!(combined.sampler.is_none());
        assert_eq!(combined.apply_trigger("a castle"), "a castle");
    }

    #[test]
    fn test_single_adapter_preserved_verbatim() {
        let mut only = lora("Anime", "anime style", Some(30));
        only.strength_model = 0.7;
        only.strength_clip = 0.6;

        let combined = combine(&[only.clone()], &[]);
        match &combined.plan {
            LoraPlan::Single(applied) => {
                assert_eq!(applied.file, "anime.safetensors");
                assert_eq!(applied.strength_model, 0.7);
                assert_eq!(applied.strength_clip, 0.6);
            }
            other => panic!("expected single plan, got {:?}", other),
        }
        assert_eq!(combined.trigger, "anime style");
        assert_eq!(combined.sampler, only.recommended);
        assert!(combined.ignored.is_empty());
    }

    #[test]
    fn test_single_optional_adapter_is_also_single() {
        let combined = combine(&[], &[lora("Ink", "ink wash", None)]);
        assert!(matches!(combined.plan, LoraPlan::Single(_)));
        assert!(combined.sampler.is_none());
    }

    #[test]
    fn test_many_adapters_first_settings_win() {
        let required = vec![lora("Base", "base style", Some(20))];
        let optional = vec![lora("Ink", "ink wash", Some(40)), lora("Glow", "", Some(8))];

        let combined = combine(&required, &optional);

        let names: Vec<_> = combined.adapters().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Base", "Ink", "Glow"]);
        assert_eq!(combined.name, "Combined LoRAs (3 total)");
        assert_eq!(combined.trigger, "base style, ink wash");
        assert_eq!(combined.sampler.as_ref().unwrap().steps, Some(20));
        assert_eq!(combined.sampler_source.as_deref(), Some("Base"));

        let ignored: Vec<_> = combined.ignored.iter().map(|i| i.lora.as_str()).collect();
        assert_eq!(ignored, vec!["Ink", "Glow"]);
    }

    #[test]
    fn test_first_without_settings_does_not_borrow_later_ones() {
        let combined = combine(&[lora("Plain", "plain", None)], &[lora("Ink", "ink", Some(40))]);
        assert!(combined.sampler.is_none());
        assert_eq!(combined.ignored.len(), 1);
    }

    #[test]
    fn test_apply_trigger_prepends() {
        let combined = combine(&[lora("A", "alpha", None)], &[lora("B", "beta", None)]);
        assert_eq!(combined.apply_trigger("a quiet lake"), "alpha, beta, a quiet lake");
        assert_eq!(combined.apply_trigger("Alpha, a quiet lake"), "beta, Alpha, a quiet lake");
        assert_eq!(combined.apply_trigger(""), "alpha, beta");
    }
}
