use anyhow::{bail, Result};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{LoraCatalog, LoraDescriptor};
use crate::core::config::LoraConfig;
use crate::core::state::Scene;
use crate::services::llm::{call_tool_as, LlmClient, ToolSpec};

pub const FALLBACK_REASONING: &str =
    "Fallback selection due to LLM error - selected first available LoRAs";
const FALLBACK_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl SelectionPolicy {
    pub fn from_config(config: &LoraConfig) -> Self {
        Self {
            attempts: config.selection_attempts.max(1),
            delay: Duration::from_secs(config.selection_retry_delay_seconds),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoraSelection {
    pub selected: Vec<LoraDescriptor>,
    pub reasoning: String,
    pub fallback: bool,
}

impl LoraSelection {
    fn fallback(catalog: &LoraCatalog) -> Self {
        Self {
            selected: catalog.descriptors().take(FALLBACK_COUNT).cloned().collect(),
            reasoning: FALLBACK_REASONING.to_string(),
            fallback: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    selected_loras: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

fn selection_tool() -> ToolSpec {
    ToolSpec {
        name: "select_loras",
        description: "Choose the optional LoRA adapters that best fit the content",
        parameters: json!({
            "type": "object",
            "properties": {
                "selected_loras": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Exact names of the chosen LoRAs"
                },
                "reasoning": { "type": "string" }
            },
            "required": ["selected_loras", "reasoning"]
        }),
    }
}

const SYSTEM_PROMPT: &str = "You are an art director choosing style adapters (LoRAs) for an \
image generation model. Only choose adapters from the provided list, using their exact names. \
Choosing none is acceptable when nothing fits.";

pub struct LoraSelector<'a> {
    llm: &'a dyn LlmClient,
    policy: SelectionPolicy,
}

impl<'a> LoraSelector<'a> {
    pub fn new(llm: &'a dyn LlmClient, policy: SelectionPolicy) -> Self {
        Self { llm, policy }
    }

    /// One model call for a single scene.
    pub async fn select_for_scene(
        &self,
        scene: &Scene,
        index: usize,
        catalog: &LoraCatalog,
    ) -> LoraSelection {
        let user = format!(
            "Available LoRAs:\n{}\n\nScene {}:\n{}\n\nSelect the LoRAs that suit this scene.",
            describe_catalog(catalog),
            index + 1,
            describe_scene(scene)
        );
        self.select_with_retry(&format!("scene {}", index + 1), &user, catalog)
            .await
    }

    /// A single model call covering every scene. Requires scene prompts to be
    /// generated already.
    pub async fn select_for_story(
        &self,
        scenes: &[Scene],
        catalog: &LoraCatalog,
    ) -> Result<LoraSelection> {
        if let Some(i) = scenes
            .iter()
            .position(|s| s.image_prompt_positive.as_deref().map_or(true, str::is_empty))
        {
            bail!(
                "Scene {} has no image prompt; generate prompts before story-wide LoRA selection",
                i + 1
            );
        }

        let scenes_text = scenes
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Scene {}:\n{}", i + 1, describe_scene(s)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!(
            "Available LoRAs:\n{}\n\nStory scenes:\n{}\n\nSelect the LoRAs that suit the whole story, \
             keeping the visual style consistent across scenes.",
            describe_catalog(catalog),
            scenes_text
        );
        Ok(self.select_with_retry("story", &user, catalog).await)
    }

    async fn select_with_retry(&self, label: &str, user: &str, catalog: &LoraCatalog) -> LoraSelection {
        if catalog.is_empty() {
            info!("No optional LoRAs available for {}", label);
            return LoraSelection {
                reasoning: "No optional LoRAs available".to_string(),
                ..Default::default()
            };
        }

        let tool = selection_tool();
        for attempt in 1..=self.policy.attempts {
            match call_tool_as::<SelectionResponse>(self.llm, SYSTEM_PROMPT, user, &tool).await {
                Ok(response) => return filter_selection(response, catalog, label),
                Err(e) => {
                    warn!(
                        "LoRA selection for {} failed (attempt {}/{}): {:#}",
                        label, attempt, self.policy.attempts, e
                    );
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        let fallback = LoraSelection::fallback(catalog);
        warn!(
            "LoRA selection for {} fell back to: {:?}",
            label,
            fallback.selected.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );
        fallback
    }
}

fn filter_selection(response: SelectionResponse, catalog: &LoraCatalog, label: &str) -> LoraSelection {
    let mut selected: Vec<LoraDescriptor> = Vec::new();
    for name in &response.selected_loras {
        match catalog.get_by_name(name.trim()) {
            Some(d) if !selected.iter().any(|s| s.name == d.name) => selected.push(d.clone()),
            Some(_) => {}
            None => warn!("LLM selected unknown LoRA '{}' for {}, ignoring", name, label),
        }
    }

    if selected.is_empty() {
        info!("No optional LoRAs selected for {}", label);
    } else {
        info!(
            "Selected LoRAs for {}: {}",
            label,
            selected.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    LoraSelection {
        selected,
        reasoning: response.reasoning,
        fallback: false,
    }
}

fn describe_catalog(catalog: &LoraCatalog) -> String {
    catalog
        .descriptors()
        .map(|d| {
            let trigger = d.trigger();
            if trigger.is_empty() {
                format!("- {}: {}", d.name, d.description)
            } else {
                format!("- {}: {} (trigger: {})", d.name, d.description, trigger)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_scene(scene: &Scene) -> String {
    format!(
        "Location: {}\nTime: {}\nAction: {}\nCharacters: {}\nPositive prompt: {}\nNegative prompt: {}",
        scene.location,
        scene.time,
        scene.action,
        scene.character_names().join(", "),
        scene.image_prompt_positive.as_deref().unwrap_or(""),
        scene.image_prompt_negative.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<Value>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<Value>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            Err(anyhow!("chat not expected"))
        }

        async fn call_tool(&self, _system: &str, _user: &str, tool: &ToolSpec) -> Result<Value> {
            assert_eq!(tool.name, "select_loras");
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(anyhow!("connection reset"))
            } else {
                responses.remove(0)
            }
        }
    }

    fn catalog() -> LoraCatalog {
        LoraCatalog::from_descriptors(
            "flux-schnell",
            vec![
                LoraDescriptor::new("Anime", "anime.safetensors"),
                LoraDescriptor::new("Ink", "ink.safetensors"),
                LoraDescriptor::new("Glow", "glow.safetensors"),
            ],
        )
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy { attempts: 3, delay: Duration::ZERO }
    }

    fn scene(prompt: Option<&str>) -> Scene {
        Scene {
            location: "Forest".to_string(),
            time: "Dawn".to_string(),
            action: "A knight walks".to_string(),
            image_prompt_positive: prompt.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_names_are_filtered() {
        let llm = ScriptedLlm::new(vec![Ok(json!({
            "selected_loras": ["Ink", "Watercolor", "Ink"],
            "reasoning": "misty forest"
        }))]);
        let selector = LoraSelector::new(&llm, policy());

        let selection = selector.select_for_scene(&scene(None), 0, &catalog()).await;

        let names: Vec<_> = selection.selected.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Ink"]);
        assert_eq!(selection.reasoning, "misty forest");
        assert!(!selection.fallback);
    }

    #[tokio::test]
    async fn test_all_invalid_names_select_nothing() {
        let llm = ScriptedLlm::new(vec![Ok(json!({
            "selected_loras": ["Nope", "Missing"],
            "reasoning": "none fit"
        }))]);
        let selector = LoraSelector::new(&llm, policy());

        let selection = selector.select_for_scene(&scene(None), 0, &catalog()).await;

        assert!(selection.selected.is_empty());
        assert!(!selection.fallback, "all-invalid is not a failure");
        assert_eq!(*llm.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_catalog_keys_are_not_names() {
        let llm = ScriptedLlm::new(vec![Ok(json!({
            "selected_loras": ["2", "3"],
            "reasoning": "picked by menu number"
        }))]);
        let selector = LoraSelector::new(&llm, policy());

        let selection = selector.select_for_scene(&scene(None), 0, &catalog()).await;

        assert!(selection.selected.is_empty());
        assert!(!selection.fallback);
    }

    #[tokio::test]
    async fn test_malformed_then_valid_response_retries() {
        let llm = ScriptedLlm::new(vec![
            Ok(json!({ "reasoning": "forgot the list" })),
            Ok(json!({ "selected_loras": ["Glow"], "reasoning": "night" })),
        ]);
        let selector = LoraSelector::new(&llm, policy());

        let selection = selector.select_for_scene(&scene(None), 2, &catalog()).await;

        assert_eq!(selection.selected[0].name, "Glow");
        assert_eq!(*llm.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fall_back_to_first_two() {
        let llm = ScriptedLlm::new(vec![]);
        let selector = LoraSelector::new(&llm, policy());

        let selection = selector.select_for_scene(&scene(None), 0, &catalog()).await;

        let names: Vec<_> = selection.selected.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Anime", "Ink"]);
        assert!(selection.fallback);
        assert_eq!(selection.reasoning, FALLBACK_REASONING);
        assert_eq!(*llm.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_story_mode_uses_one_call_for_all_scenes() -> Result<()> {
        let llm = ScriptedLlm::new(vec![Ok(json!({
            "selected_loras": ["Anime"],
            "reasoning": "consistent look"
        }))]);
        let selector = LoraSelector::new(&llm, policy());
        let scenes = vec![scene(Some("forest, dawn")), scene(Some("castle, dusk")), scene(Some("sea"))];

        let selection = selector.select_for_story(&scenes, &catalog()).await?;

        assert_eq!(selection.selected.len(), 1);
        assert_eq!(*llm.calls.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_story_mode_requires_prompts() {
        let llm = ScriptedLlm::new(vec![]);
        let selector = LoraSelector::new(&llm, policy());
        let scenes = vec![scene(Some("forest")), scene(None)];

        let err = selector.select_for_story(&scenes, &catalog()).await.unwrap_err();
        assert!(err.to_string().contains("Scene 2"));
        assert_eq!(*llm.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_catalog_skips_the_model() {
        let llm = ScriptedLlm::new(vec![]);
        let selector = LoraSelector::new(&llm, policy());
        let empty = LoraCatalog::from_descriptors("flux-schnell", vec![]);

        let selection = selector.select_for_scene(&scene(None), 0, &empty).await;

        assert!(selection.selected.is_empty());
        assert!(!selection.fallback);
        assert_eq!(*llm.calls.lock().unwrap(), 0);
    }
}
