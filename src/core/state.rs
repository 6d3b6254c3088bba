use serde::{Deserialize, Serialize};

use crate::core::config::Mode;
use crate::services::lora::CombinedLora;
use crate::services::video::BatchReport;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    pub description: String,
}

impl Character {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Scene {
    pub location: String,
    pub time: String,
    #[serde(default)]
    pub characters: Vec<Character>,
    pub action: String,
    #[serde(default)]
    pub image_prompt_positive: Option<String>,
    #[serde(default)]
    pub image_prompt_negative: Option<String>,
}

impl Scene {
    pub fn character_names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Output of one finished (or given-up) video task.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VideoOutcome {
    pub scene_name: String,
    pub image_path: String,
    pub output_path: String,
    pub request_id: Option<String>,
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AudioInfo {
    pub path: Option<String>,
    pub lyrics: String,
    pub tags: String,
    pub duration_seconds: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GenerationState {
    pub mode: Mode,
    pub prompt: String,
    pub style: String,
    pub output_dir: String,
    pub story: String,
    pub characters: Vec<Character>,
    pub scenes: Vec<Scene>,
    pub image_paths: Vec<String>,
    pub lora: Option<CombinedLora>,
    /// Per-scene adapters when selection runs scene by scene.
    #[serde(default)]
    pub scene_loras: Vec<CombinedLora>,
    pub lora_reasoning: Option<String>,
    pub pinyin_lyrics: Option<String>,
    pub videos: Vec<VideoOutcome>,
    pub video_summary: Option<BatchReport>,
    pub combined_video: Option<String>,
    pub audio: Option<AudioInfo>,
    pub record_path: Option<String>,
}

impl GenerationState {
    pub fn new(mode: Mode, prompt: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            mode,
            prompt: prompt.into(),
            style: style.into(),
            ..Default::default()
        }
    }

    pub fn audio_path(&self) -> Option<&str> {
        self.audio.as_ref().and_then(|a| a.path.as_deref())
    }
}
