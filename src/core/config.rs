use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;

pub const LLM_API_KEY_ENV: &str = "LLM_API_KEY";
pub const VIDEO_API_KEY_ENV: &str = "SILICONFLOW_VIDEO_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub comfyui: ComfyUiConfig,

    #[serde(default)]
    pub lora: LoraConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(skip)]
    env_secrets: EnvSecrets,
}

/// Which keys were filled from the environment; those are never written back.
#[derive(Debug, Clone, Default)]
struct EnvSecrets {
    llm: bool,
    video: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Story,
    Poetry,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub video: bool,
    #[serde(default = "default_images_per_scene")]
    pub images_per_scene: usize,
    #[serde(default)]
    pub style: String,
    #[serde(default = "default_max_scenes")]
    pub max_scenes: usize,
    #[serde(default = "default_max_characters")]
    pub max_characters: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            video: false,
            images_per_scene: default_images_per_scene(),
            style: String::new(),
            max_scenes: default_max_scenes(),
            max_characters: default_max_characters(),
        }
    }
}

/// Node ids of the graph template that LoRA splicing and prompt injection touch.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeIds {
    pub lora: String,
    pub positive: String,
    pub negative: String,
    pub sampler: String,
}

impl Default for NodeIds {
    fn default() -> Self {
        Self {
            lora: "38".to_string(),
            positive: "6".to_string(),
            negative: "7".to_string(),
            sampler: "3".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ComfyUiConfig {
    #[serde(default = "default_comfyui_host")]
    pub host: String,
    #[serde(default = "default_comfyui_port")]
    pub port: u16,
    #[serde(default = "default_comfyui_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_comfyui_timeout")]
    pub timeout_seconds: u64,
    pub workflow: Option<String>,
    pub audio_workflow: Option<String>,
    #[serde(default)]
    pub nodes: NodeIds,
}

impl Default for ComfyUiConfig {
    fn default() -> Self {
        Self {
            host: default_comfyui_host(),
            port: default_comfyui_port(),
            poll_interval_ms: default_comfyui_poll_ms(),
            timeout_seconds: default_comfyui_timeout(),
            workflow: None,
            audio_workflow: None,
            nodes: NodeIds::default(),
        }
    }
}

impl ComfyUiConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoraMode {
    #[default]
    None,
    All,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoraConfig {
    #[serde(default)]
    pub mode: LoraMode,
    #[serde(default = "default_lora_catalog")]
    pub catalog: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default = "default_selection_attempts")]
    pub selection_attempts: usize,
    #[serde(default = "default_selection_delay")]
    pub selection_retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub optimized_selection: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            mode: LoraMode::default(),
            catalog: default_lora_catalog(),
            model_type: default_model_type(),
            required: Vec::new(),
            optional: Vec::new(),
            selection_attempts: default_selection_attempts(),
            selection_retry_delay_seconds: default_selection_delay(),
            optimized_selection: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_video_base_url")]
    pub base_url: String,
    #[serde(default = "default_video_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_video_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_minutes: u64,
    #[serde(default = "default_check_interval")]
    pub batch_check_interval_seconds: u64,
    #[serde(default = "default_video_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub transitions: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_video_base_url(),
            model: default_video_model(),
            image_size: default_image_size(),
            check_interval_seconds: default_check_interval(),
            max_wait_seconds: default_max_wait(),
            max_attempts: default_max_attempts(),
            retry_delay_seconds: default_video_retry_delay(),
            batch_timeout_minutes: default_batch_timeout(),
            batch_check_interval_seconds: default_check_interval(),
            max_concurrency: default_video_concurrency(),
            transitions: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SongLanguage {
    #[default]
    English,
    Chinese,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub language: SongLanguage,
    #[serde(default = "default_duration_per_scene")]
    pub duration_per_scene: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            language: SongLanguage::default(),
            duration_per_scene: default_duration_per_scene(),
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_true() -> bool {
    true
}
fn default_images_per_scene() -> usize {
    1
}
fn default_max_scenes() -> usize {
    6
}
fn default_max_characters() -> usize {
    5
}
fn default_comfyui_host() -> String {
    "127.0.0.1".to_string()
}
fn default_comfyui_port() -> u16 {
    8188
}
fn default_comfyui_poll_ms() -> u64 {
    1000
}
fn default_comfyui_timeout() -> u64 {
    600
}
fn default_lora_catalog() -> String {
    "lora_config.json".to_string()
}
fn default_model_type() -> String {
    "flux-schnell".to_string()
}
fn default_selection_attempts() -> usize {
    3
}
fn default_selection_delay() -> u64 {
    3
}
fn default_video_base_url() -> String {
    "https://api.siliconflow.cn/v1".to_string()
}
fn default_video_model() -> String {
    "Wan-AI/Wan2.1-I2V-14B-720P".to_string()
}
fn default_image_size() -> String {
    "1280x720".to_string()
}
fn default_check_interval() -> u64 {
    5
}
fn default_max_wait() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_video_retry_delay() -> u64 {
    5
}
fn default_batch_timeout() -> u64 {
    50
}
fn default_video_concurrency() -> usize {
    4
}
fn default_duration_per_scene() -> u32 {
    5
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.resolve_secrets(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut on_disk = self.clone();
        if self.env_secrets.llm {
            if let Some(openai) = on_disk.llm.openai.as_mut() {
                openai.api_key.clear();
            }
        }
        if self.env_secrets.video {
            on_disk.video.api_key.clear();
        }
        let content = serde_yaml_ng::to_string(&on_disk)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    /// Fills empty API keys from the environment. The lookup is injected so
    /// tests do not have to touch process-wide state.
    pub fn resolve_secrets<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(openai) = self.llm.openai.as_mut() {
            if openai.api_key.trim().is_empty() {
                if let Some(key) = lookup(LLM_API_KEY_ENV) {
                    openai.api_key = key;
                    self.env_secrets.llm = true;
                }
            }
        }
        if self.video.api_key.trim().is_empty() {
            if let Some(key) = lookup(VIDEO_API_KEY_ENV) {
                self.video.api_key = key;
                self.env_secrets.video = true;
            }
        }
    }
}
