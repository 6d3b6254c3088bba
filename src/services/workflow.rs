use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::core::config::{Config, LoraMode, Mode, SongLanguage};
use crate::core::io::Storage;
use crate::core::state::{AudioInfo, GenerationState};
use crate::services::comfyui::{AudioRequest, ImageBackend, ImageRequest};
use crate::services::llm::LlmClient;
use crate::services::lora::{combine, CombinedLora, LoraCatalog, LoraDescriptor, LoraSelector, SelectionPolicy};
use crate::services::media::{self, COMBINED_VIDEO, COMBINED_WITH_AUDIO};
use crate::services::record::write_record;
use crate::services::retry::RetryExecutor;
use crate::services::stages::{prompt_variants, Stages};
use crate::services::video::{
    build_video_negative, build_video_prompt, wait_for_all, VideoClient, VideoJob, VideoManager,
    VideoPolicy, VideoTaskHandle, WaitPolicy,
};

const STATE_FILE: &str = "generation_state.json";
const TRANSITION_SECONDS: f64 = 1.0;

/// Name of a fresh run directory under `root`: `{YYYY_MM_DD}_images4story_{8 hex chars}`.
pub fn run_directory(root: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    Path::new(root)
        .join(format!("{}_images4story_{}", Local::now().format("%Y_%m_%d"), &id[..8]))
        .to_string_lossy()
        .to_string()
}

fn song_file(language: SongLanguage) -> &'static str {
    match language {
        SongLanguage::English => "story_song.mp3",
        SongLanguage::Chinese => "chinese_story_song.mp3",
    }
}

fn join(dir: &str, file: &str) -> String {
    Path::new(dir).join(file).to_string_lossy().to_string()
}

pub struct Pipeline {
    config: Config,
    llm: Box<dyn LlmClient>,
    images: Arc<dyn ImageBackend>,
    video: Option<Arc<dyn VideoClient>>,
    storage: Arc<dyn Storage>,
    retry: RetryExecutor,
    video_policy: VideoPolicy,
    wait_policy: WaitPolicy,
}

impl Pipeline {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        images: Arc<dyn ImageBackend>,
        video: Option<Arc<dyn VideoClient>>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let retry = RetryExecutor::from_config(&config.llm);
        let video_policy = VideoPolicy::from_config(&config.video);
        let wait_policy = WaitPolicy::from_config(&config.video);
        Self {
            config,
            llm,
            images,
            video,
            storage,
            retry,
            video_policy,
            wait_policy,
        }
    }

    /// Overrides the per-task and batch timings taken from the config.
    pub fn with_video_timing(mut self, policy: VideoPolicy, wait: WaitPolicy) -> Self {
        self.video_policy = policy;
        self.wait_policy = wait;
        self
    }

    pub async fn run(&self, prompt: &str) -> Result<GenerationState> {
        self.retry.reset();
        let generation = &self.config.generation;
        let stages = Stages::new(self.llm.as_ref(), &self.retry, generation);

        let mut state = GenerationState::new(generation.mode, prompt, generation.style.clone());
        state.output_dir = run_directory(&self.config.output_folder);
        println!("Run directory: {}", state.output_dir);

        if state.mode == Mode::Poetry {
            println!("Converting poem to pinyin...");
            state.pinyin_lyrics = Some(stages.convert_to_pinyin(prompt).await?);
        }

        println!("Generating story...");
        state.story = stages.generate_story(prompt).await?;

        println!("Extracting characters...");
        state.characters = stages.extract_characters(&state.story, prompt).await?;

        println!("Generating scenes...");
        state.scenes = stages
            .generate_scenes(&state.story, prompt, &state.characters, &state.style)
            .await?;

        let catalog = self.load_catalog().await;
        let fixed = catalog
            .as_ref()
            .map(|c| self.fixed_adapters(c))
            .unwrap_or_default();
        let hint = combine(&fixed, &[]).trigger;

        println!("Generating image prompts...");
        state.scenes = stages
            .generate_prompts(&state.scenes, &state.characters, &state.style, &hint)
            .await?;

        self.select_loras(catalog.as_ref(), &fixed, &mut state).await;

        println!("Generating images...");
        let first_images = self.generate_images(&mut state).await;

        let handles = self.spawn_videos(&state, &first_images);

        if self.config.audio.enabled {
            println!("Generating audio...");
            self.generate_audio(&stages, &mut state).await?;
        }

        state.record_path = Some(write_record(&state, generation.video, self.storage.as_ref()).await?);

        if let Some(handles) = handles {
            println!("Waiting for {} video task(s)...", handles.len());
            let (report, outcomes) = wait_for_all(handles, self.wait_policy).await;
            state.videos = outcomes;
            state.video_summary = Some(report);
            self.assemble_video(&mut state).await;
        }

        self.save_state(&state).await?;
        info!(
            "✅ Run finished: {} scene(s), {} image(s), {} LLM retries used",
            state.scenes.len(),
            state.image_paths.len(),
            self.retry.used()
        );
        Ok(state)
    }

    async fn load_catalog(&self) -> Option<LoraCatalog> {
        let lora = &self.config.lora;
        if lora.mode == LoraMode::None {
            return None;
        }
        match LoraCatalog::load(self.storage.as_ref(), &lora.catalog, &lora.model_type).await {
            Ok(catalog) => {
                for problem in catalog.validate() {
                    warn!("LoRA catalog {}: {}", lora.catalog, problem);
                }
                Some(catalog)
            }
            Err(e) => {
                warn!("LoRA catalog {} unavailable ({}), generating without LoRA", lora.catalog, e);
                None
            }
        }
    }

    /// Adapters applied whatever the selector decides.
    fn fixed_adapters(&self, catalog: &LoraCatalog) -> Vec<LoraDescriptor> {
        let lora = &self.config.lora;
        match lora.mode {
            LoraMode::None => Vec::new(),
            LoraMode::All => {
                let names: Vec<String> = lora.required.iter().chain(&lora.optional).cloned().collect();
                if names.is_empty() {
                    catalog.descriptors().cloned().collect()
                } else {
                    catalog.resolve(&names)
                }
            }
            LoraMode::Group => catalog.resolve(&lora.required),
        }
    }

    async fn select_loras(
        &self,
        catalog: Option<&LoraCatalog>,
        fixed: &[LoraDescriptor],
        state: &mut GenerationState,
    ) {
        let lora = &self.config.lora;
        let catalog = match catalog {
            Some(c) => c,
            None => {
                state.lora = Some(CombinedLora::bypass());
                return;
            }
        };
        if lora.mode != LoraMode::Group {
            let combined = combine(fixed, &[]);
            info!("🧩 LoRA: {}", combined.describe());
            state.lora = Some(combined);
            return;
        }

        let optional = catalog.subset(&lora.optional, fixed);
        let selector = LoraSelector::new(self.llm.as_ref(), SelectionPolicy::from_config(lora));
        if lora.optimized_selection {
            match selector.select_for_story(&state.scenes, &optional).await {
                Ok(selection) => {
                    let combined = combine(fixed, &selection.selected);
                    info!("🧩 LoRA for the whole story: {}", combined.describe());
                    state.lora = Some(combined);
                    state.lora_reasoning = Some(selection.reasoning);
                }
                Err(e) => {
                    warn!("Story-wide LoRA selection skipped: {}", e);
                    state.lora = Some(combine(fixed, &[]));
                    state.lora_reasoning = Some(format!("Only required LoRAs applied: {}", e));
                }
            }
        } else {
            let mut reasons = Vec::new();
            for (i, scene) in state.scenes.iter().enumerate() {
                let selection = selector.select_for_scene(scene, i, &optional).await;
                let combined = combine(fixed, &selection.selected);
                info!("🧩 LoRA for scene {}: {}", i + 1, combined.describe());
                reasons.push(format!("Scene {}: {}", i + 1, selection.reasoning));
                state.scene_loras.push(combined);
            }
            state.lora = Some(combine(fixed, &[]));
            state.lora_reasoning = Some(reasons.join("\n"));
        }
    }

    /// Renders every scene variant. Returns the first image of each scene that
    /// produced one; failed images are skipped.
    async fn generate_images(&self, state: &mut GenerationState) -> Vec<Option<String>> {
        let per_scene = self.config.generation.images_per_scene.max(1);
        let bar = ProgressBar::new((state.scenes.len() * per_scene) as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }

        let bypass = CombinedLora::bypass();
        let mut first_images = Vec::with_capacity(state.scenes.len());
        for (i, scene) in state.scenes.iter().enumerate() {
            let lora = state
                .scene_loras
                .get(i)
                .or(state.lora.as_ref())
                .unwrap_or(&bypass);
            let mut first = None;
            for (j, variant) in prompt_variants(scene, per_scene).iter().enumerate() {
                let positive = lora.apply_trigger(variant);
                let request = ImageRequest {
                    positive: &positive,
                    negative: scene.image_prompt_negative.as_deref(),
                    lora,
                };
                let path = join(&state.output_dir, &format!("scene_{:03}_{:02}.png", i + 1, j));
                let written = match self.images.generate_image(&request).await {
                    Ok(bytes) => self.storage.write(&path, &bytes).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok(()) => {
                        bar.set_message(format!("scene {}", i + 1));
                        if first.is_none() {
                            first = Some(path.clone());
                        }
                        state.image_paths.push(path);
                    }
                    Err(e) => error!("Image {} for scene {} failed: {}", j, i + 1, e),
                }
                bar.inc(1);
            }
            first_images.push(first);
        }
        bar.finish_with_message(format!("{} written", state.image_paths.len()));
        first_images
    }

    fn spawn_videos(
        &self,
        state: &GenerationState,
        first_images: &[Option<String>],
    ) -> Option<Vec<VideoTaskHandle>> {
        if !self.config.generation.video {
            return None;
        }
        let client = match &self.video {
            Some(client) => client.clone(),
            None => {
                warn!("Video generation enabled but no video client configured, skipping");
                return None;
            }
        };

        let jobs: Vec<VideoJob> = state
            .scenes
            .iter()
            .zip(first_images)
            .enumerate()
            .filter_map(|(i, (scene, image))| {
                let image_path = match image {
                    Some(path) => path.clone(),
                    None => {
                        warn!("Scene {} has no image, no video will be made for it", i + 1);
                        return None;
                    }
                };
                let scene_name = format!("scene_{:03}", i + 1);
                Some(VideoJob {
                    output_path: join(&state.output_dir, &format!("{}.mp4", scene_name)),
                    scene_name,
                    image_path,
                    prompt: build_video_prompt(scene),
                    negative_prompt: Some(build_video_negative(scene)),
                })
            })
            .collect();

        let manager = VideoManager::with_policy(
            client,
            self.storage.clone(),
            self.video_policy.clone(),
            self.config.video.max_concurrency,
        );
        Some(manager.spawn(jobs))
    }

    async fn generate_audio(&self, stages: &Stages<'_>, state: &mut GenerationState) -> Result<()> {
        let audio = &self.config.audio;
        let seconds = state.scenes.len() as u32 * audio.duration_per_scene;

        let (lyrics, sung) = match (state.mode, state.pinyin_lyrics.clone()) {
            (Mode::Poetry, Some(pinyin)) => (state.prompt.clone(), pinyin),
            _ => {
                let lyrics = stages
                    .generate_lyrics(&state.story, &state.scenes, audio.language, seconds)
                    .await?;
                if audio.language == SongLanguage::Chinese {
                    let pinyin = stages.convert_to_pinyin(&lyrics).await?;
                    state.pinyin_lyrics = Some(pinyin.clone());
                    (lyrics, pinyin)
                } else {
                    (lyrics.clone(), lyrics)
                }
            }
        };
        let tags = stages.generate_music_tags(&state.story, audio.language).await?;

        let request = AudioRequest {
            lyrics: &sung,
            tags: &tags,
            seconds,
        };
        let path = join(&state.output_dir, song_file(audio.language));
        let written = match self.images.generate_audio(&request).await {
            Ok(bytes) => self.storage.write(&path, &bytes).await,
            Err(e) => Err(e),
        };
        let path = match written {
            Ok(()) => {
                info!("🎵 Song saved to {}", path);
                Some(path)
            }
            Err(e) => {
                error!("Audio generation failed: {}", e);
                None
            }
        };
        state.audio = Some(AudioInfo {
            path,
            lyrics,
            tags,
            duration_seconds: seconds,
        });
        Ok(())
    }

    /// Joins the finished clips and, when a song exists, muxes it in.
    /// Failures here are logged; the clips themselves stay on disk.
    async fn assemble_video(&self, state: &mut GenerationState) {
        let clips: Vec<String> = state
            .videos
            .iter()
            .filter(|v| v.success)
            .map(|v| v.output_path.clone())
            .collect();
        if clips.is_empty() {
            warn!("No successful videos to combine");
            return;
        }

        let combined = join(&state.output_dir, COMBINED_VIDEO);
        let result = if self.config.video.transitions {
            media::combine_with_transitions(&clips, &combined, TRANSITION_SECONDS).await
        } else {
            media::combine_videos(&clips, &combined).await
        };
        if let Err(e) = result {
            error!("Combining videos failed: {}", e);
            return;
        }
        state.combined_video = Some(combined.clone());

        if let Some(audio) = state.audio_path().map(str::to_string) {
            let with_audio = join(&state.output_dir, COMBINED_WITH_AUDIO);
            match media::add_audio(&combined, &audio, &with_audio).await {
                Ok(()) => state.combined_video = Some(with_audio),
                Err(e) => error!("Adding audio to {} failed: {}", combined, e),
            }
        }
    }

    async fn save_state(&self, state: &GenerationState) -> Result<()> {
        let path = join(&state.output_dir, STATE_FILE);
        let content = serde_json::to_string_pretty(state)?;
        self.storage
            .write(&path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to save {}", path))
    }
}
