use anyhow::Result;
use chrono::Local;
use log::info;
use std::fmt::Write as _;
use std::path::Path;

use crate::core::config::Mode;
use crate::core::io::Storage;
use crate::core::state::GenerationState;
use crate::services::video::{build_video_negative, build_video_prompt};

const RULE: &str = "================================================================================";
const SECTION: &str = "----------------------------------------";

pub fn record_file_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Story => "story_generation_record.txt",
        Mode::Poetry => "poetry_generation_record.txt",
    }
}

/// Renders the human-readable record of everything used to produce a run.
pub fn render_record(state: &GenerationState, include_video: bool) -> String {
    let mut out = String::new();
    let title = match state.mode {
        Mode::Story => "STORY GENERATION RECORD",
        Mode::Poetry => "POETRY GENERATION RECORD",
    };
    let _ = writeln!(out, "{}\n{}\n{}", RULE, title, RULE);
    let _ = writeln!(out, "Generated on: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Scenes: {}\n", state.scenes.len());

    let _ = writeln!(out, "🎯 ORIGINAL PROMPT\n{}\n{}\n", SECTION, state.prompt);
    if !state.style.trim().is_empty() {
        let _ = writeln!(out, "🎨 STYLE\n{}\n{}\n", SECTION, state.style);
    }

    let _ = writeln!(out, "🧩 LORA\n{}", SECTION);
    match &state.lora {
        Some(lora) => {
            let _ = writeln!(out, "{}", lora.describe());
            if !lora.trigger.is_empty() {
                let _ = writeln!(out, "Trigger: {}", lora.trigger);
            }
            if let (Some(settings), Some(source)) = (&lora.sampler, &lora.sampler_source) {
                let _ = writeln!(
                    out,
                    "Sampler settings from {}: cfg={:?} sampler={:?} steps={:?}",
                    source, settings.cfg, settings.sampler, settings.steps
                );
            }
            for ignored in &lora.ignored {
                let _ = writeln!(
                    out,
                    "Ignored settings from {}: cfg={:?} sampler={:?} steps={:?}",
                    ignored.lora, ignored.settings.cfg, ignored.settings.sampler, ignored.settings.steps
                );
            }
        }
        None => {
            let _ = writeln!(out, "No LoRA");
        }
    }
    if let Some(reasoning) = &state.lora_reasoning {
        let _ = writeln!(out, "Selection reasoning: {}", reasoning);
    }
    out.push('\n');

    let _ = writeln!(out, "📖 GENERATED STORY\n{}\n{}\n", SECTION, state.story);

    let _ = writeln!(out, "👥 CHARACTERS\n{}", SECTION);
    if state.characters.is_empty() {
        let _ = writeln!(out, "No characters generated.");
    }
    for (i, c) in state.characters.iter().enumerate() {
        let _ = writeln!(out, "{}. {}\n   Description: {}", i + 1, c.name, c.description);
    }
    out.push('\n');

    let _ = writeln!(out, "🎬 SCENES\n{}", SECTION);
    for (i, scene) in state.scenes.iter().enumerate() {
        let _ = writeln!(out, "SCENE {}", i + 1);
        let _ = writeln!(out, "Location: {}\nTime: {}\nAction: {}", scene.location, scene.time, scene.action);
        let names = scene.character_names();
        if names.is_empty() {
            let _ = writeln!(out, "Characters: none listed");
        } else {
            let _ = writeln!(out, "Characters: {}", names.join(", "));
        }
        let _ = writeln!(
            out,
            "Positive: {}",
            scene.image_prompt_positive.as_deref().unwrap_or("")
        );
        if let Some(negative) = &scene.image_prompt_negative {
            let _ = writeln!(out, "Negative: {}", negative);
        }
        if let Some(lora) = state.scene_loras.get(i) {
            let _ = writeln!(out, "LoRA: {}", lora.describe());
        }
        if include_video {
            let _ = writeln!(out, "Video prompt: {}", build_video_prompt(scene));
            let _ = writeln!(out, "Video negative: {}", build_video_negative(scene));
        }
        let _ = writeln!(out);
    }

    if let Some(audio) = &state.audio {
        let _ = writeln!(out, "🎵 AUDIO\n{}", SECTION);
        let _ = writeln!(out, "Duration: {} seconds", audio.duration_seconds);
        let _ = writeln!(out, "Music Style Tags: {}", audio.tags);
        let _ = writeln!(out, "Lyrics:\n{}\n", audio.lyrics);
    }
    if let Some(pinyin) = &state.pinyin_lyrics {
        let _ = writeln!(out, "🈶 PINYIN\n{}\n{}\n", SECTION, pinyin);
    }

    let _ = writeln!(out, "🖼️ IMAGES\n{}", SECTION);
    for path in &state.image_paths {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        let _ = writeln!(out, "  - {}", name);
    }
    out
}

/// Writes the record into the run directory and returns its path.
pub async fn write_record(
    state: &GenerationState,
    include_video: bool,
    storage: &dyn Storage,
) -> Result<String> {
    let path = Path::new(&state.output_dir)
        .join(record_file_name(state.mode))
        .to_string_lossy()
        .to_string();
    storage
        .write(&path, render_record(state, include_video).as_bytes())
        .await?;
    info!("📝 Generation record saved to {}", path);
    Ok(path)
}
