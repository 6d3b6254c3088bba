//! Motion prompts for image-to-video. They deliberately ask for very little
//! movement; characters tend to distort when the model animates them.

use crate::core::state::Scene;
use crate::services::comfyui::DEFAULT_NEGATIVE;
use crate::utils::text::join_nonempty;

const ENVIRONMENT_WORDS: &[&str] = &["wind", "breeze", "flowing", "rippling", "ripples"];
const LIGHT_WORDS: &[&str] = &["light", "glow", "shine", "sparkle", "glowing"];

const STILLNESS: &[&str] = &[
    "stable composition",
    "minimal character movement",
    "environmental ambience",
    "subtle lighting changes only",
    "camera remains still",
];

const MOTION_EXCLUSIONS: &[&str] = &[
    "too much movement",
    "excessive motion",
    "fast movement",
    "rapid action",
    "dramatic gestures",
    "sudden changes",
    "camera shake",
    "blurry motion",
    "distorted movement",
];

pub fn build_video_prompt(scene: &Scene) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !scene.location.trim().is_empty() {
        parts.push(format!("static scene at {}", scene.location.trim()));
    }
    if !scene.time.trim().is_empty() {
        parts.push(format!("during {}", scene.time.trim()));
    }
    if !scene.action.trim().is_empty() {
        let action = scene.action.to_lowercase();
        let movement = if ENVIRONMENT_WORDS.iter().any(|w| action.contains(w)) {
            "gentle environmental movement"
        } else if LIGHT_WORDS.iter().any(|w| action.contains(w)) {
            "subtle lighting effects"
        } else {
            "minimal movement"
        };
        parts.push(movement.to_string());
    }
    parts.extend(STILLNESS.iter().map(|s| s.to_string()));
    join_nonempty(parts)
}

pub fn build_video_negative(scene: &Scene) -> String {
    let base = scene
        .image_prompt_negative
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_NEGATIVE);
    join_nonempty(std::iter::once(base).chain(MOTION_EXCLUSIONS.iter().copied()))
}
