//! The LLM-driven generation steps. Every step pairs a model call with a
//! deterministic fallback and runs through the shared [`RetryExecutor`].

use anyhow::{bail, Result};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::core::config::{GenerationConfig, Mode, SongLanguage};
use crate::core::state::{Character, Scene};
use crate::services::llm::{call_tool_as, LlmClient, ToolSpec};
use crate::services::lora::prepend_missing;
use crate::services::retry::RetryExecutor;
use crate::utils::text::{join_nonempty, preview, title_case};

pub const LLM_DEFAULT_NEGATIVE: &str = "text, words, letters, writing, low quality, blurry, distorted, deformed";
pub const FALLBACK_NEGATIVE: &str =
    "low quality, worst quality, normal quality, text, signature, jpeg artifacts, bad anatomy, old, early";
const QUALITY_TAGS: &[&str] = &[
    "dynamic composition",
    "masterpiece",
    "best quality",
    "newest",
    "absurdres",
    "highres",
    "detailed",
    "no text",
];

const CHARACTER_KEYWORDS: &[&str] = &[
    "hero",
    "protagonist",
    "character",
    "person",
    "knight",
    "warrior",
    "mage",
    "princess",
    "king",
    "queen",
];
const FALLBACK_CHARACTER_LIMIT: usize = 2;

pub const CHINESE_TAGS: &str = "chinese traditional, guqin, erhu, bamboo flute, peaceful, meditative, \
classical chinese, poetic, vocal-driven, immediate vocals";
const ENGLISH_FALLBACK_TAGS: &str = "immediate vocals, vocal-driven, soft vocals, pop, piano, guitar, \
synthesizer, happy, cheerful, lighthearted, voice-first, early vocals";
const ENGLISH_FALLBACK_LYRICS: &str = "This is a beautiful story, telling of wonderful adventures. \
Let us sing this song together, feeling the story's magic.";
const CHINESE_FALLBACK_LYRICS: &str = "这是一个美丽的故事，充满了希望和梦想。让我们一起探索这个奇妙的世界。";

const SCENE_MODIFIERS: &[&[&str]] = &[
    &[],
    &["close-up shot", "detailed focus"],
    &["wide angle view", "panoramic composition"],
    &["medium shot", "balanced framing"],
    &["low angle view", "dramatic perspective"],
    &["high angle view", "bird's eye perspective"],
    &["soft lighting", "gentle illumination"],
    &["dramatic lighting", "strong contrast"],
    &["golden hour lighting", "warm atmosphere"],
    &["cinematic lighting", "professional photography"],
];
const EXTRA_MODIFIERS: &[&str] = &["artistic composition", "enhanced details", "refined quality", "improved clarity"];

const PINYIN_SYSTEM: &str = "You are an expert in Chinese poetry and pinyin conversion. \
Your task is to convert Chinese text into pinyin format suitable for singing.";

#[derive(Debug, Deserialize)]
struct CharacterList {
    characters: Vec<Character>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SceneCharacter {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        description: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawScene {
    #[serde(default)]
    location: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    characters: Vec<SceneCharacter>,
    #[serde(default)]
    action: String,
}

#[derive(Debug, Deserialize)]
struct SceneList {
    scenes: Vec<RawScene>,
}

#[derive(Debug, Deserialize)]
struct ScenePrompt {
    #[serde(alias = "image_prompt_positive")]
    positive: String,
    #[serde(default, alias = "image_prompt_negative")]
    negative: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptList {
    prompts: Vec<ScenePrompt>,
}

fn characters_tool() -> ToolSpec {
    ToolSpec {
        name: "extract_characters",
        description: "Record the characters of the story with visual descriptions",
        parameters: json!({
            "type": "object",
            "properties": {
                "characters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "description": {
                                "type": "string",
                                "description": "Appearance and characteristics"
                            }
                        },
                        "required": ["name", "description"]
                    }
                }
            },
            "required": ["characters"]
        }),
    }
}

fn scenes_tool() -> ToolSpec {
    ToolSpec {
        name: "create_scenes",
        description: "Record the storyboard scenes",
        parameters: json!({
            "type": "object",
            "properties": {
                "scenes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "location": { "type": "string" },
                            "time": { "type": "string" },
                            "characters": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Names of the characters present"
                            },
                            "action": { "type": "string" }
                        },
                        "required": ["location", "time", "characters", "action"]
                    }
                }
            },
            "required": ["scenes"]
        }),
    }
}

fn prompts_tool() -> ToolSpec {
    ToolSpec {
        name: "create_image_prompts",
        description: "Record one positive and one negative image prompt per scene, in scene order",
        parameters: json!({
            "type": "object",
            "properties": {
                "prompts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "positive": { "type": "string" },
                            "negative": { "type": "string" }
                        },
                        "required": ["positive", "negative"]
                    }
                }
            },
            "required": ["prompts"]
        }),
    }
}

fn format_characters(characters: &[Character]) -> String {
    characters
        .iter()
        .map(|c| format!("name={},description={}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("| ")
}

fn resolve_scene(raw: RawScene, known: &[Character]) -> Scene {
    let characters = raw
        .characters
        .into_iter()
        .map(|c| {
            let (name, description) = match c {
                SceneCharacter::Name(name) => (name, String::new()),
                SceneCharacter::Full { name, description } => (name, description),
            };
            known
                .iter()
                .find(|k| k.name.eq_ignore_ascii_case(name.trim()))
                .cloned()
                .unwrap_or_else(|| Character::new(name.trim(), description))
        })
        .collect();
    Scene {
        location: or_unknown(raw.location, "Unknown location"),
        time: or_unknown(raw.time, "Unknown time"),
        characters,
        action: or_unknown(raw.action, "Unknown action"),
        image_prompt_positive: None,
        image_prompt_negative: None,
    }
}

fn or_unknown(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// Keyword scan used when character extraction fails.
pub fn fallback_characters(story: &str, mode: Mode) -> Vec<Character> {
    if mode == Mode::Poetry {
        return vec![Character::new(
            "The Poet",
            "A contemplative figure observing the scene described in the poetry, dressed in traditional Chinese robes",
        )];
    }
    let lower = story.to_lowercase();
    let found: Vec<Character> = CHARACTER_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .take(FALLBACK_CHARACTER_LIMIT)
        .map(|k| Character::new(title_case(k), format!("A {} from the story", k)))
        .collect();
    if found.is_empty() {
        vec![Character::new("Main Character", "The protagonist of the story")]
    } else {
        found
    }
}

pub fn fallback_scenes(story: &str, characters: &[Character], mode: Mode) -> Vec<Scene> {
    let scene = |location: &str, time: &str, action: &str| Scene {
        location: location.to_string(),
        time: time.to_string(),
        characters: characters.to_vec(),
        action: action.to_string(),
        ..Default::default()
    };
    if mode == Mode::Poetry {
        return vec![scene("Poetry landscape", "Timeless moment", "Contemplating the scene")];
    }
    let mut scenes = vec![scene("Story setting", "Beginning", "The story begins")];
    if story.chars().count() > 100 {
        scenes.push(scene("Story progression", "Middle", "The story develops"));
    }
    scenes.push(scene("Story conclusion", "End", "The story concludes"));
    scenes
}

pub fn fallback_prompts(scenes: &[Scene], style: &str, trigger: &str) -> Vec<Scene> {
    scenes
        .iter()
        .map(|scene| {
            let mut parts: Vec<&str> = vec![trigger];
            if !style.trim().is_empty() {
                parts.extend([style, "style"]);
            }
            parts.push(if scene.action.trim().is_empty() { "scene" } else { scene.action.as_str() });
            parts.extend(QUALITY_TAGS);
            Scene {
                image_prompt_positive: Some(join_nonempty(parts)),
                image_prompt_negative: Some(FALLBACK_NEGATIVE.to_string()),
                ..scene.clone()
            }
        })
        .collect()
}

/// Builds `n` prompts for one scene without asking the model. Prompt parts that
/// mention a scene character are kept verbatim; only camera and lighting vary.
pub fn prompt_variants(scene: &Scene, n: usize) -> Vec<String> {
    let base = scene.image_prompt_positive.clone().unwrap_or_default();
    if n <= 1 {
        return vec![base];
    }

    let names: Vec<String> = scene.characters.iter().map(|c| c.name.to_lowercase()).collect();
    let (character_parts, other_parts): (Vec<&str>, Vec<&str>) = base
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .partition(|part| {
            let lower = part.to_lowercase();
            names.iter().any(|n| !n.is_empty() && lower.contains(n.as_str()))
        });

    let character_parts: Vec<String> = if character_parts.is_empty() {
        scene
            .characters
            .iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| join_nonempty([c.name.as_str(), c.description.as_str()]))
            .collect()
    } else {
        character_parts.iter().map(|s| s.to_string()).collect()
    };

    (0..n)
        .map(|i| {
            let mut parts: Vec<String> = character_parts.clone();
            parts.extend(other_parts.iter().map(|s| s.to_string()));
            parts.extend(SCENE_MODIFIERS[i % SCENE_MODIFIERS.len()].iter().map(|s| s.to_string()));
            if i >= SCENE_MODIFIERS.len() {
                parts.push(EXTRA_MODIFIERS[i % EXTRA_MODIFIERS.len()].to_string());
            }
            join_nonempty(parts)
        })
        .collect()
}

/// Generation steps bound to one LLM and one retry budget.
pub struct Stages<'a> {
    llm: &'a dyn LlmClient,
    retry: &'a RetryExecutor,
    mode: Mode,
    max_characters: usize,
    max_scenes: usize,
}

impl<'a> Stages<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: &'a RetryExecutor, config: &GenerationConfig) -> Self {
        Self {
            llm,
            retry,
            mode: config.mode,
            max_characters: config.max_characters.max(1),
            max_scenes: config.max_scenes.max(1),
        }
    }

    pub async fn generate_story(&self, prompt: &str) -> Result<String> {
        let story = self
            .retry
            .run(
                "Story generation",
                || self.story_once(prompt),
                || {
                    Ok(match self.mode {
                        Mode::Story => format!(
                            "Once upon a time, there was an adventure that began with: {}. \
                             The story unfolded with courage, challenges, and ultimately triumph.",
                            prompt
                        ),
                        Mode::Poetry => format!(
                            "A visual interpretation of the classical Chinese poetry: {}. \
                             The scene unfolds with poetic imagery and deep emotions.",
                            prompt
                        ),
                    })
                },
            )
            .await?;
        info!("📖 Story ready: {}", preview(&story, 80));
        Ok(story)
    }

    async fn story_once(&self, prompt: &str) -> Result<String> {
        let (system, user) = match self.mode {
            Mode::Story => (
                "You are a writer specializing in writing stories. You will be provided with a \
                 prompt and your goal is to write a story based on that prompt.",
                format!(
                    "Write a story based on the following prompt. Your story should be engaging and \
                     creative, and should be between 100 and 300 words. Do not provide any \
                     explanations or text apart from the story, the story must be written in english.\n\
                     Prompt: {}",
                    prompt
                ),
            ),
            Mode::Poetry => (
                "You are a poet and storyteller who creates vivid visual narratives from classical \
                 Chinese poetry.",
                format!(
                    "Create a visual story based on this Chinese poetry:\n\n{}\n\nCapture the mood, \
                     imagery and emotions of the poetry, describe landscapes, characters and actions \
                     that can be visualized in scenes. The story should be 100-300 words, written in \
                     English.",
                    prompt
                ),
            ),
        };
        Ok(self.llm.chat(system, &user).await?.trim().to_string())
    }

    pub async fn extract_characters(&self, story: &str, prompt: &str) -> Result<Vec<Character>> {
        let characters = self
            .retry
            .run(
                "Character generation",
                || self.characters_once(story, prompt),
                || Ok(fallback_characters(story, self.mode)),
            )
            .await?;
        info!("👥 {} character(s) extracted", characters.len());
        Ok(characters)
    }

    async fn characters_once(&self, story: &str, prompt: &str) -> Result<Vec<Character>> {
        let source = match self.mode {
            Mode::Story => format!("Story: {}", story),
            Mode::Poetry => format!("Original Poetry:\n{}\n\nVisual Story:\n{}", prompt, story),
        };
        let user = format!(
            "Generate characters (maximum: {}) based on the following text.\n\n{}\n\n\
             Requirements for character descriptions:\n\
             1. Include detailed physical appearance (hair, eyes, face, body type)\n\
             2. Specify clothing style and distinctive accessories\n\
             3. Mention any unique visual characteristics or markings\n\
             4. Keep descriptions consistent with the setting and tone\n\
             5. Focus on visual details that keep characters consistent across images",
            self.max_characters, source
        );
        let list: CharacterList = call_tool_as(
            self.llm,
            "You are a writer specializing in character development. Describe characters with \
             visual details that help consistent image generation.",
            &user,
            &characters_tool(),
        )
        .await?;
        Ok(list
            .characters
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .take(self.max_characters)
            .collect())
    }

    pub async fn generate_scenes(
        &self,
        story: &str,
        prompt: &str,
        characters: &[Character],
        style: &str,
    ) -> Result<Vec<Scene>> {
        let scenes = self
            .retry
            .run(
                "Scene generation",
                || self.scenes_once(story, prompt, characters, style),
                || Ok(fallback_scenes(story, characters, self.mode)),
            )
            .await?;
        info!("🎬 {} scene(s) created", scenes.len());
        Ok(scenes)
    }

    async fn scenes_once(
        &self,
        story: &str,
        prompt: &str,
        characters: &[Character],
        style: &str,
    ) -> Result<Vec<Scene>> {
        let style_line = if style.trim().is_empty() {
            String::new()
        } else {
            format!("Visual Style: {}\n", style)
        };
        let user = match self.mode {
            Mode::Story => format!(
                "Generate scenes (maximum: {}) based on the following story and characters.\n\n\
                 Story: {}\nCharacters: {}\n{}\n\
                 IMPORTANT: Only use the characters listed above. Treat any other entity as part of \
                 the environment.\n\n\
                 For each scene give the location, the time, the characters present (by name) and \
                 the action. Each scene is a distinct moment that advances the narrative.",
                self.max_scenes,
                story,
                format_characters(characters),
                style_line
            ),
            Mode::Poetry => format!(
                "Generate visual scenes based below:\n\nOriginal Poetry:\n{}\n\nVisual Story:\n{}\n\n\
                 Characters: {}\n{}\n\
                 Create {} scenes giving the location, the time or mood, the characters present (by \
                 name) and what is happening or being contemplated.",
                prompt,
                story,
                format_characters(characters),
                style_line,
                self.max_scenes
            ),
        };
        let list: SceneList = call_tool_as(
            self.llm,
            "You break stories down into visual storyboard scenes. Each scene is the storyboard for a \
             short video of about 5 seconds. Do not write image prompts.",
            &user,
            &scenes_tool(),
        )
        .await?;
        Ok(list
            .scenes
            .into_iter()
            .take(self.max_scenes)
            .map(|raw| resolve_scene(raw, characters))
            .collect())
    }

    /// Fills `image_prompt_positive` / `image_prompt_negative` for every scene.
    /// `trigger` is prepended to any prompt that lacks it.
    pub async fn generate_prompts(
        &self,
        scenes: &[Scene],
        characters: &[Character],
        style: &str,
        trigger: &str,
    ) -> Result<Vec<Scene>> {
        let prompted = self
            .retry
            .run(
                "Prompt generation",
                || self.prompts_once(scenes, characters, style, trigger),
                || Ok(fallback_prompts(scenes, style, trigger)),
            )
            .await?;
        for (i, scene) in prompted.iter().enumerate() {
            info!(
                "Scene {} prompts\n  ✅ {}\n  ❌ {}",
                i + 1,
                scene.image_prompt_positive.as_deref().unwrap_or(""),
                scene.image_prompt_negative.as_deref().unwrap_or("")
            );
        }
        Ok(prompted)
    }

    async fn prompts_once(
        &self,
        scenes: &[Scene],
        characters: &[Character],
        style: &str,
        trigger: &str,
    ) -> Result<Vec<Scene>> {
        let style_line = if style.trim().is_empty() {
            "Visual Style: Not specified - derive style from scene content naturally".to_string()
        } else {
            format!("Visual Style: {}", style)
        };
        let trigger_line = if trigger.is_empty() {
            String::new()
        } else {
            format!(
                "\nIMPORTANT: You MUST include these trigger words in EVERY positive prompt: '{}'.",
                trigger
            )
        };
        let scene_lines = scenes
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(
                    "Scene {}:\n- Location: {}\n- Time: {}\n- Action: {}\n- Characters: {}",
                    i + 1,
                    s.location,
                    s.time,
                    s.action,
                    s.character_names().join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Generate positive and negative image prompts for each scene below.\n\n\
             Characters: {}\n{}{}\n\n\
             Positive prompts: describe who, what, where and when; composition, lighting and mood; \
             keep characters consistent; under 77 describing words; no text, words or letters in \
             the image; tag format like \"1girl, character name, details, actions, quality tags\".\n\
             Negative prompts: concise list of things to avoid, like \"{}\".\n\n\
             Scenes to process: {} scenes\n\n{}",
            format_characters(characters),
            style_line,
            trigger_line,
            LLM_DEFAULT_NEGATIVE,
            scenes.len(),
            scene_lines
        );
        let list: PromptList = call_tool_as(
            self.llm,
            "You are an expert prompt engineer for image generation models like Stable Diffusion. \
             Write accurate prompts that keep characters consistent across scenes.",
            &user,
            &prompts_tool(),
        )
        .await?;

        if list.prompts.len() != scenes.len() {
            bail!(
                "Prompt count mismatch: expected {}, got {}",
                scenes.len(),
                list.prompts.len()
            );
        }
        if let Some(i) = list.prompts.iter().position(|p| p.positive.trim().is_empty()) {
            bail!("Prompt {} has an empty positive prompt", i + 1);
        }

        Ok(scenes
            .iter()
            .zip(list.prompts)
            .map(|(scene, p)| Scene {
                image_prompt_positive: Some(prepend_missing(trigger, &p.positive)),
                image_prompt_negative: Some(
                    p.negative
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| LLM_DEFAULT_NEGATIVE.to_string()),
                ),
                ..scene.clone()
            })
            .collect())
    }

    pub async fn convert_to_pinyin(&self, text: &str) -> Result<String> {
        self.retry
            .run(
                "Pinyin conversion",
                || self.pinyin_once(text),
                || {
                    warn!("Pinyin conversion failed, using original text");
                    Ok(text.to_string())
                },
            )
            .await
    }

    async fn pinyin_once(&self, text: &str) -> Result<String> {
        let user = format!(
            "Convert the following Chinese text into pinyin format for audio generation.\n\n\
             Chinese Text:\n{}\n\n\
             Requirements:\n\
             1. Convert each Chinese character to its pinyin with tone numbers (1-4)\n\
             2. Group the pinyin by verses, maintaining the original structure\n\
             3. Format:\n   [verse]\n   [zh]pinyin1 pinyin2 pinyin3...\n\
             4. Each line starts with [zh] followed by pinyin separated by spaces\n\
             5. Separate verses with [verse] markers\n\n\
             Output ONLY the formatted pinyin, no explanations.",
            text
        );
        Ok(self.llm.chat(PINYIN_SYSTEM, &user).await?.trim().to_string())
    }

    pub async fn generate_lyrics(
        &self,
        story: &str,
        scenes: &[Scene],
        language: SongLanguage,
        duration_seconds: u32,
    ) -> Result<String> {
        self.retry
            .run(
                "Lyrics generation",
                || self.lyrics_once(story, scenes, language, duration_seconds),
                || {
                    Ok(match language {
                        SongLanguage::English => ENGLISH_FALLBACK_LYRICS,
                        SongLanguage::Chinese => CHINESE_FALLBACK_LYRICS,
                    }
                    .to_string())
                },
            )
            .await
    }

    async fn lyrics_once(
        &self,
        story: &str,
        scenes: &[Scene],
        language: SongLanguage,
        duration_seconds: u32,
    ) -> Result<String> {
        let user = match language {
            SongLanguage::English => {
                let scene_lines = scenes
                    .iter()
                    .enumerate()
                    .map(|(i, s)| format!("Scene {}: {} at {} during {}", i + 1, s.action, s.location, s.time))
                    .collect::<Vec<_>>()
                    .join("\n");
                let min_words = duration_seconds * 3 / 2;
                let max_words = duration_seconds * 5 / 2;
                format!(
                    "Based on the following story and scenes, write song lyrics that capture the \
                     narrative and emotions.\n\nStory:\n{}\n\nScenes:\n{}\n\n\
                     Song Duration: {} seconds\n\n\
                     - Include a chorus that captures the main theme\n\
                     - Keep it between {}-{} words\n\
                     - Start with vocals immediately, with a strong opening line\n\n\
                     Write only the lyrics, no explanations or formatting markers.",
                    story, scene_lines, duration_seconds, min_words, max_words
                )
            }
            SongLanguage::Chinese => format!(
                "Based on this story and scenes, create Chinese lyrics for a song:\n\n\
                 Story: {}\n\nScenes: {}\n\n\
                 Write 4-8 poetic, singable lines in Chinese that capture the emotional and visual \
                 essence of the story.\n\nOutput ONLY the Chinese lyrics, no explanations.",
                story,
                scenes.iter().map(|s| s.action.as_str()).collect::<Vec<_>>().join("; ")
            ),
        };
        Ok(self
            .llm
            .chat(
                "You are a talented songwriter who creates catchy, emotional songs based on stories.",
                &user,
            )
            .await?
            .trim()
            .to_string())
    }

    pub async fn generate_music_tags(&self, story: &str, language: SongLanguage) -> Result<String> {
        if language == SongLanguage::Chinese {
            return Ok(CHINESE_TAGS.to_string());
        }
        self.retry
            .run(
                "Music tags generation",
                || self.tags_once(story),
                || Ok(ENGLISH_FALLBACK_TAGS.to_string()),
            )
            .await
    }

    async fn tags_once(&self, story: &str) -> Result<String> {
        let user = format!(
            "Based on this story, suggest appropriate music style tags:\n\nStory: {}\n\n\
             Use genres, moods, instruments, tempo and style modifiers. Include tags that emphasize \
             immediate vocal entry such as \"immediate vocals\", \"vocal-driven\" or \"voice-first\".\n\n\
             Return only a comma-separated list of tags (10-15 tags maximum), no explanations.",
            story
        );
        let raw = self
            .llm
            .chat(
                "You are a music producer who selects musical styles and instruments based on story \
                 content and mood.",
                &user,
            )
            .await?;
        Ok(join_nonempty(raw.trim().trim_matches('"').split(',')))
    }
}
