use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use url::Url;

use crate::core::config::{ComfyUiConfig, NodeIds};
use crate::core::io::Storage;
use crate::services::lora::{CombinedLora, LoraPlan};

const DEFAULT_IMAGE_WORKFLOW: &str = include_str!("../../assets/image_workflow.json");
const DEFAULT_AUDIO_WORKFLOW: &str = include_str!("../../assets/audio_workflow.json");

pub const DEFAULT_NEGATIVE: &str =
    "text, words, letters, watermark, signature, username, logo, writing, caption, subtitle";

const AUDIO_TEXT_NODE: &str = "14";
const AUDIO_LATENT_NODE: &str = "17";
const AUDIO_SAMPLER_NODE: &str = "52";

pub struct ImageRequest<'a> {
    pub positive: &'a str,
    pub negative: Option<&'a str>,
    pub lora: &'a CombinedLora,
}

pub struct AudioRequest<'a> {
    pub lyrics: &'a str,
    pub tags: &'a str,
    pub seconds: u32,
}

/// Anything that can render an image (and a song) from prompts.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate_image(&self, request: &ImageRequest<'_>) -> Result<Vec<u8>>;
    async fn generate_audio(&self, request: &AudioRequest<'_>) -> Result<Vec<u8>>;
}

/// Random seed limited to 63 bits, which ComfyUI accepts.
pub fn random_seed() -> u64 {
    rand::random::<u64>() >> 1
}

#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Map<String, Value>,
    nodes: NodeIds,
}

impl WorkflowTemplate {
    pub fn from_json(json: &str, nodes: NodeIds) -> Result<Self> {
        let graph: Map<String, Value> =
            serde_json::from_str(json).context("Workflow template must be a JSON object")?;
        Ok(Self { graph, nodes })
    }

    pub fn default_image(nodes: NodeIds) -> Result<Self> {
        Self::from_json(DEFAULT_IMAGE_WORKFLOW, nodes)
    }

    /// A ready-to-queue graph with prompts, adapters and sampler settings applied.
    pub fn build(&self, request: &ImageRequest<'_>, seed: u64) -> Result<Value> {
        let mut graph = self.graph.clone();
        splice_lora(&mut graph, &self.nodes.lora, &request.lora.plan)?;

        let positive = request.lora.apply_trigger(request.positive);
        let negative = match request.negative {
            Some(n) if !n.trim().is_empty() => format!("{}, {}", n.trim(), DEFAULT_NEGATIVE),
            _ => DEFAULT_NEGATIVE.to_string(),
        };
        set_input(&mut graph, &self.nodes.positive, "text", json!(positive))?;
        set_input(&mut graph, &self.nodes.negative, "text", json!(negative))?;

        let sampler = &self.nodes.sampler;
        if let Some(settings) = &request.lora.sampler {
            if let Some(cfg) = settings.cfg {
                set_input(&mut graph, sampler, "cfg", json!(cfg))?;
            }
            if let Some(name) = &settings.sampler {
                set_input(&mut graph, sampler, "sampler_name", json!(name))?;
            }
            if let Some(steps) = settings.steps {
                set_input(&mut graph, sampler, "steps", json!(steps))?;
            }
            debug!(
                "Applied sampler settings from {:?}: {:?}",
                request.lora.sampler_source, settings
            );
        }
        set_input(&mut graph, sampler, "seed", json!(seed))?;

        Ok(Value::Object(graph))
    }
}

fn inputs_mut<'g>(graph: &'g mut Map<String, Value>, node: &str) -> Result<&'g mut Map<String, Value>> {
    graph
        .get_mut(node)
        .and_then(|n| n.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| anyhow!("Workflow template has no node {} with inputs", node))
}

fn set_input(graph: &mut Map<String, Value>, node: &str, key: &str, value: Value) -> Result<()> {
    inputs_mut(graph, node)?.insert(key.to_string(), value);
    Ok(())
}

/// Points every `[from, slot]` link at `target(slot)`.
fn rewire<F>(graph: &mut Map<String, Value>, from: &str, target: F)
where
    F: Fn(u64) -> Value,
{
    for node in graph.values_mut() {
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        for value in inputs.values_mut() {
            let slot = match value.as_array().map(Vec::as_slice) {
                Some([Value::String(id), slot]) if id == from => slot.as_u64(),
                _ => None,
            };
            if let Some(slot) = slot {
                *value = target(slot);
            }
        }
    }
}

fn loader_inputs(file: &str, strength_model: f64, strength_clip: f64, model: Value, clip: Value) -> Value {
    json!({
        "lora_name": file,
        "strength_model": strength_model,
        "strength_clip": strength_clip,
        "model": model,
        "clip": clip,
    })
}

fn splice_lora(graph: &mut Map<String, Value>, loader_id: &str, plan: &LoraPlan) -> Result<()> {
    match plan {
        LoraPlan::Bypass => {
            let Some(loader) = graph.remove(loader_id) else {
                return Ok(());
            };
            let model = loader["inputs"]["model"].clone();
            let clip = loader["inputs"]["clip"].clone();
            rewire(graph, loader_id, |slot| if slot == 0 { model.clone() } else { clip.clone() });
        }
        LoraPlan::Single(lora) => {
            let inputs = inputs_mut(graph, loader_id)?;
            inputs.insert("lora_name".to_string(), json!(lora.file));
            inputs.insert("strength_model".to_string(), json!(lora.strength_model));
            inputs.insert("strength_clip".to_string(), json!(lora.strength_clip));
        }
        LoraPlan::Chain(chain) => {
            let loader = graph
                .remove(loader_id)
                .ok_or_else(|| anyhow!("Workflow template has no LoRA loader node {}", loader_id))?;
            let class_type = loader["class_type"].clone();
            let mut model = loader["inputs"]["model"].clone();
            let mut clip = loader["inputs"]["clip"].clone();

            for (i, lora) in chain.iter().enumerate() {
                let id = format!("{}_{}", loader_id, i);
                graph.insert(
                    id.clone(),
                    json!({
                        "class_type": class_type,
                        "inputs": loader_inputs(&lora.file, lora.strength_model, lora.strength_clip, model, clip),
                    }),
                );
                model = json!([id, 0]);
                clip = json!([id, 1]);
            }
            rewire(graph, loader_id, |slot| if slot == 0 { model.clone() } else { clip.clone() });
        }
    }
    Ok(())
}

fn build_audio_graph(template: &Map<String, Value>, request: &AudioRequest<'_>, seed: u64) -> Result<Value> {
    let mut graph = template.clone();
    set_input(&mut graph, AUDIO_TEXT_NODE, "lyrics", json!(request.lyrics))?;
    if !request.tags.trim().is_empty() {
        set_input(&mut graph, AUDIO_TEXT_NODE, "tags", json!(request.tags))?;
    }
    set_input(&mut graph, AUDIO_LATENT_NODE, "seconds", json!(request.seconds))?;
    set_input(&mut graph, AUDIO_SAMPLER_NODE, "seed", json!(seed))?;
    Ok(Value::Object(graph))
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_type")]
    pub folder_type: String,
}

fn default_output_type() -> String {
    "output".to_string()
}

/// Numeric node ids sort by value and ahead of any non-numeric ones.
fn node_order(id: &str) -> (bool, u64) {
    match id.parse::<u64>() {
        Ok(n) => (false, n),
        Err(_) => (true, 0),
    }
}

/// First file of `kind` ("images" or "audio") in a history `outputs` map,
/// scanning nodes in id order.
pub fn first_output(outputs: &Map<String, Value>, kind: &str) -> Option<OutputFile> {
    let mut ids: Vec<&String> = outputs.keys().collect();
    ids.sort_by(|a, b| node_order(a).cmp(&node_order(b)).then_with(|| a.cmp(b)));
    ids.into_iter()
        .filter_map(|id| outputs[id].get(kind).and_then(Value::as_array))
        .flat_map(|files| files.iter())
        .find_map(|f| serde_json::from_value(f.clone()).ok())
}

pub struct ComfyUiClient {
    address: String,
    client_id: String,
    http: reqwest::Client,
    image_template: WorkflowTemplate,
    audio_template: Map<String, Value>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ComfyUiClient {
    pub async fn from_config(config: &ComfyUiConfig, storage: &dyn Storage) -> Result<Self> {
        let image_template = match &config.workflow {
            Some(path) => {
                let json = storage.read_to_string(path).await?;
                WorkflowTemplate::from_json(&json, config.nodes.clone())
                    .with_context(|| format!("Invalid workflow template {}", path))?
            }
            None => WorkflowTemplate::default_image(config.nodes.clone())?,
        };
        let audio_json = match &config.audio_workflow {
            Some(path) => storage.read_to_string(path).await?,
            None => DEFAULT_AUDIO_WORKFLOW.to_string(),
        };
        let audio_template = serde_json::from_str(&audio_json).context("Invalid audio workflow template")?;

        Ok(Self {
            address: config.server_address(),
            client_id: uuid::Uuid::new_v4().to_string(),
            http: reqwest::Client::new(),
            image_template,
            audio_template,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    async fn queue_prompt(&self, graph: &Value) -> Result<String> {
        let url = format!("http://{}/prompt", self.address);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "prompt": graph, "client_id": self.client_id }))
            .send()
            .await
            .context("Failed to reach ComfyUI")?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("ComfyUI API error: {}", error_text));
        }

        let body: Value = resp.json().await?;
        body["prompt_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ComfyUI response missing prompt_id: {}", body))
    }

    async fn wait_for_outputs(&self, prompt_id: &str) -> Result<Map<String, Value>> {
        let url = format!("http://{}/history/{}", self.address, prompt_id);
        let deadline = Instant::now() + self.timeout;

        loop {
            let history: Value = self.http.get(&url).send().await?.json().await?;
            if let Some(entry) = history.get(prompt_id) {
                if entry["status"]["status_str"] == "error" {
                    bail!("ComfyUI execution failed for prompt {}", prompt_id);
                }
                if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
                    if !outputs.is_empty() {
                        return Ok(outputs.clone());
                    }
                }
            }
            if Instant::now() >= deadline {
                bail!("Timed out waiting for ComfyUI prompt {}", prompt_id);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn fetch(&self, file: &OutputFile) -> Result<Vec<u8>> {
        let mut url = Url::parse(&format!("http://{}/view", self.address))?;
        url.query_pairs_mut()
            .append_pair("filename", &file.filename)
            .append_pair("subfolder", &file.subfolder)
            .append_pair("type", &file.folder_type);

        let resp = self.http.get(url.as_str()).send().await?;
        if !resp.status().is_success() {
            bail!("ComfyUI view failed for {}: {}", file.filename, resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn run_graph(&self, graph: &Value, kind: &str) -> Result<Vec<u8>> {
        let prompt_id = self.queue_prompt(graph).await?;
        info!("Queued ComfyUI prompt {}", prompt_id);
        let outputs = self.wait_for_outputs(&prompt_id).await?;
        let file = first_output(&outputs, kind)
            .ok_or_else(|| anyhow!("No {} output for ComfyUI prompt {}", kind, prompt_id))?;
        self.fetch(&file).await
    }
}

#[async_trait]
impl ImageBackend for ComfyUiClient {
    async fn generate_image(&self, request: &ImageRequest<'_>) -> Result<Vec<u8>> {
        let graph = self.image_template.build(request, random_seed())?;
        self.run_graph(&graph, "images").await
    }

    async fn generate_audio(&self, request: &AudioRequest<'_>) -> Result<Vec<u8>> {
        let graph = build_audio_graph(&self.audio_template, request, random_seed())?;
        self.run_graph(&graph, "audio").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::lora::{combine, LoraDescriptor, RecommendedSettings};

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::default_image(NodeIds::default()).unwrap()
    }

    fn lora(name: &str, trigger: &str) -> LoraDescriptor {
        let mut d = LoraDescriptor::new(name, format!("{}.safetensors", name));
        d.trigger = Some(trigger.to_string());
        d
    }

    #[test]
    fn test_bypass_removes_loader_and_wires_checkpoint() -> Result<()> {
        let combined = CombinedLora::bypass();
        let request = ImageRequest { positive: "a castle", negative: None, lora: &combined };
        let graph = template().build(&request, 42)?;

        assert!(graph.get("38").is_none());
        assert_eq!(graph["3"]["inputs"]["model"], json!(["4", 0]));
        assert_eq!(graph["6"]["inputs"]["clip"], json!(["4", 1]));
        assert_eq!(graph["7"]["inputs"]["clip"], json!(["4", 1]));
        assert_eq!(graph["6"]["inputs"]["text"], "a castle");
        assert_eq!(graph["7"]["inputs"]["text"], DEFAULT_NEGATIVE);
        assert_eq!(graph["3"]["inputs"]["seed"], 42);
        Ok(())
    }

    #[test]
    fn test_single_sets_loader_fields_and_sampler() -> Result<()> {
        let mut only = lora("anime", "anime style");
        only.strength_model = 0.6;
        only.recommended = Some(RecommendedSettings {
            cfg: Some(4.5),
            sampler: Some("dpmpp_2m".to_string()),
            steps: Some(28),
        });
        let combined = combine(&[only], &[]);
        let request = ImageRequest { positive: "a castle", negative: Some("blurry"), lora: &combined };
        let graph = template().build(&request, 1)?;

        let loader = &graph["38"]["inputs"];
        assert_eq!(loader["lora_name"], "anime.safetensors");
        assert_eq!(loader["strength_model"], 0.6);
        assert_eq!(graph["6"]["inputs"]["text"], "anime style, a castle");
        assert!(graph["7"]["inputs"]["text"].as_str().unwrap().starts_with("blurry, text"));
        assert_eq!(graph["3"]["inputs"]["cfg"], 4.5);
        assert_eq!(graph["3"]["inputs"]["sampler_name"], "dpmpp_2m");
        assert_eq!(graph["3"]["inputs"]["steps"], 28);
        Ok(())
    }

    #[test]
    fn test_chain_inserts_linked_loaders() -> Result<()> {
        let combined = combine(&[lora("base", "base")], &[lora("ink", "ink wash")]);
        let request = ImageRequest { positive: "a lake", negative: None, lora: &combined };
        let graph = template().build(&request, 7)?;

        assert!(graph.get("38").is_none());
        assert_eq!(graph["38_0"]["inputs"]["model"], json!(["4", 0]));
        assert_eq!(graph["38_0"]["inputs"]["lora_name"], "base.safetensors");
        assert_eq!(graph["38_1"]["inputs"]["model"], json!(["38_0", 0]));
        assert_eq!(graph["38_1"]["inputs"]["clip"], json!(["38_0", 1]));
        assert_eq!(graph["38_1"]["class_type"], "LoraLoader");
        assert_eq!(graph["3"]["inputs"]["model"], json!(["38_1", 0]));
        assert_eq!(graph["6"]["inputs"]["clip"], json!(["38_1", 1]));
        assert_eq!(graph["6"]["inputs"]["text"], "base, ink wash, a lake");
        Ok(())
    }

    #[test]
    fn test_missing_node_is_reported() {
        let nodes = NodeIds { positive: "999".to_string(), ..NodeIds::default() };
        let template = WorkflowTemplate::default_image(nodes).unwrap();
        let combined = CombinedLora::bypass();
        let request = ImageRequest { positive: "x", negative: None, lora: &combined };
        assert!(template.build(&request, 0).is_err());
    }

    #[test]
    fn test_audio_graph_sets_lyrics_duration_and_seed() -> Result<()> {
        let audio: Map<String, Value> = serde_json::from_str(DEFAULT_AUDIO_WORKFLOW)?;
        let request = AudioRequest { lyrics: "[verse]\nla la", tags: "folk, calm", seconds: 15 };
        let graph = build_audio_graph(&audio, &request, 9)?;
        assert_eq!(graph["14"]["inputs"]["lyrics"], "[verse]\nla la");
        assert_eq!(graph["14"]["inputs"]["tags"], "folk, calm");
        assert_eq!(graph["17"]["inputs"]["seconds"], 15);
        assert_eq!(graph["52"]["inputs"]["seed"], 9);
        Ok(())
    }

    #[test]
    fn test_first_output_scans_in_node_order() {
        let outputs: Map<String, Value> = serde_json::from_value(json!({
            "9": { "images": [{ "filename": "kgen_00002_.png", "subfolder": "", "type": "output" }] },
            "10": { "text": ["ignored"] },
            "59": { "audio": [{ "filename": "kgen_00001_.mp3", "subfolder": "audio", "type": "output" }] }
        }))
        .unwrap();

        let image = first_output(&outputs, "images").unwrap();
        assert_eq!(image.filename, "kgen_00002_.png");
        let audio = first_output(&outputs, "audio").unwrap();
        assert_eq!(audio.subfolder, "audio");
        assert!(first_output(&outputs, "gifs").is_none());
    }

    #[test]
    fn test_first_output_orders_node_ids_numerically() {
        let outputs: Map<String, Value> = serde_json::from_value(json!({
            "10": { "images": [{ "filename": "from_ten.png" }] },
            "9": { "images": [{ "filename": "from_nine.png" }] },
            "save": { "images": [{ "filename": "named.png" }] }
        }))
        .unwrap();

        assert_eq!(first_output(&outputs, "images").unwrap().filename, "from_nine.png");

        let named_only: Map<String, Value> = serde_json::from_value(json!({
            "save": { "images": [{ "filename": "named.png" }] }
        }))
        .unwrap();
        assert_eq!(first_output(&named_only, "images").unwrap().filename, "named.png");
    }

    #[test]
    fn test_random_seed_fits_in_63_bits() {
        for _ in 0..32 {
            assert!(random_seed() <= i64::MAX as u64);
        }
    }
}
