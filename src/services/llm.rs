use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::core::config::{Config, LLM_API_KEY_ENV};
use crate::utils::text::strip_code_blocks;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "openai" (any compatible endpoint) or "ollama"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub openai: Option<OpenAIConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    5
}
fn default_retry_delay() -> u64 {
    2
}
fn default_openai_model() -> String {
    "deepseek-ai/DeepSeek-V3".to_string()
}

const DEFAULT_OPENAI_BASE: &str = "https://api.siliconflow.cn/v1";

/// A function the model is forced to call; `parameters` is a JSON schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Returns the arguments of the forced tool call. Providers without native
    /// tool calling fall back to asking for bare JSON.
    async fn call_tool(&self, system: &str, user: &str, tool: &ToolSpec) -> Result<Value> {
        let user = format!(
            "{}\n\nRespond ONLY with a JSON object matching this schema (no prose):\n{}",
            user, tool.parameters
        );
        let raw = self.chat(system, &user).await?;
        let clean = strip_code_blocks(&raw);
        if clean.is_empty() {
            bail!("Empty response for tool {}", tool.name);
        }
        serde_json::from_str(&clean)
            .with_context(|| format!("Failed to parse {} JSON: {}", tool.name, clean))
    }
}

/// Calls `tool` and deserialises its arguments into `T`.
pub async fn call_tool_as<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
    tool: &ToolSpec,
) -> Result<T> {
    let args = llm.call_tool(system, user, tool).await?;
    serde_json::from_value(args.clone())
        .with_context(|| format!("Invalid {} arguments: {}", tool.name, args))
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            if cfg.api_key.trim().is_empty() {
                bail!(
                    "{} is required: set llm.openai.api_key in config.yml or export {}",
                    LLM_API_KEY_ENV,
                    LLM_API_KEY_ENV
                );
            }
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: ChatMessage::pair(system, user),
            stream: false,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

// --- OpenAI compatible ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_OPENAI_BASE)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn complete(&self, request_body: &OpenAIRequest) -> Result<OpenAIMessageResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("OpenAI response has no choices"))
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn pair(system: &str, user: &str) -> Vec<Self> {
        vec![
            Self { role: "system".to_string(), content: system.to_string() },
            Self { role: "user".to_string(), content: user.to_string() },
        ]
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

impl OpenAIMessageResponse {
    fn tool_arguments(&self, tool: &str) -> Result<Value> {
        let call = self
            .tool_calls
            .iter()
            .find(|c| c.function.name == tool)
            .or_else(|| self.tool_calls.first())
            .ok_or_else(|| anyhow!("No tool calls found in output for {}", tool))?;
        serde_json::from_str(&call.function.arguments)
            .with_context(|| format!("Malformed {} arguments: {}", tool, call.function.arguments))
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: ChatMessage::pair(system, user),
            tools: Vec::new(),
            tool_choice: None,
        };

        let message = self.complete(&request_body).await?;
        match message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(anyhow!("OpenAI response empty or missing content")),
        }
    }

    async fn call_tool(&self, system: &str, user: &str, tool: &ToolSpec) -> Result<Value> {
        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: ChatMessage::pair(system, user),
            tools: vec![serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })],
            tool_choice: Some(serde_json::json!({
                "type": "function",
                "function": { "name": tool.name }
            })),
        };

        let message = self.complete(&request_body).await?;
        message.tool_arguments(tool.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Once upon a time"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Once upon a time"));
        assert!(result.choices[0].message.tool_calls.is_empty());
    }

    #[test]
    fn test_openai_tool_call_arguments() {
        let json = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "extract_characters",
                            "arguments": "{\"characters\": [{\"name\": \"Knight\", \"description\": \"brave\"}]}"
                        }
                    }]
                }
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        let args = result.choices[0].message.tool_arguments("extract_characters").unwrap();
        assert_eq!(args["characters"][0]["name"], "Knight");
    }

    #[test]
    fn test_missing_tool_calls_is_an_error() {
        let json = r#"{ "choices": [{ "message": { "content": "I refuse" } }] }"#;
        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        let err = result.choices[0].message.tool_arguments("create_scenes").unwrap_err();
        assert!(err.to_string().contains("No tool calls"));
    }

    #[test]
    fn test_create_llm_requires_api_key() {
        let config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: openai\n  openai:\n    api_key: \"\"\n",
        )
        .unwrap();
        let err = create_llm(&config).unwrap_err();
        assert!(err.to_string().contains(LLM_API_KEY_ENV));
    }

    #[test]
    fn test_create_llm_unknown_provider() {
        let config: Config = serde_yaml_ng::from_str("llm:\n  provider: gemini\n").unwrap();
        assert!(create_llm(&config).is_err());
    }

    #[derive(Debug)]
    struct FencedJsonLlm;

    #[async_trait]
    impl LlmClient for FencedJsonLlm {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            assert!(user.contains("Respond ONLY with a JSON object"));
            Ok("```json\n{\"selected_loras\": [\"a\"], \"reasoning\": \"fits\"}\n```".to_string())
        }
    }

    #[tokio::test]
    async fn test_default_call_tool_parses_fenced_json() -> Result<()> {
        #[derive(Deserialize)]
        struct Selection {
            selected_loras: Vec<String>,
        }

        let tool = ToolSpec {
            name: "select_loras",
            description: "pick adapters",
            parameters: serde_json::json!({"type": "object"}),
        };
        let parsed: Selection = call_tool_as(&FencedJsonLlm, "sys", "user", &tool).await?;
        assert_eq!(parsed.selected_loras, vec!["a".to_string()]);
        Ok(())
    }
}
