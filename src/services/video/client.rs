use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{VideoClient, VideoRequest, VideoState, VideoStatus};
use crate::core::config::{VideoConfig, VIDEO_API_KEY_ENV};

const STATUS_RETRIES: u32 = 3;
const STATUS_RETRY_BASE: Duration = Duration::from_secs(2);

pub fn create_video_client(config: &VideoConfig) -> Result<Arc<dyn VideoClient>> {
    if config.api_key.trim().is_empty() {
        bail!(
            "{} is required for video generation: set video.api_key in config.yml or export {}",
            VIDEO_API_KEY_ENV,
            VIDEO_API_KEY_ENV
        );
    }
    Ok(Arc::new(SiliconFlowClient::new(&config.api_key, &config.base_url)))
}

#[derive(Debug)]
pub struct SiliconFlowClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl SiliconFlowClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn status_once(&self, request_id: &str) -> std::result::Result<StatusResponse, StatusError> {
        let resp = self
            .client
            .post(format!("{}/video/status", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "requestId": request_id }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    StatusError::Transient(format!("Connection error: {}", e))
                } else {
                    StatusError::Fatal(anyhow!(e))
                }
            })?;

        let status = resp.status();
        if matches!(status.as_u16(), 502 | 503 | 504) {
            return Err(StatusError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StatusError::Fatal(anyhow!("SiliconFlow API error ({}): {}", status, text)));
        }
        resp.json::<StatusResponse>()
            .await
            .map_err(|e| StatusError::Fatal(anyhow!("Malformed status response: {}", e)))
    }
}

enum StatusError {
    Transient(String),
    Fatal(anyhow::Error),
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "requestId")]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: VideoState,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    results: Option<StatusResults>,
}

#[derive(Deserialize)]
struct StatusResults {
    #[serde(default)]
    videos: Vec<VideoLink>,
}

#[derive(Deserialize)]
struct VideoLink {
    url: String,
}

impl From<StatusResponse> for VideoStatus {
    fn from(r: StatusResponse) -> Self {
        Self {
            state: r.status,
            reason: r.reason.filter(|s| !s.is_empty()),
            video_url: r
                .results
                .and_then(|res| res.videos.into_iter().next())
                .map(|v| v.url)
                .filter(|u| !u.is_empty()),
        }
    }
}

#[async_trait]
impl VideoClient for SiliconFlowClient {
    async fn submit(&self, request: &VideoRequest) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/video/submit", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .context("Failed to submit video request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("SiliconFlow API error ({}): {}", status, error_text));
        }

        let body: SubmitResponse = resp.json().await?;
        body.request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("SiliconFlow submit response has no requestId"))
    }

    async fn status(&self, request_id: &str) -> Result<VideoStatus> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.status_once(request_id).await {
                Ok(r) => return Ok(r.into()),
                Err(StatusError::Fatal(e)) => return Err(e),
                Err(StatusError::Transient(msg)) if attempt < STATUS_RETRIES => {
                    let delay = STATUS_RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(
                        "Status check for {} failed ({}), retrying in {:?} ({}/{})",
                        request_id, msg, delay, attempt, STATUS_RETRIES
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StatusError::Transient(msg)) => {
                    bail!("Status check for {} failed after {} attempts: {}", request_id, attempt, msg)
                }
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await.context("Failed to download video")?;
        if !resp.status().is_success() {
            bail!("Video download failed: HTTP {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_success() {
        let json = r#"{
            "status": "Succeed",
            "reason": "",
            "results": {
                "videos": [{ "url": "https://cdn.example/v.mp4" }],
                "timings": { "inference": 120 },
                "seed": 123
            }
        }"#;
        let status: VideoStatus = serde_json::from_str::<StatusResponse>(json).unwrap().into();
        assert_eq!(status.state, VideoState::Succeed);
        assert_eq!(status.video_url.as_deref(), Some("https://cdn.example/v.mp4"));
        assert!(status.reason.is_none());
    }

    #[test]
    fn test_status_parsing_in_progress_and_failed() {
        let queued: VideoStatus =
            serde_json::from_str::<StatusResponse>(r#"{"status": "InQueue"}"#).unwrap().into();
        assert_eq!(queued.state, VideoState::InQueue);
        assert!(queued.video_url.is_none());

        let failed: VideoStatus = serde_json::from_str::<StatusResponse>(
            r#"{"status": "Failed", "reason": "504 Gateway Timeout"}"#,
        )
        .unwrap()
        .into();
        assert_eq!(failed.state, VideoState::Failed);
        assert_eq!(failed.reason.as_deref(), Some("504 Gateway Timeout"));
    }

    #[test]
    fn test_succeed_without_videos_has_no_url() {
        let status: VideoStatus =
            serde_json::from_str::<StatusResponse>(r#"{"status": "Succeed", "results": {"videos": []}}"#)
                .unwrap()
                .into();
        assert!(status.video_url.is_none());
    }

    #[test]
    fn test_submit_response_and_request_shape() {
        let body: SubmitResponse = serde_json::from_str(r#"{"requestId": "abc-123"}"#).unwrap();
        assert_eq!(body.request_id.as_deref(), Some("abc-123"));

        let request = VideoRequest {
            model: "Wan-AI/Wan2.1-I2V-14B-720P".to_string(),
            prompt: "static scene".to_string(),
            negative_prompt: None,
            image_size: "1280x720".to_string(),
            image: "data:image/png;base64,AAAA".to_string(),
            seed: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("negative_prompt").is_none());
        assert_eq!(value["image_size"], "1280x720");
    }

    #[test]
    fn test_missing_key_is_a_configuration_error() {
        let err = create_video_client(&VideoConfig::default()).err().unwrap();
        assert!(err.to_string().contains(VIDEO_API_KEY_ENV));
    }
}
