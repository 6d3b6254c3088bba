pub mod client;
pub mod manager;
pub mod prompt;
pub mod task;

pub use client::{create_video_client, SiliconFlowClient};
pub use manager::{wait_for_all, BatchReport, VideoManager, VideoTaskHandle, WaitPolicy};
pub use prompt::{build_video_negative, build_video_prompt};
pub use task::{is_transient, FailureKind, TaskPhase, TaskSnapshot, VideoJob, VideoPolicy, VideoTask};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct VideoRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub image_size: String,
    /// `data:image/png;base64,...`
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VideoState {
    InQueue,
    InProgress,
    Succeed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct VideoStatus {
    pub state: VideoState,
    pub reason: Option<String>,
    pub video_url: Option<String>,
}

/// Remote image-to-video service: submit, poll, download.
#[async_trait]
pub trait VideoClient: Send + Sync {
    async fn submit(&self, request: &VideoRequest) -> Result<String>;
    async fn status(&self, request_id: &str) -> Result<VideoStatus>;
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}
