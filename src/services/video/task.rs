use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use super::{VideoClient, VideoRequest, VideoState};
use crate::core::config::VideoConfig;
use crate::core::io::Storage;
use crate::core::state::VideoOutcome;

const TRANSIENT_KEYWORDS: &[&str] = &[
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "connection",
    "network",
    "timeout",
    "requestexception",
];

pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Debug, Clone)]
pub struct VideoPolicy {
    pub model: String,
    pub image_size: String,
    pub check_interval: Duration,
    pub max_wait: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl VideoPolicy {
    pub fn from_config(config: &VideoConfig) -> Self {
        Self {
            model: config.model.clone(),
            image_size: config.image_size.clone(),
            check_interval: Duration::from_secs(config.check_interval_seconds),
            max_wait: Duration::from_secs(config.max_wait_seconds),
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_secs(config.retry_delay_seconds),
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Submission(String),
    MissingResult,
    Download(String),
    TimedOut(Duration),
    Remote(String),
    Error(String),
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Submission(_)
            | FailureKind::MissingResult
            | FailureKind::Download(_)
            | FailureKind::TimedOut(_) => true,
            FailureKind::Remote(msg) | FailureKind::Error(msg) => is_transient(msg),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Submission(msg) => write!(f, "submission failed: {}", msg),
            FailureKind::MissingResult => write!(f, "status Succeed but no video url in result"),
            FailureKind::Download(msg) => write!(f, "download failed: {}", msg),
            FailureKind::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs_f64()),
            FailureKind::Remote(reason) => write!(f, "generation failed: {}", reason),
            FailureKind::Error(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Created,
    Submitted,
    Polling,
    Downloading,
    Retrying,
    Succeeded,
    Failed,
}

/// Everything needed to turn one scene image into one clip.
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub scene_name: String,
    pub image_path: String,
    pub output_path: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub scene_name: String,
    pub image_path: String,
    pub output_path: String,
    pub request_id: Option<String>,
    pub attempts: u32,
    pub phase: TaskPhase,
    pub completed: bool,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskSnapshot {
    pub fn new(job: &VideoJob) -> Self {
        Self {
            scene_name: job.scene_name.clone(),
            image_path: job.image_path.clone(),
            output_path: job.output_path.clone(),
            request_id: None,
            attempts: 0,
            phase: TaskPhase::Created,
            completed: false,
            success: false,
            error: None,
        }
    }
}

impl From<TaskSnapshot> for VideoOutcome {
    fn from(s: TaskSnapshot) -> Self {
        let error = if s.completed {
            s.error
        } else {
            Some(s.error.unwrap_or_else(|| "did not finish before the batch deadline".to_string()))
        };
        Self {
            scene_name: s.scene_name,
            image_path: s.image_path,
            output_path: s.output_path,
            request_id: s.request_id,
            attempts: s.attempts,
            success: s.completed && s.success,
            error,
        }
    }
}

/// One scene's submit, poll, download cycle with bounded retries.
/// Progress is published on a watch channel so the batch waiter never touches task state.
pub struct VideoTask {
    job: VideoJob,
    client: Arc<dyn VideoClient>,
    storage: Arc<dyn Storage>,
    policy: VideoPolicy,
    progress: watch::Sender<TaskSnapshot>,
}

impl VideoTask {
    pub fn new(
        job: VideoJob,
        client: Arc<dyn VideoClient>,
        storage: Arc<dyn Storage>,
        policy: VideoPolicy,
    ) -> (Self, watch::Receiver<TaskSnapshot>) {
        let (progress, rx) = watch::channel(TaskSnapshot::new(&job));
        (
            Self {
                job,
                client,
                storage,
                policy,
                progress,
            },
            rx,
        )
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.progress.borrow().clone()
    }

    pub async fn run(self) -> TaskSnapshot {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.progress.send_modify(|s| {
                s.attempts = attempt;
                s.request_id = None;
                s.phase = TaskPhase::Submitted;
            });

            match self.attempt_once().await {
                Ok(()) => {
                    info!(
                        "🎬 {} finished on attempt {} -> {}",
                        self.job.scene_name, attempt, self.job.output_path
                    );
                    self.progress.send_modify(|s| {
                        s.phase = TaskPhase::Succeeded;
                        s.completed = true;
                        s.success = true;
                        s.error = None;
                    });
                    break;
                }
                Err(failure) => {
                    let message = failure.to_string();
                    let request_id = self.snapshot().request_id.unwrap_or_else(|| "-".to_string());
                    if failure.is_retryable() && attempt < self.policy.max_attempts {
                        let delay = self.policy.backoff(attempt);
                        warn!(
                            "{} attempt {}/{} failed (request {}): {}. Retrying in {:?}",
                            self.job.scene_name, attempt, self.policy.max_attempts, request_id, message, delay
                        );
                        self.progress.send_modify(|s| {
                            s.phase = TaskPhase::Retrying;
                            s.error = Some(message);
                        });
                        sleep(delay).await;
                    } else {
                        error!(
                            "{} gave up after {} attempt(s) (request {}): {}",
                            self.job.scene_name, attempt, request_id, message
                        );
                        self.progress.send_modify(|s| {
                            s.phase = TaskPhase::Failed;
                            s.completed = true;
                            s.success = false;
                            s.error = Some(message);
                        });
                        break;
                    }
                }
            }
        }
        self.snapshot()
    }

    async fn attempt_once(&self) -> std::result::Result<(), FailureKind> {
        let image = self
            .storage
            .read(&self.job.image_path)
            .await
            .map_err(|e| FailureKind::Error(format!("{:#}", e)))?;

        let request = VideoRequest {
            model: self.policy.model.clone(),
            prompt: self.job.prompt.clone(),
            negative_prompt: self.job.negative_prompt.clone(),
            image_size: self.policy.image_size.clone(),
            image: format!("data:image/png;base64,{}", STANDARD.encode(&image)),
            seed: None,
        };

        let request_id = self
            .client
            .submit(&request)
            .await
            .map_err(|e| FailureKind::Submission(format!("{:#}", e)))?;
        info!("{} submitted as request {}", self.job.scene_name, request_id);
        self.progress.send_modify(|s| {
            s.request_id = Some(request_id.clone());
            s.phase = TaskPhase::Polling;
        });

        let url = self.poll(&request_id).await?;

        self.progress.send_modify(|s| s.phase = TaskPhase::Downloading);
        let bytes = self
            .client
            .download(&url)
            .await
            .map_err(|e| FailureKind::Download(format!("{:#}", e)))?;
        self.write_output(&bytes)
            .await
            .map_err(|e| FailureKind::Download(format!("{:#}", e)))
    }

    async fn poll(&self, request_id: &str) -> std::result::Result<String, FailureKind> {
        let started = Instant::now();
        loop {
            let status = self
                .client
                .status(request_id)
                .await
                .map_err(|e| FailureKind::Error(format!("{:#}", e)))?;
            match status.state {
                VideoState::Succeed => return status.video_url.ok_or(FailureKind::MissingResult),
                VideoState::Failed => {
                    return Err(FailureKind::Remote(
                        status.reason.unwrap_or_else(|| "unknown reason".to_string()),
                    ))
                }
                VideoState::InQueue | VideoState::InProgress => {}
            }
            if started.elapsed() >= self.policy.max_wait {
                return Err(FailureKind::TimedOut(self.policy.max_wait));
            }
            sleep(self.policy.check_interval).await;
        }
    }

    async fn write_output(&self, bytes: &[u8]) -> Result<()> {
        self.storage.write(&self.job.output_path, bytes).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::video::VideoStatus;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// What the fake service does for the n-th submission of an image.
    #[derive(Clone)]
    pub(crate) enum Script {
        Succeed,
        Stall,
        Fail(&'static str),
        SucceedWithoutUrl,
        RejectSubmit,
    }

    /// Scripted video service keyed by the prompt text of each job.
    pub(crate) struct FakeVideoClient {
        scripts: HashMap<String, Vec<Script>>,
        submissions: Mutex<HashMap<String, usize>>,
        requests: Mutex<HashMap<String, Script>>,
        next_id: Mutex<usize>,
    }

    impl FakeVideoClient {
        pub(crate) fn new(scripts: Vec<(&str, Vec<Script>)>) -> Self {
            Self {
                scripts: scripts.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                submissions: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
            }
        }

        pub(crate) fn submissions(&self, prompt: &str) -> usize {
            self.submissions.lock().unwrap().get(prompt).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl VideoClient for FakeVideoClient {
        async fn submit(&self, request: &VideoRequest) -> Result<String> {
            assert!(request.image.starts_with("data:image/png;base64,"));
            let n = {
                let mut subs = self.submissions.lock().unwrap();
                let n = subs.entry(request.prompt.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let plan = self.scripts.get(&request.prompt).cloned().unwrap_or_default();
            let script = plan.get(n - 1).or(plan.last()).cloned().unwrap_or(Script::Succeed);
            if matches!(script, Script::RejectSubmit) {
                return Err(anyhow!("submit rejected"));
            }
            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("req-{}", next)
            };
            self.requests.lock().unwrap().insert(id.clone(), script);
            Ok(id)
        }

        async fn status(&self, request_id: &str) -> Result<VideoStatus> {
            let script = self.requests.lock().unwrap().get(request_id).cloned();
            let status = match script {
                Some(Script::Succeed) => VideoStatus {
                    state: VideoState::Succeed,
                    reason: None,
                    video_url: Some(format!("https://cdn.test/{}.mp4", request_id)),
                },
                Some(Script::SucceedWithoutUrl) => VideoStatus {
                    state: VideoState::Succeed,
                    reason: None,
                    video_url: None,
                },
                Some(Script::Fail(reason)) => VideoStatus {
                    state: VideoState::Failed,
                    reason: Some(reason.to_string()),
                    video_url: None,
                },
                _ => VideoStatus {
                    state: VideoState::InProgress,
                    reason: None,
                    video_url: None,
                },
            };
            Ok(status)
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>> {
            Ok(url.as_bytes().to_vec())
        }
    }

    pub(crate) fn fast_policy() -> VideoPolicy {
        VideoPolicy {
            model: "test-model".to_string(),
            image_size: "1280x720".to_string(),
            check_interval: Duration::from_millis(5),
            max_wait: Duration::from_millis(60),
            max_attempts: 3,
            retry_base: Duration::from_millis(5),
        }
    }

    pub(crate) async fn job_with_image(dir: &std::path::Path, name: &str) -> Result<VideoJob> {
        let image_path = dir.join(format!("{}.png", name)).to_string_lossy().to_string();
        NativeStorage::new().write(&image_path, b"png-bytes").await?;
        Ok(VideoJob {
            scene_name: name.to_string(),
            image_path,
            output_path: dir.join(format!("{}.mp4", name)).to_string_lossy().to_string(),
            prompt: name.to_string(),
            negative_prompt: None,
        })
    }

    async fn run_single(
        script: Vec<Script>,
    ) -> Result<(TaskSnapshot, Arc<FakeVideoClient>, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let job = job_with_image(dir.path(), "scene_001").await?;
        let client = Arc::new(FakeVideoClient::new(vec![("scene_001", script)]));
        let (task, _rx) = VideoTask::new(job, client.clone(), Arc::new(NativeStorage::new()), fast_policy());
        let snapshot = task.run().await;
        Ok((snapshot, client, dir))
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("502 Bad Gateway"));
        assert!(is_transient("Connection reset by peer"));
        assert!(is_transient("upstream GATEWAY TIMEOUT"));
        assert!(!is_transient("content policy violation"));

        assert!(FailureKind::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(FailureKind::MissingResult.is_retryable());
        assert!(FailureKind::Remote("503 Service Unavailable".into()).is_retryable());
        assert!(!FailureKind::Remote("invalid image".into()).is_retryable());
        assert!(!FailureKind::Error("No such file".into()).is_retryable());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = VideoPolicy {
            retry_base: Duration::from_secs(5),
            ..fast_policy()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_success_writes_output() -> Result<()> {
        let (snapshot, client, dir) = run_single(vec![Script::Succeed]).await?;
        assert!(snapshot.completed && snapshot.success);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(snapshot.phase, TaskPhase::Succeeded);
        assert_eq!(snapshot.request_id.as_deref(), Some("req-1"));
        assert_eq!(client.submissions("scene_001"), 1);
        let written = std::fs::read(dir.path().join("scene_001.mp4"))?;
        assert_eq!(written, b"https://cdn.test/req-1.mp4");
        Ok(())
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_terminal() -> Result<()> {
        let (snapshot, client, _) = run_single(vec![Script::Fail("invalid image content")]).await?;
        assert!(snapshot.completed);
        assert!(!snapshot.success);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(client.submissions("scene_001"), 1);
        assert!(snapshot.error.unwrap().contains("invalid image content"));
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() -> Result<()> {
        let (snapshot, client, _) = run_single(vec![Script::Fail("504 Gateway Timeout")]).await?;
        assert!(snapshot.completed);
        assert!(!snapshot.success);
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(client.submissions("scene_001"), 3);
        assert_eq!(snapshot.phase, TaskPhase::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_succeed_without_url_is_retried() -> Result<()> {
        let (snapshot, _, _) =
            run_single(vec![Script::SucceedWithoutUrl, Script::Succeed]).await?;
        assert!(snapshot.success);
        assert_eq!(snapshot.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_then_success() -> Result<()> {
        let (snapshot, client, _) = run_single(vec![Script::Stall, Script::Succeed]).await?;
        assert!(snapshot.success);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(client.submissions("scene_001"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_submission_is_retried() -> Result<()> {
        let (snapshot, _, _) = run_single(vec![Script::RejectSubmit, Script::Succeed]).await?;
        assert!(snapshot.success);
        assert_eq!(snapshot.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_image_is_terminal() -> Result<()> {
        let job = VideoJob {
            scene_name: "scene_009".to_string(),
            image_path: "/nonexistent/kgen/missing.png".to_string(),
            output_path: "/nonexistent/kgen/scene_009.mp4".to_string(),
            prompt: "scene_009".to_string(),
            negative_prompt: None,
        };
        let client = Arc::new(FakeVideoClient::new(vec![]));
        let (task, _rx) = VideoTask::new(job, client.clone(), Arc::new(NativeStorage::new()), fast_policy());
        let snapshot = task.run().await;
        assert!(snapshot.completed && !snapshot.success);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(client.submissions("scene_009"), 0);
        Ok(())
    }
}
