use futures_util::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::task::{TaskPhase, TaskSnapshot, VideoJob, VideoPolicy, VideoTask};
use super::VideoClient;
use crate::core::config::VideoConfig;
use crate::core::io::Storage;
use crate::core::state::VideoOutcome;

/// Fans video jobs out onto tokio tasks, at most `max_concurrency` talking to the service at once.
pub struct VideoManager {
    client: Arc<dyn VideoClient>,
    storage: Arc<dyn Storage>,
    policy: VideoPolicy,
    permits: Arc<Semaphore>,
}

pub struct VideoTaskHandle {
    pub scene_name: String,
    progress: watch::Receiver<TaskSnapshot>,
    join: JoinHandle<TaskSnapshot>,
}

impl VideoTaskHandle {
    pub fn snapshot(&self) -> TaskSnapshot {
        self.progress.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.progress.borrow().completed
    }
}

impl VideoManager {
    pub fn new(client: Arc<dyn VideoClient>, storage: Arc<dyn Storage>, config: &VideoConfig) -> Self {
        Self::with_policy(client, storage, VideoPolicy::from_config(config), config.max_concurrency)
    }

    pub fn with_policy(
        client: Arc<dyn VideoClient>,
        storage: Arc<dyn Storage>,
        policy: VideoPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client,
            storage,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Starts every job immediately; jobs beyond the concurrency limit queue on the semaphore.
    pub fn spawn(&self, jobs: Vec<VideoJob>) -> Vec<VideoTaskHandle> {
        jobs.into_iter()
            .map(|job| {
                let scene_name = job.scene_name.clone();
                let (task, progress) = VideoTask::new(
                    job,
                    self.client.clone(),
                    self.storage.clone(),
                    self.policy.clone(),
                );
                let permits = self.permits.clone();
                let join = tokio::spawn(async move {
                    match permits.acquire_owned().await {
                        Ok(_permit) => task.run().await,
                        Err(e) => {
                            let mut snapshot = task.snapshot();
                            snapshot.phase = TaskPhase::Failed;
                            snapshot.completed = true;
                            snapshot.error = Some(format!("worker pool closed: {}", e));
                            snapshot
                        }
                    }
                });
                info!("🎥 Video task started for {}", scene_name);
                VideoTaskHandle {
                    scene_name,
                    progress,
                    join,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub budget: Duration,
    pub check_interval: Duration,
}

impl WaitPolicy {
    pub fn from_config(config: &VideoConfig) -> Self {
        Self {
            budget: Duration::from_secs(config.batch_timeout_minutes * 60),
            check_interval: Duration::from_secs(config.batch_check_interval_seconds.max(1)),
        }
    }
}

/// Tally of a finished (or abandoned) video batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub attempts: Vec<u32>,
    pub timed_out: bool,
    pub success: bool,
}

impl BatchReport {
    pub fn from_snapshots(snapshots: &[TaskSnapshot], timed_out: bool) -> Self {
        let total = snapshots.len();
        let completed = snapshots.iter().filter(|s| s.completed).count();
        let successful = snapshots.iter().filter(|s| s.completed && s.success).count();
        Self {
            total,
            completed,
            successful,
            failed: total - successful,
            attempts: snapshots.iter().map(|s| s.attempts).collect(),
            timed_out,
            success: !timed_out && successful == total,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.iter().sum()
    }
}

/// Waits for every task to reach a terminal state or for the budget to run out.
/// Tasks still running at the deadline keep running; they are reported from their last snapshot.
pub async fn wait_for_all(
    handles: Vec<VideoTaskHandle>,
    policy: WaitPolicy,
) -> (BatchReport, Vec<VideoOutcome>) {
    let total = handles.len();
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} videos {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    let deadline = Instant::now() + policy.budget;
    let mut timed_out = false;
    loop {
        let done = handles.iter().filter(|h| h.is_completed()).count();
        bar.set_position(done as u64);
        if done == total {
            break;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            warn!(
                "Video batch budget of {:?} exhausted with {}/{} tasks finished",
                policy.budget, done, total
            );
            break;
        }
        sleep(policy.check_interval).await;
    }

    let snapshots: Vec<TaskSnapshot> = if timed_out {
        handles.iter().map(|h| h.snapshot()).collect()
    } else {
        let last_seen = handles.iter().map(|h| h.snapshot()).collect::<Vec<_>>();
        join_all(handles.into_iter().map(|h| h.join))
            .await
            .into_iter()
            .zip(last_seen)
            .map(|(joined, mut last)| match joined {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Video task for {} panicked: {}", last.scene_name, e);
                    last.phase = TaskPhase::Failed;
                    last.completed = true;
                    last.success = false;
                    last.error = Some(e.to_string());
                    last
                }
            })
            .collect()
    };

    let report = BatchReport::from_snapshots(&snapshots, timed_out);
    let outcomes: Vec<VideoOutcome> = snapshots.into_iter().map(VideoOutcome::from).collect();
    bar.finish_with_message(format!("{} ok, {} failed", report.successful, report.failed));
    info!(
        "📊 Video batch: {}/{} succeeded, {} attempts in total",
        report.successful,
        report.total,
        report.total_attempts()
    );
    (report, outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::video::task::tests::{fast_policy, job_with_image, FakeVideoClient, Script};
    use anyhow::Result;

    fn wait_policy(budget_ms: u64) -> WaitPolicy {
        WaitPolicy {
            budget: Duration::from_millis(budget_ms),
            check_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_batch_with_one_transient_timeout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut jobs = Vec::new();
        for name in ["scene_001", "scene_002", "scene_003"] {
            jobs.push(job_with_image(dir.path(), name).await?);
        }
        let client = Arc::new(FakeVideoClient::new(vec![
            ("scene_001", vec![Script::Succeed]),
            ("scene_002", vec![Script::Stall, Script::Succeed]),
            ("scene_003", vec![Script::Succeed]),
        ]));
        let manager = VideoManager::with_policy(client.clone(), Arc::new(NativeStorage::new()), fast_policy(), 4);

        let handles = manager.spawn(jobs);
        assert_eq!(handles.len(), 3);
        let (report, outcomes) = wait_for_all(handles, wait_policy(5_000)).await;

        assert!(report.success);
        assert!(!report.timed_out);
        assert_eq!(report.successful, 3);
        assert_eq!(report.attempts, vec![1, 2, 1]);
        assert_eq!(report.total_attempts(), 4);
        assert_eq!(client.submissions("scene_002"), 2);
        assert!(outcomes.iter().all(|o| o.success));
        for name in ["scene_001", "scene_002", "scene_003"] {
            assert!(dir.path().join(format!("{}.mp4", name)).exists());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_cancel_siblings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let jobs = vec![
            job_with_image(dir.path(), "scene_001").await?,
            job_with_image(dir.path(), "scene_002").await?,
        ];
        let client = Arc::new(FakeVideoClient::new(vec![
            ("scene_001", vec![Script::Fail("content rejected")]),
            ("scene_002", vec![Script::Succeed]),
        ]));
        let manager = VideoManager::with_policy(client, Arc::new(NativeStorage::new()), fast_policy(), 1);

        let (report, outcomes) = wait_for_all(manager.spawn(jobs), wait_policy(5_000)).await;

        assert!(!report.success);
        assert_eq!(report.completed, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap_or("").contains("content rejected"));
        assert!(outcomes[1].success);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_budget_exhausted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let jobs = vec![job_with_image(dir.path(), "scene_001").await?];
        let client = Arc::new(FakeVideoClient::new(vec![("scene_001", vec![Script::Stall])]));
        let manager = VideoManager::with_policy(client, Arc::new(NativeStorage::new()), fast_policy(), 1);

        let (report, outcomes) = wait_for_all(manager.spawn(jobs), wait_policy(20)).await;

        assert!(report.timed_out);
        assert!(!report.success);
        assert_eq!(report.successful, 0);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_batch_is_successful() {
        let (report, outcomes) = wait_for_all(Vec::new(), wait_policy(10)).await;
        assert!(report.success);
        assert_eq!(report.total, 0);
        assert!(outcomes.is_empty());
    }
}
