use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::services::llm::LlmConfig;

/// Results that can be "present but useless", such as a blank string or an
/// empty list. Those count as failed attempts.
pub trait Substantive {
    fn is_substantive(&self) -> bool;
}

impl Substantive for String {
    fn is_substantive(&self) -> bool {
        !self.trim().is_empty()
    }
}

impl<T> Substantive for Vec<T> {
    fn is_substantive(&self) -> bool {
        !self.is_empty()
    }
}

/// Runs generation steps with a retry budget shared by every step of one run.
/// When the budget is spent, later steps go straight to their fallback.
#[derive(Debug)]
pub struct RetryExecutor {
    max_retries: usize,
    delay: Duration,
    used: AtomicUsize,
}

impl RetryExecutor {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            used: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            config.retry_count,
            Duration::from_secs(config.retry_delay_seconds),
        )
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub async fn run<T, F, Fut, FB>(&self, operation: &str, mut primary: F, fallback: FB) -> Result<T>
    where
        T: Substantive,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        if self.used() >= self.max_retries {
            warn!(
                "{}: retry budget already exhausted ({}/{}), using fallback",
                operation,
                self.used(),
                self.max_retries
            );
        }

        while self.used() < self.max_retries {
            let error = match primary().await {
                Ok(value) if value.is_substantive() => return Ok(value),
                Ok(_) => anyhow!("{} returned an empty result", operation),
                Err(e) => e,
            };

            let used = self.used.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "{} failed (attempt {}/{}): {:#}",
                operation, used, self.max_retries, error
            );
            if used >= self.max_retries {
                break;
            }
            info!("Retrying {} in {:?}", operation, self.delay);
            tokio::time::sleep(self.delay).await;
        }

        warn!("{}: using fallback", operation);
        fallback().with_context(|| format!("Fallback for {} failed", operation))
    }
}
