use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::DetectBackend;
use super::types::{DetectResponse, JobState};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Fixed delay between two status queries for the same job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Maximum total time to keep polling one job. `None` polls until the
    /// job terminates or the token is cancelled.
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
        }
    }
}

impl PollConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Job finished with an embedded successful detection result.
    Done(DetectResponse),
    /// Job failed, a poll request failed, or the job finished without a
    /// usable result.
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Polls `jobs/{id}` at a fixed interval until the job reaches a terminal
/// state, the optional deadline passes, or the token is cancelled.
pub async fn poll_job<B: DetectBackend>(
    backend: &B,
    job_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> PollOutcome {
    let started = Instant::now();
    loop {
        let status = match backend.job_status(job_id).await {
            Ok(status) => status,
            Err(err) => {
                log_warn!("status request for job {job_id} failed: {err:?}");
                return PollOutcome::Failed("轮询请求异常".to_string());
            }
        };

        match status.status {
            JobState::Done => {
                return match status.result {
                    Some(result) if result.success => PollOutcome::Done(result),
                    // A done job without a successful result carries no usable
                    // detection; surface it as a failure.
                    _ => PollOutcome::Failed(
                        status
                            .message
                            .unwrap_or_else(|| "任务完成但缺少结果".to_string()),
                    ),
                };
            }
            JobState::Error => {
                return PollOutcome::Failed(
                    status.message.unwrap_or_else(|| "队列任务错误".to_string()),
                );
            }
            JobState::Queued | JobState::Running => {}
        }

        if let Some(deadline) = config.deadline {
            if started.elapsed() + config.interval >= deadline {
                log_warn!(
                    "job {job_id} still {:?} after {:?}, giving up",
                    status.status,
                    started.elapsed()
                );
                return PollOutcome::TimedOut;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = cancel.cancelled() => {
                log_info!("poll loop for job {job_id} cancelled");
                return PollOutcome::Cancelled;
            }
        }
    }
}
