//! Per-task retry loop.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::TaskRunner;
use super::{ExecutorConfig, TaskResult};
use crate::error::TasklineError;
use crate::ledger::TaskStatus;

/// Upper bound for the wait between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Wait before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
///
/// # Example
///
/// ```
/// use std::path::PathBuf;
/// use std::time::Duration;
/// use taskline::execution::retry::calculate_backoff;
///
/// let base = Duration::from_millis(500);
/// assert_eq!(calculate_backoff(base, 1), Duration::from_millis(500));
/// assert_eq!(calculate_backoff(base, 3), Duration::from_millis(2000));
/// assert_eq!(calculate_backoff(base, 20), Duration::from_secs(30));
/// ```
#[must_use]
pub fn calculate_backoff(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() || attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

enum AttemptEnd {
    /// Carries the saved transcript of a successful attempt
    Finished(crate::error::Result<Option<PathBuf>>),
    TimedOut,
    Cancelled,
}

/// Attempt `task_id` up to `1 + max_retries` times.
///
/// Each attempt gets a fresh `task_timeout`. Before every retry the task
/// goes back to `pending` and the previous error is passed to the next
/// attempt. Cancellation during an attempt or a backoff wait aborts the
/// in-flight session, resets the task to `pending` and stops retrying.
pub async fn execute_with_retry(
    runner: &TaskRunner,
    task_id: &str,
    config: &ExecutorConfig,
    cancel: &CancellationToken,
) -> TaskResult {
    let mut last_error: Option<String> = None;
    let mut attempts = 0;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = calculate_backoff(config.retry_backoff, attempt);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return cancelled(runner, task_id, attempts).await,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return cancelled(runner, task_id, attempts).await;
            }
            info!(
                "Retrying task {} (attempt {}/{})",
                task_id,
                attempt + 1,
                config.max_retries + 1
            );
            if let Err(e) = runner.reset_for_retry(task_id).await {
                warn!("Could not reset task {} for retry: {}", task_id, e);
            }
        }

        attempts = attempt + 1;
        let end = tokio::select! {
            biased;
            () = cancel.cancelled() => AttemptEnd::Cancelled,
            result = tokio::time::timeout(
                config.task_timeout,
                runner.run_task(Some(task_id), last_error.as_deref()),
            ) => match result {
                Ok(result) => AttemptEnd::Finished(result.map(|attempt| attempt.transcript)),
                Err(_) => AttemptEnd::TimedOut,
            },
        };

        match end {
            AttemptEnd::Finished(Ok(transcript)) => {
                return TaskResult::completed(task_id, attempts).with_transcript(transcript)
            }
            AttemptEnd::Finished(Err(e)) if e.is_cancelled() => {
                return cancelled(runner, task_id, attempts).await
            }
            AttemptEnd::Finished(Err(e)) => {
                warn!("Task {} attempt {} failed: {}", task_id, attempts, e);
                last_error = Some(e.to_string());
            }
            AttemptEnd::TimedOut => {
                runner.abort_inflight(task_id).await;
                let e = TasklineError::AttemptTimeout {
                    task: task_id.to_string(),
                    timeout: config.task_timeout,
                };
                warn!("{}", e);
                // The dropped attempt never wrote its terminal status.
                if let Err(mark_err) = runner
                    .ledger()
                    .update_status_async(task_id, TaskStatus::Failed)
                    .await
                {
                    warn!("Could not mark task {} failed: {}", task_id, mark_err);
                }
                last_error = Some(e.to_string());
            }
            AttemptEnd::Cancelled => {
                runner.abort_inflight(task_id).await;
                return cancelled(runner, task_id, attempts).await;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| "no attempt was made".to_string());
    warn!(
        "Task {} failed after {} attempt(s): {}",
        task_id, attempts, error
    );
    TaskResult::failed(task_id, attempts, error)
}

async fn cancelled(runner: &TaskRunner, task_id: &str, attempts: u32) -> TaskResult {
    if attempts > 0 {
        if let Err(e) = runner
            .ledger()
            .update_status_async(task_id, TaskStatus::Pending)
            .await
        {
            warn!("Could not reset cancelled task {}: {}", task_id, e);
        }
    }
    info!("Task {} cancelled", task_id);
    TaskResult::cancelled(task_id, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(calculate_backoff(base, 0), Duration::ZERO);
        assert_eq!(calculate_backoff(base, 1), Duration::from_millis(100));
        assert_eq!(calculate_backoff(base, 2), Duration::from_millis(200));
        assert_eq!(calculate_backoff(base, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped_and_disabled() {
        assert_eq!(
            calculate_backoff(Duration::from_secs(10), 3),
            MAX_BACKOFF
        );
        assert_eq!(calculate_backoff(Duration::from_secs(1), 64), MAX_BACKOFF);
        assert_eq!(calculate_backoff(Duration::ZERO, 5), Duration::ZERO);
    }
}
