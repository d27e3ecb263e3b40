use std::time::Duration;

use keeper_core::job::{JobError, JobResult};
use keeper_executors::limit_order::{
    KeeperOutcome, LimitKeeperError, LimitOrderJobData, LimitOrderRequest, OrderAction,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// One line of stdin, validated into a work item.
pub fn parse_work_item(line: &str) -> Result<LimitOrderJobData, LimitKeeperError> {
    let request: LimitOrderRequest = serde_json::from_str(line)
        .map_err(|e| LimitKeeperError::validation(format!("malformed work item: {e}")))?;
    request.try_into()
}

/// Runs `attempt` until it succeeds, fails permanently, or has been retried `max_retries`
/// times. Nack delays are honoured and cut short by `cancellation`.
pub async fn run_with_retries<T, E, F, Fut>(
    max_retries: u32,
    cancellation: &CancellationToken,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = JobResult<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0u32;
    loop {
        let (error, delay) = match attempt(retries).await {
            Ok(value) => return Ok(value),
            Err(JobError::Fail(error)) => return Err(error),
            Err(JobError::Nack { error, delay }) => (error, delay),
        };

        if retries >= max_retries || cancellation.is_cancelled() {
            return Err(error);
        }
        retries += 1;

        let delay = delay.unwrap_or(Duration::ZERO);
        tracing::info!(retry = retries, max_retries, ?delay, error = %error, "Requeueing work item");
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(error),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Runs one attempt under a child of `parent` that is cancelled once `timeout` elapses.
///
/// The attempt keeps being polled after the deadline so it can observe the cancellation and
/// unwind through its own cleanup.
pub async fn run_with_deadline<F, Fut>(
    timeout: Duration,
    parent: &CancellationToken,
    attempt: F,
) -> Fut::Output
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future,
{
    let deadline = parent.child_token();
    let attempt = attempt(deadline.clone());
    tokio::pin!(attempt);

    tokio::select! {
        biased;
        output = &mut attempt => return output,
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(?timeout, "Work item attempt hit its deadline, cancelling");
            deadline.cancel();
        }
    }
    attempt.await
}

/// Line written to stdout for every finished work item.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub action: Option<OrderAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<KeeperOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LimitKeeperError>,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        action: Option<OrderAction>,
        result: Result<KeeperOutcome, LimitKeeperError>,
    ) -> Self {
        let (outcome, error) = match result {
            Ok(outcome) => (Some(outcome), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            job_id,
            action,
            outcome,
            error,
        }
    }
}
