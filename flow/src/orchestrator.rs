//! The durable-step runtime: every side-effecting operation runs as an
//! activity with a timeout, heartbeat supervision and retry with
//! exponential backoff. Workflow code stays free of direct I/O and owns
//! only orchestration state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Heartbeats an activity may miss before its attempt is considered lost
/// and re-scheduled.
const MAX_MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_interval
            .as_millis() as f64
            * self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.maximum_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            ..Default::default()
        }
    }

    pub fn with_heartbeat(timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            heartbeat_timeout: Some(heartbeat),
            retry_policy: RetryPolicy::default(),
        }
    }
}

pub use model::FlowError;

#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("activity timed out after {0:?}")]
    Timeout(Duration),
    #[error("activity lost after missing {0} heartbeats")]
    HeartbeatLost(u32),
    #[error("activity cancelled")]
    Cancelled,
    #[error("activity failed permanently: {0:#}")]
    NonRetryable(#[source] anyhow::Error),
    #[error("activity failed after {attempts} attempts: {source:#}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl ActivityError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActivityError::Cancelled)
    }
}

/// Handle an activity body uses to prove liveness and observe
/// cancellation. Connectors roll back open work when the token fires.
#[derive(Clone)]
pub struct ActivityContext {
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl ActivityContext {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            cancel,
        }
    }

    pub fn record_heartbeat(&self, details: &str) {
        trace!("heartbeat: {}", details);
        *self.last_heartbeat.lock().expect("heartbeat lock poisoned") = Instant::now();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().expect("heartbeat lock poisoned")
    }
}

/// A background task heartbeating on behalf of a long-running activity
/// body, stopped when the guard drops.
pub struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn heartbeat_routine(
    ctx: &ActivityContext,
    interval: Duration,
    message: impl Fn() -> String + Send + 'static,
) -> HeartbeatGuard {
    let ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            ctx.record_heartbeat(&message());
        }
    });
    HeartbeatGuard { handle }
}

/// Run an activity body under the runtime's supervision. The closure is
/// invoked once per attempt; permanent failures (`FlowError`) short
/// circuit the retry loop.
pub async fn execute_activity<T, F, Fut>(
    options: ActivityOptions,
    cancel: &CancellationToken,
    body: F,
) -> Result<T, ActivityError>
where
    F: Fn(ActivityContext) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let attempt_cancel = cancel.child_token();
        let ctx = ActivityContext::new(attempt_cancel.clone());

        let outcome = run_attempt(&options, &ctx, body(ctx.clone())).await;
        match outcome {
            AttemptOutcome::Ok(value) => return Ok(value),
            AttemptOutcome::Cancelled => return Err(ActivityError::Cancelled),
            AttemptOutcome::Failed(err) => {
                if err.downcast_ref::<FlowError>().is_some() {
                    return Err(ActivityError::NonRetryable(err));
                }
                if attempt >= options.retry_policy.maximum_attempts {
                    return Err(ActivityError::RetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                let backoff = with_jitter(options.retry_policy.backoff_for_attempt(attempt));
                warn!(
                    "activity attempt {} failed, retrying in {:?}: {:#}",
                    attempt, backoff, err
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            AttemptOutcome::TimedOut => {
                attempt_cancel.cancel();
                if attempt >= options.retry_policy.maximum_attempts {
                    return Err(ActivityError::Timeout(options.start_to_close_timeout));
                }
                warn!("activity attempt {} timed out, retrying", attempt);
            }
            AttemptOutcome::HeartbeatLost => {
                attempt_cancel.cancel();
                if attempt >= options.retry_policy.maximum_attempts {
                    return Err(ActivityError::HeartbeatLost(MAX_MISSED_HEARTBEATS));
                }
                warn!("activity attempt {} lost (missed heartbeats), re-scheduling", attempt);
            }
        }
    }
}

enum AttemptOutcome<T> {
    Ok(T),
    Failed(anyhow::Error),
    TimedOut,
    HeartbeatLost,
    Cancelled,
}

async fn run_attempt<T, Fut>(
    options: &ActivityOptions,
    ctx: &ActivityContext,
    fut: Fut,
) -> AttemptOutcome<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let watchdog = heartbeat_watchdog(options.heartbeat_timeout, ctx);
    tokio::pin!(fut);
    tokio::pin!(watchdog);

    tokio::select! {
        result = &mut fut => match result {
            Ok(value) => AttemptOutcome::Ok(value),
            Err(err) => AttemptOutcome::Failed(err),
        },
        _ = tokio::time::sleep(options.start_to_close_timeout) => AttemptOutcome::TimedOut,
        _ = &mut watchdog => AttemptOutcome::HeartbeatLost,
        _ = ctx.cancel.cancelled() => AttemptOutcome::Cancelled,
    }
}

async fn heartbeat_watchdog(heartbeat_timeout: Option<Duration>, ctx: &ActivityContext) {
    match heartbeat_timeout {
        // no heartbeat requirement, never fires
        None => std::future::pending::<()>().await,
        Some(timeout) => {
            let limit = timeout * MAX_MISSED_HEARTBEATS;
            loop {
                tokio::time::sleep(timeout).await;
                if ctx.last_heartbeat().elapsed() > limit {
                    return;
                }
            }
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_attempts: u32) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: Duration::from_millis(200),
            heartbeat_timeout: None,
            retry_policy: RetryPolicy {
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 2.0,
                maximum_interval: Duration::from_millis(10),
                maximum_attempts: max_attempts,
            },
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = execute_activity(fast_options(5), &cancel, |_ctx| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("flaky"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = execute_activity(fast_options(3), &cancel, |_ctx| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("always broken"))
        })
        .await;
        assert!(matches!(
            result,
            Err(ActivityError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_precondition_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = execute_activity(fast_options(5), &cancel, |_ctx| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::FailedPrecondition("schema drift".to_owned()).into())
        })
        .await;
        assert!(matches!(result, Err(ActivityError::NonRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_activity() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = execute_activity(fast_options(5), &cancel, |ctx| async move {
            ctx.cancellation_token().cancelled().await;
            Err(anyhow::anyhow!("unreachable"))
        })
        .await;
        assert!(matches!(result, Err(ActivityError::Cancelled)));
    }

    #[tokio::test]
    async fn missed_heartbeats_reschedule_the_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let options = ActivityOptions {
            start_to_close_timeout: Duration::from_secs(5),
            heartbeat_timeout: Some(Duration::from_millis(10)),
            retry_policy: RetryPolicy {
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 1.0,
                maximum_interval: Duration::from_millis(1),
                maximum_attempts: 2,
            },
        };
        let calls_ref = &calls;
        let result: Result<(), _> = execute_activity(options, &cancel, |ctx| async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // never heartbeat, get declared lost
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            } else {
                ctx.record_heartbeat("alive");
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(5),
            maximum_attempts: 10,
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_secs(5));
    }
}
