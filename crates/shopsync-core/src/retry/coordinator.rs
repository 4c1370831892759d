//! Retry coordinator
//!
//! Runs an async unit of work under a [`RetryConfig`], driving an explicit
//! phase machine:
//!
//! ```text
//! Attempting(n) --ok--------------------------> Succeeded
//!      |  \--err, not retryable---------------> Aborted
//!      |   \-err, n == max_attempts-----------> Exhausted
//!      \--err, retryable--> BackingOff(n+1) --> Attempting(n+1)
//!                               \--cancel-----> Cancelled
//! ```
//!
//! Finished sessions are kept in a rolling history that feeds metrics and is
//! persisted to disk when a path is configured.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::policy::{next_delay, RetryConfig, RetryStrategy};
use crate::error::{RetryReason, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::storage::fs::{read_json, write_json};

/// Sessions kept in the rolling history
pub const HISTORY_CAPACITY: usize = 100;

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub reason: RetryReason,
    pub error: String,
    /// Delay applied before the next attempt, zero when none followed
    pub delay: Duration,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded,
    /// Retryable failures until `max_attempts`
    Exhausted,
    /// Stopped on a non-retryable error
    Aborted,
    Cancelled,
}

/// Record of one `execute_with_retry` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySession {
    pub id: String,
    pub label: String,
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
    /// Total attempts made, successful one included
    pub attempt_count: u32,
    pub current_delay: Duration,
    pub outcome: SessionOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Terminal result of a retried call
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    Exhausted(SyncError),
    Aborted(SyncError),
    /// Cancelled through the token; distinct from failure
    Cancelled,
}

/// Result of `execute_with_retry`
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: RetryOutcome<T>,
    pub attempts: u32,
    pub duration: Duration,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RetryOutcome::Succeeded(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, RetryOutcome::Cancelled)
    }

    /// Collapse into a plain result, cancellation becoming [`SyncError::Cancelled`]
    pub fn into_result(self) -> SyncResult<T> {
        match self.outcome {
            RetryOutcome::Succeeded(value) => Ok(value),
            RetryOutcome::Exhausted(err) | RetryOutcome::Aborted(err) => Err(err),
            RetryOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }
}

/// Aggregate metrics across sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetrics {
    pub total_executions: u64,
    pub successes: u64,
    pub exhausted: u64,
    pub aborted: u64,
    pub cancelled: u64,
    /// Sum of attempt counts over successful sessions
    pub attempts_to_success: u64,
}

impl RetryMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total_executions as f64
    }

    pub fn average_attempts_to_success(&self) -> f64 {
        if self.successes == 0 {
            return 0.0;
        }
        self.attempts_to_success as f64 / self.successes as f64
    }

    fn record(&mut self, session: &RetrySession) {
        self.total_executions += 1;
        match session.outcome {
            SessionOutcome::Succeeded => {
                self.successes += 1;
                self.attempts_to_success += session.attempt_count as u64;
            }
            SessionOutcome::Exhausted => self.exhausted += 1,
            SessionOutcome::Aborted => self.aborted += 1,
            SessionOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    history: VecDeque<RetrySession>,
    metrics: RetryMetrics,
}

enum Phase {
    Attempting(u32),
    BackingOff { next: u32, delay: Duration },
}

/// Executes work under retry policies and keeps their history
#[derive(Debug)]
pub struct RetryCoordinator {
    events: EventBus,
    history_path: Option<PathBuf>,
    state: Mutex<CoordinatorState>,
}

impl RetryCoordinator {
    /// Create a coordinator with in-memory history only
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            history_path: None,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Create a coordinator persisting its history at `path`
    ///
    /// Existing history is loaded; an unreadable file is logged and ignored.
    pub fn with_history(events: EventBus, path: PathBuf) -> Self {
        let mut state = CoordinatorState::default();
        match read_json::<Vec<RetrySession>>(&path) {
            Ok(Some(sessions)) => {
                for session in sessions.into_iter().rev().take(HISTORY_CAPACITY).rev() {
                    state.metrics.record(&session);
                    state.history.push_back(session);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable retry history: {}", e),
        }

        Self {
            events,
            history_path: Some(path),
            state: Mutex::new(state),
        }
    }

    /// Run `operation` until it succeeds, fails terminally, exhausts its
    /// attempts, or `cancel` fires
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        label: &str,
        config: &RetryConfig,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let started = Instant::now();
        let started_at = Utc::now();
        let max_attempts = config.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt_count = 0;
        let mut current_delay = Duration::ZERO;
        let mut phase = Phase::Attempting(1);

        let outcome = loop {
            match phase {
                Phase::Attempting(n) => {
                    if cancel.is_cancelled() {
                        break RetryOutcome::Cancelled;
                    }
                    attempt_count = n;

                    let call = run_attempt(operation(), config.attempt_timeout);
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break RetryOutcome::Cancelled,
                        result = call => result,
                    };

                    let error = match result {
                        Ok(value) => break RetryOutcome::Succeeded(value),
                        Err(error) => error,
                    };

                    let reason = error.reason();
                    let mut record = AttemptRecord {
                        attempt: n,
                        at: Utc::now(),
                        reason,
                        error: error.to_string(),
                        delay: Duration::ZERO,
                    };

                    if !config.should_retry(&error) {
                        debug!("{}: attempt {} failed terminally: {}", label, n, error);
                        attempts.push(record);
                        break RetryOutcome::Aborted(error);
                    }
                    if n >= max_attempts {
                        attempts.push(record);
                        break RetryOutcome::Exhausted(error);
                    }

                    let delay = next_delay(config, n, &error);
                    record.delay = delay;
                    attempts.push(record);
                    current_delay = delay;

                    debug!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, n, max_attempts, reason, delay
                    );
                    self.events.emit(SyncEvent::RetryAttempt {
                        label: label.to_string(),
                        attempt: n,
                        reason,
                        delay,
                    });
                    phase = Phase::BackingOff { next: n + 1, delay };
                }
                Phase::BackingOff { next, delay } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break RetryOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => phase = Phase::Attempting(next),
                    }
                }
            }
        };

        let duration = started.elapsed();
        let session_outcome = match &outcome {
            RetryOutcome::Succeeded(_) => {
                if attempt_count > 1 {
                    self.events.emit(SyncEvent::RetrySucceeded {
                        label: label.to_string(),
                        attempts: attempt_count,
                    });
                }
                SessionOutcome::Succeeded
            }
            RetryOutcome::Exhausted(err) => {
                warn!("{}: giving up after {} attempts: {}", label, attempt_count, err);
                self.events.emit(SyncEvent::RetryExhausted {
                    label: label.to_string(),
                    attempts: attempt_count,
                    reason: err.reason(),
                });
                SessionOutcome::Exhausted
            }
            RetryOutcome::Aborted(_) => SessionOutcome::Aborted,
            RetryOutcome::Cancelled => {
                info!("{}: cancelled after {} attempts", label, attempt_count);
                self.events.emit(SyncEvent::RetryCancelled {
                    label: label.to_string(),
                    attempts: attempt_count,
                });
                SessionOutcome::Cancelled
            }
        };

        self.record(RetrySession {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            strategy: config.strategy,
            max_attempts,
            attempts,
            attempt_count,
            current_delay,
            outcome: session_outcome,
            started_at,
            duration,
        });

        RetryResult {
            outcome,
            attempts: attempt_count,
            duration,
        }
    }

    /// Current metrics
    pub fn metrics(&self) -> RetryMetrics {
        self.lock_state().metrics.clone()
    }

    /// Most recent sessions, oldest first
    pub fn history(&self) -> Vec<RetrySession> {
        self.lock_state().history.iter().cloned().collect()
    }

    /// Forget all sessions and metrics
    pub fn clear_history(&self) {
        {
            let mut state = self.lock_state();
            state.history.clear();
            state.metrics = RetryMetrics::default();
        }
        self.persist(&[]);
    }

    fn record(&self, session: RetrySession) {
        let snapshot: Vec<RetrySession> = {
            let mut state = self.lock_state();
            state.metrics.record(&session);
            state.history.push_back(session);
            while state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }
            if self.history_path.is_none() {
                return;
            }
            state.history.iter().cloned().collect()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, sessions: &[RetrySession]) {
        if let Some(path) = &self.history_path {
            if let Err(e) = write_json(path, &sessions) {
                warn!("Failed to persist retry history: {}", e);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_attempt<T, Fut>(call: Fut, timeout: Option<Duration>) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(limit)),
        },
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn no_jitter(config: RetryConfig) -> RetryConfig {
        config.with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let coordinator = RetryCoordinator::new(events);
        let calls = &AtomicU32::new(0);

        let result = coordinator
            .execute_with_retry("upload", &no_jitter(RetryConfig::sync()), &CancellationToken::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 42);

        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::RetryAttempt { attempt: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::RetryAttempt { attempt: 2, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::RetrySucceeded { attempts: 3, .. }));

        let metrics = coordinator.metrics();
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.average_attempts_to_success(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let coordinator = RetryCoordinator::new(EventBus::default());
        let calls = &AtomicU32::new(0);

        let result: RetryResult<()> = coordinator
            .execute_with_retry("upload", &RetryConfig::sync(), &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::from_status(422, "bad payload", None))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result.outcome, RetryOutcome::Aborted(SyncError::Client { status: 422, .. })));
        assert_eq!(coordinator.metrics().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let coordinator = RetryCoordinator::new(events);
        let calls = &AtomicU32::new(0);
        let config = no_jitter(RetryConfig::balanced());

        let result: RetryResult<()> = coordinator
            .execute_with_retry("delta", &config, &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Server { status: 503, message: "down".into() })
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result.outcome, RetryOutcome::Exhausted(_)));

        let mut saw_exhausted = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::RetryExhausted { attempts, reason, .. } = event {
                assert_eq!(attempts, 3);
                assert_eq!(reason, RetryReason::ServerError);
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);

        let history = coordinator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempts.len(), 3);
        assert_eq!(history[0].attempts[0].delay, Duration::from_millis(1000));
        assert_eq!(history[0].attempts[1].delay, Duration::from_millis(2000));
        assert_eq!(history[0].attempts[2].delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_delays_next_attempt() {
        let coordinator = RetryCoordinator::new(EventBus::default());
        let call_times = Arc::new(Mutex::new(Vec::new()));

        let times = call_times.clone();
        let result = coordinator
            .execute_with_retry("upload", &RetryConfig::sync(), &CancellationToken::new(), move || {
                let times = times.clone();
                async move {
                    let mut times = times.lock().unwrap();
                    times.push(Instant::now());
                    if times.len() == 1 {
                        Err(SyncError::RateLimited {
                            retry_after: Some(Duration::from_millis(5000)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_success());
        let times = call_times.lock().unwrap();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out_and_retries() {
        let coordinator = RetryCoordinator::new(EventBus::default());
        let calls = &AtomicU32::new(0);
        let config = no_jitter(RetryConfig::fixed(2, Duration::from_millis(10)))
            .with_attempt_timeout(Some(Duration::from_secs(1)));

        let result = coordinator
            .execute_with_retry("probe", &config, &CancellationToken::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::future::pending::<()>().await;
                }
                Ok("ok")
            })
            .await;

        assert_eq!(result.attempts, 2);
        let history = coordinator.history();
        assert_eq!(history[0].attempts[0].reason, RetryReason::Timeout);
        assert_eq!(result.into_result().unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let coordinator = RetryCoordinator::new(events);
        let cancel = CancellationToken::new();
        let config = RetryConfig::fixed(5, Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: RetryResult<()> = coordinator
            .execute_with_retry("upload", &config, &cancel, || async {
                Err(SyncError::Network("offline".into()))
            })
            .await;

        assert!(result.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(matches!(result.into_result(), Err(SyncError::Cancelled)));

        let mut saw_cancelled = false;
        while let Ok(event) = rx.try_recv() {
            saw_cancelled |= matches!(event, SyncEvent::RetryCancelled { attempts: 1, .. });
        }
        assert!(saw_cancelled);
        assert_eq!(coordinator.metrics().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_calls() {
        let coordinator = RetryCoordinator::new(EventBus::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = &AtomicU32::new(0);

        let result = coordinator
            .execute_with_retry("upload", &RetryConfig::sync(), &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_persisted_and_capped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("retry_history.json");

        {
            let coordinator = RetryCoordinator::with_history(EventBus::default(), path.clone());
            for _ in 0..(HISTORY_CAPACITY + 5) {
                coordinator
                    .execute_with_retry("noop", &RetryConfig::sync(), &CancellationToken::new(), || async {
                        Ok(())
                    })
                    .await;
            }
            assert_eq!(coordinator.history().len(), HISTORY_CAPACITY);
        }

        let reloaded = RetryCoordinator::with_history(EventBus::default(), path.clone());
        assert_eq!(reloaded.history().len(), HISTORY_CAPACITY);
        assert_eq!(reloaded.metrics().successes, HISTORY_CAPACITY as u64);

        reloaded.clear_history();
        assert!(reloaded.history().is_empty());
        let again = RetryCoordinator::with_history(EventBus::default(), path);
        assert!(again.history().is_empty());
    }
}
