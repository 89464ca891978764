//! Connection retry around one task.
//!
//! Each attempt gets a fresh [`SessionExecutor`]. Connection failures are
//! retried with linear backoff (`retry_delay * attempt`); command failures on
//! a live session are not. The whole run is bounded by the task timeout and
//! observes the caller's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectFailure;
use crate::lifecycle::{self, LifecycleEvent, LifecycleSink, LifecycleState};
use crate::profile::ProfileLookup;
use crate::session::{Connector, SessionExecutor};
use crate::task::{CollectionTask, CommandResult, TaskErrorKind, TaskResult};

/// How the attempt loop ended.
enum Outcome {
    Completed {
        results: Vec<CommandResult>,
        attempt: u32,
    },
    Failed {
        kind: TaskErrorKind,
        message: String,
        attempt: u32,
    },
}

impl Outcome {
    fn attempt(&self) -> u32 {
        match self {
            Self::Completed { attempt, .. } | Self::Failed { attempt, .. } => *attempt,
        }
    }
}

pub struct RetryController {
    connector: Arc<dyn Connector>,
    profiles: Arc<dyn ProfileLookup>,
    sink: Arc<dyn LifecycleSink>,
    retry_delay: Duration,
}

impl RetryController {
    pub fn new(
        connector: Arc<dyn Connector>,
        profiles: Arc<dyn ProfileLookup>,
        sink: Arc<dyn LifecycleSink>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            connector,
            profiles,
            sink,
            retry_delay,
        }
    }

    pub fn sink(&self) -> &Arc<dyn LifecycleSink> {
        &self.sink
    }

    /// Runs the task to a final result, then reports it to the sink.
    pub async fn run(&self, task: &CollectionTask, cancel: &CancellationToken) -> TaskResult {
        let result = self.execute(task, cancel).await;
        self.report(&result);
        result
    }

    /// Runs the task without reporting the final result.
    ///
    /// The `running` transition is still emitted on the first attempt.
    pub async fn execute(&self, task: &CollectionTask, cancel: &CancellationToken) -> TaskResult {
        let started = Instant::now();
        let task_id = task.task_id();
        let host = task.credentials().host();
        let total = task.commands().len();

        // The child token lets the deadline unwind an attempt through disconnect.
        let attempt_cancel = cancel.child_token();
        let attempts = self.attempts(task, &attempt_cancel);
        tokio::pin!(attempts);

        let outcome = tokio::select! {
            outcome = &mut attempts => outcome,
            _ = tokio::time::sleep(task.timeout()) => {
                warn!("task {} exceeded its {}s timeout, cancelling", task_id, task.timeout().as_secs());
                attempt_cancel.cancel();
                let unwound = attempts.as_mut().await;
                Outcome::Failed {
                    kind: TaskErrorKind::TaskTimeout,
                    message: format!(
                        "task {} timed out after {}s",
                        task_id,
                        task.timeout().as_secs()
                    ),
                    attempt: unwound.attempt(),
                }
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            Outcome::Completed { results, attempt } => {
                TaskResult::completed(task_id, host, results, attempt, elapsed)
            }
            Outcome::Failed {
                kind,
                message,
                attempt,
            } => TaskResult::failed(task_id, host, kind, message, total, attempt, elapsed),
        }
    }

    /// Emits the terminal transition and publishes the result.
    pub fn report(&self, result: &TaskResult) {
        let event = if result.success {
            LifecycleEvent::new(&result.task_id, LifecycleState::Completed, result.attempt)
        } else {
            let detail = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            LifecycleEvent::new(&result.task_id, LifecycleState::Failed, result.attempt)
                .with_detail(detail)
        };
        lifecycle::emit(self.sink.as_ref(), event);
        lifecycle::emit_task(self.sink.as_ref(), result);
    }

    async fn attempts(&self, task: &CollectionTask, cancel: &CancellationToken) -> Outcome {
        let task_id = task.task_id();
        let retries = task.retry_count();
        let mut last_error = None;

        for attempt in 1..=retries {
            if attempt == 1 {
                lifecycle::emit(
                    self.sink.as_ref(),
                    LifecycleEvent::new(task_id, LifecycleState::Running, attempt)
                        .with_detail(task.credentials().device_addr()),
                );
            }
            if cancel.is_cancelled() {
                return cancelled(task_id, attempt - 1);
            }
            info!("task {} attempt {}/{}", task_id, attempt, retries);

            let mut session =
                SessionExecutor::new(self.connector.clone(), self.profiles.clone(), cancel.clone());
            match session.connect(task.credentials()).await {
                Ok(()) => {
                    let results = session.execute_all(task.commands()).await;
                    session.disconnect().await;
                    if cancel.is_cancelled() {
                        return cancelled(task_id, attempt);
                    }
                    return Outcome::Completed { results, attempt };
                }
                Err(e) => {
                    session.disconnect().await;
                    if !e.is_retryable() {
                        let kind = match e {
                            ConnectFailure::Invalid(_) => TaskErrorKind::Validation,
                            ConnectFailure::Cancelled => TaskErrorKind::Cancelled,
                            _ => TaskErrorKind::Unknown,
                        };
                        return Outcome::Failed {
                            kind,
                            message: format!("task {task_id} failed: {e}"),
                            attempt,
                        };
                    }
                    warn!("task {} attempt {} failed: {}", task_id, attempt, e);
                    last_error = Some(e);
                }
            }

            if attempt < retries {
                let wait = self.retry_delay * attempt;
                debug!("task {} retrying in {:.1}s", task_id, wait.as_secs_f64());
                tokio::select! {
                    _ = cancel.cancelled() => return cancelled(task_id, attempt),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Outcome::Failed {
            kind: TaskErrorKind::Connection,
            message: format!("task {task_id} failed after {retries} attempts: {reason}"),
            attempt: retries,
        }
    }
}

fn cancelled(task_id: &str, attempt: u32) -> Outcome {
    info!("task {} cancelled", task_id);
    Outcome::Failed {
        kind: TaskErrorKind::Cancelled,
        message: format!("task {task_id} cancelled"),
        attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, ConnectionError};
    use crate::lifecycle::MemorySink;
    use crate::profile::{DeviceProfile, ProfileRegistry};
    use crate::resolver::EffectiveCommand;
    use crate::session::{Shell, ShellOutput};
    use crate::task::{CommandSpec, Credentials};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` connects, then hands out echo shells.
    struct Flaky {
        failures: u32,
        connects: AtomicU32,
    }

    struct Echo;

    #[async_trait]
    impl Shell for Echo {
        async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
            Ok(ShellOutput {
                output: command.command.clone(),
                device_error: None,
            })
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for Flaky {
        async fn connect(
            &self,
            credentials: &Credentials,
            _profile: Option<Arc<DeviceProfile>>,
        ) -> Result<Box<dyn Shell>, ConnectionError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(ConnectionError::unreachable(credentials.host(), "connection refused"))
            } else {
                Ok(Box::new(Echo))
            }
        }
    }

    fn controller(failures: u32, sink: MemorySink) -> (RetryController, Arc<Flaky>) {
        let flaky = Arc::new(Flaky {
            failures,
            connects: AtomicU32::new(0),
        });
        let controller = RetryController::new(
            flaky.clone(),
            Arc::new(ProfileRegistry::builtin()),
            Arc::new(sink),
            Duration::from_secs(1),
        );
        (controller, flaky)
    }

    fn task(retries: u32) -> CollectionTask {
        CollectionTask::new(
            "t1",
            Credentials::with_password("10.0.0.9", "admin", "pw").unwrap(),
            vec![CommandSpec::new("uname -a")],
            Duration::from_secs(300),
            retries,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_linear_backoff() {
        let sink = MemorySink::new();
        let (controller, flaky) = controller(2, sink.clone());
        let started = Instant::now();

        let result = controller.run(&task(3), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.attempt, 3);
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 3);
        // 1s after attempt 1, 2s after attempt 2.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(
            sink.states_of("t1"),
            vec![LifecycleState::Running, LifecycleState::Completed]
        );
        assert_eq!(sink.task_results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempt_count() {
        let sink = MemorySink::new();
        let (controller, flaky) = controller(u32::MAX, sink.clone());

        let result = controller.run(&task(2), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 2);
        assert_eq!(result.error_kind(), Some(TaskErrorKind::Connection));
        let message = &result.error.as_ref().unwrap().message;
        assert!(message.starts_with("task t1 failed after 2 attempts:"));
        assert!(message.contains("connection refused"));
        assert_eq!(result.failed_commands, 1);
        assert_eq!(sink.states_of("t1").last(), Some(&LifecycleState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let (controller, flaky) = controller(u32::MAX, MemorySink::new());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let result = controller.execute(&task(5), &cancel).await;

        assert_eq!(result.error_kind(), Some(TaskErrorKind::Cancelled));
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_bounds_the_whole_run() {
        let (controller, _flaky) = controller(u32::MAX, MemorySink::new());
        let task = CollectionTask::new(
            "slow",
            Credentials::with_password("10.0.0.9", "admin", "pw").unwrap(),
            vec![CommandSpec::new("uname -a")],
            Duration::from_secs(4),
            10,
        )
        .unwrap();

        let result = controller.execute(&task, &CancellationToken::new()).await;

        assert_eq!(result.error_kind(), Some(TaskErrorKind::TaskTimeout));
        assert!(result.error.unwrap().message.contains("timed out after 4s"));
    }
}
