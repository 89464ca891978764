//! Bounded concurrent execution of task batches.
//!
//! Tasks run as tokio tasks behind a semaphore of `min(max_workers, len)`
//! permits. Each dispatched task gets a child [`CancellationToken`] and is
//! tracked in a single in-flight registry, so [`WorkerPool::stop`] and
//! [`WorkerPool::cancel_task`] can reach it. A task that exceeds the pool
//! timeout is cancelled, given a grace period to disconnect, then abandoned.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::CollectorSettings;
use crate::error::{PoolTimeoutError, UnknownError};
use crate::lifecycle::{self, LifecycleEvent, LifecycleState};
use crate::retry::RetryController;
use crate::task::{BatchResult, CollectionTask, ExecutionMode, TaskErrorKind, TaskResult};

/// Snapshot returned by [`WorkerPool::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolStatus {
    pub active_tasks: usize,
    pub max_workers: usize,
    pub threading_enabled: bool,
    pub pool_timeout_secs: u64,
    pub running: bool,
}

struct InFlight {
    task_id: String,
    token: CancellationToken,
    started_at: Instant,
}

/// Keyed per dispatch, so a batch may repeat a task id.
struct PoolState {
    running: bool,
    root: CancellationToken,
    tracker: TaskTracker,
    next_dispatch: u64,
    in_flight: HashMap<u64, InFlight>,
}

impl PoolState {
    fn idle() -> Self {
        Self {
            running: false,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_dispatch: 0,
            in_flight: HashMap::new(),
        }
    }

    fn register(&mut self, task_id: &str, token: CancellationToken) -> u64 {
        let key = self.next_dispatch;
        self.next_dispatch += 1;
        self.in_flight.insert(
            key,
            InFlight {
                task_id: task_id.to_string(),
                token,
                started_at: Instant::now(),
            },
        );
        key
    }
}

pub struct WorkerPool {
    controller: Arc<RetryController>,
    max_workers: usize,
    threading_enabled: bool,
    pool_timeout: Duration,
    cancel_grace: Duration,
    state: Arc<Mutex<PoolState>>,
}

impl WorkerPool {
    pub fn new(controller: Arc<RetryController>, settings: &CollectorSettings) -> Self {
        Self {
            controller,
            max_workers: settings.max_workers.max(1),
            threading_enabled: settings.threading_enabled,
            pool_timeout: settings.pool_timeout(),
            cancel_grace: settings.cancel_grace(),
            state: Arc::new(Mutex::new(PoolState::idle())),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn threading_enabled(&self) -> bool {
        self.threading_enabled
    }

    /// Arms a fresh cancellation root and tracker. No-op when already running.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running {
            return;
        }
        state.root = CancellationToken::new();
        state.tracker = TaskTracker::new();
        state.running = true;
        info!(
            "Worker pool started: max_workers={}, threading={}, timeout={}s",
            self.max_workers,
            self.threading_enabled,
            self.pool_timeout.as_secs()
        );
    }

    /// Cancels all in-flight work and waits until it has unwound.
    pub async fn stop(&self) {
        let tracker = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.root.cancel();
            state.tracker.close();
            info!("Stopping worker pool, {} task(s) in flight", state.in_flight.len());
            state.tracker.clone()
        };
        tracker.wait().await;
        info!("Worker pool stopped");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            active_tasks: state.in_flight.len(),
            max_workers: self.max_workers,
            threading_enabled: self.threading_enabled,
            pool_timeout_secs: self.pool_timeout.as_secs(),
            running: state.running,
        }
    }

    /// Cancels every in-flight dispatch of `task_id`. Returns false if none is running.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let state = self.state.lock();
        let mut cancelled = false;
        for entry in state.in_flight.values().filter(|e| e.task_id == task_id) {
            info!(
                "Cancelling task {} after {:.1}s",
                task_id,
                entry.started_at.elapsed().as_secs_f64()
            );
            entry.token.cancel();
            cancelled = true;
        }
        cancelled
    }

    /// Runs a single task outside any batch.
    pub async fn run_one(&self, task: CollectionTask) -> TaskResult {
        self.start();
        lifecycle::emit(
            self.controller.sink().as_ref(),
            LifecycleEvent::new(task.task_id(), LifecycleState::Pending, 0),
        );
        self.dispatch(task, None).await
    }

    /// Runs a batch with the pool's configured concurrency.
    pub async fn run(&self, batch_id: impl Into<String>, tasks: Vec<CollectionTask>) -> BatchResult {
        self.run_batch(batch_id, tasks, self.max_workers, self.threading_enabled)
            .await
    }

    /// Runs every task to a result.
    ///
    /// Serial (list order) when threading is off or there is at most one task,
    /// otherwise up to `min(max_workers, len)` at once in completion order.
    pub async fn run_batch(
        &self,
        batch_id: impl Into<String>,
        tasks: Vec<CollectionTask>,
        max_workers: usize,
        threading_enabled: bool,
    ) -> BatchResult {
        let batch_id = batch_id.into();
        self.start();
        let started = Instant::now();
        let sink = self.controller.sink().clone();
        for task in &tasks {
            lifecycle::emit(
                sink.as_ref(),
                LifecycleEvent::new(task.task_id(), LifecycleState::Pending, 0),
            );
        }

        let (mode, results) = if !threading_enabled || tasks.len() <= 1 {
            info!("batch {}: running {} task(s) serially", batch_id, tasks.len());
            let mut results = Vec::with_capacity(tasks.len());
            for task in tasks {
                results.push(self.dispatch(task, None).await);
            }
            (ExecutionMode::Serial, results)
        } else {
            let workers = max_workers.max(1).min(tasks.len());
            info!(
                "batch {}: running {} tasks with {} workers",
                batch_id,
                tasks.len(),
                workers
            );
            (
                ExecutionMode::Parallel { workers },
                self.run_parallel(tasks, workers).await,
            )
        };

        let batch = BatchResult::from_results(batch_id, results, mode, started.elapsed());
        info!(
            "batch {} finished: {}/{} tasks ok in {:.2}s",
            batch.batch_id, batch.success_tasks, batch.total_tasks, batch.execution_time_secs
        );
        lifecycle::emit_batch(sink.as_ref(), &batch);
        batch
    }

    async fn run_parallel(&self, tasks: Vec<CollectionTask>, workers: usize) -> Vec<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let submitted: Vec<(String, String, usize)> = tasks
            .iter()
            .map(|t| {
                (
                    t.task_id().to_string(),
                    t.credentials().host().to_string(),
                    t.commands().len(),
                )
            })
            .collect();

        let tracker = self.state.lock().tracker.clone();
        for task in tasks {
            let runner = self.runner();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            tracker.spawn(async move {
                let result = runner.dispatch(task, Some(semaphore)).await;
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(submitted.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        // Every submitted task yields exactly one result, repeated ids included.
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for result in &results {
            *seen.entry(result.task_id.as_str()).or_default() += 1;
        }
        let missing: Vec<TaskResult> = submitted
            .iter()
            .filter(|(id, _, _)| match seen.get_mut(id.as_str()) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    false
                }
                _ => true,
            })
            .map(|(id, host, total)| {
                error!("task {} produced no result", id);
                TaskResult::failed(
                    id,
                    host,
                    TaskErrorKind::Unknown,
                    UnknownError("worker exited without a result".to_string()).to_string(),
                    *total,
                    0,
                    Duration::ZERO,
                )
            })
            .collect();
        drop(seen);
        results.extend(missing);
        results
    }

    async fn dispatch(&self, task: CollectionTask, permits: Option<Arc<Semaphore>>) -> TaskResult {
        self.runner().dispatch(task, permits).await
    }

    fn runner(&self) -> Runner {
        Runner {
            controller: self.controller.clone(),
            state: self.state.clone(),
            pool_timeout: self.pool_timeout,
            cancel_grace: self.cancel_grace,
        }
    }
}

/// The per-task half of the pool, moved into spawned workers.
#[derive(Clone)]
struct Runner {
    controller: Arc<RetryController>,
    state: Arc<Mutex<PoolState>>,
    pool_timeout: Duration,
    cancel_grace: Duration,
}

impl Runner {
    async fn dispatch(&self, task: CollectionTask, permits: Option<Arc<Semaphore>>) -> TaskResult {
        let (root, tracker) = {
            let state = self.state.lock();
            (state.root.clone(), state.tracker.clone())
        };

        let _permit = match permits {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    _ = root.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                match acquired {
                    Some(permit) => Some(permit),
                    None => return self.finish(self.not_started(&task)),
                }
            }
            None => None,
        };
        if root.is_cancelled() {
            return self.finish(self.not_started(&task));
        }

        let task_id = task.task_id().to_string();
        let token = root.child_token();
        let key = self.state.lock().register(&task_id, token.clone());
        debug!("dispatching task {}", task_id);

        let started = Instant::now();
        let host = task.credentials().host().to_string();
        let total = task.commands().len();
        let controller = self.controller.clone();
        let worker_token = token.clone();
        let mut handle =
            tracker.spawn(async move { controller.execute(&task, &worker_token).await });

        let result = match tokio::time::timeout(self.pool_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let message = UnknownError(join_error_message(e)).to_string();
                error!("task {} crashed: {}", task_id, message);
                TaskResult::failed(
                    &task_id,
                    &host,
                    TaskErrorKind::Unknown,
                    message,
                    total,
                    0,
                    started.elapsed(),
                )
            }
            Err(_) => {
                token.cancel();
                if tokio::time::timeout(self.cancel_grace, &mut handle).await.is_err() {
                    warn!("task {} did not unwind within grace period, abandoning", task_id);
                    handle.abort();
                }
                let err = PoolTimeoutError {
                    task_id: task_id.clone(),
                    timeout_secs: self.pool_timeout.as_secs(),
                };
                warn!("{}", err);
                TaskResult::failed(
                    &task_id,
                    &host,
                    TaskErrorKind::PoolTimeout,
                    err.to_string(),
                    total,
                    0,
                    started.elapsed(),
                )
            }
        };

        self.state.lock().in_flight.remove(&key);
        self.finish(result)
    }

    fn not_started(&self, task: &CollectionTask) -> TaskResult {
        TaskResult::failed(
            task.task_id(),
            task.credentials().host(),
            TaskErrorKind::Cancelled,
            format!("task {} cancelled before start", task.task_id()),
            task.commands().len(),
            0,
            Duration::ZERO,
        )
    }

    fn finish(&self, result: TaskResult) -> TaskResult {
        self.controller.report(&result);
        result
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        err.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "task panicked".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, ConnectionError};
    use crate::lifecycle::MemorySink;
    use crate::profile::{DeviceProfile, ProfileRegistry};
    use crate::resolver::EffectiveCommand;
    use crate::session::{Connector, Shell, ShellOutput};
    use crate::task::{CommandSpec, Credentials};
    use async_trait::async_trait;

    /// Hosts named `panic` panic inside connect; `hang` hangs on every command.
    struct Scripted;

    struct Sleeper(String);

    #[async_trait]
    impl Shell for Sleeper {
        async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
            if self.0 == "hang" {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ShellOutput {
                output: format!("{}:{}", self.0, command.command),
                device_error: None,
            })
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        async fn connect(
            &self,
            credentials: &Credentials,
            _profile: Option<Arc<DeviceProfile>>,
        ) -> Result<Box<dyn Shell>, ConnectionError> {
            if credentials.host() == "panic" {
                panic!("driver bug");
            }
            Ok(Box::new(Sleeper(credentials.host().to_string())))
        }
    }

    fn pool(settings: CollectorSettings, sink: MemorySink) -> WorkerPool {
        let controller = RetryController::new(
            Arc::new(Scripted),
            Arc::new(ProfileRegistry::builtin()),
            Arc::new(sink),
            settings.retry_delay(),
        );
        WorkerPool::new(Arc::new(controller), &settings)
    }

    fn task(id: &str, host: &str) -> CollectionTask {
        CollectionTask::new(
            id,
            Credentials::with_password(host, "admin", "pw").unwrap(),
            vec![CommandSpec::new("uptime")],
            Duration::from_secs(300),
            1,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn panic_becomes_failed_result_with_task_id() {
        let settings = CollectorSettings {
            threading_enabled: true,
            ..Default::default()
        };
        let sink = MemorySink::new();
        let pool = pool(settings, sink.clone());

        let batch = pool
            .run("b1", vec![task("ok", "10.0.0.1"), task("boom", "panic")])
            .await;

        assert_eq!(batch.total_tasks, 2);
        let boom = batch.get("boom").unwrap();
        assert_eq!(boom.error_kind(), Some(TaskErrorKind::Unknown));
        assert!(boom.error.as_ref().unwrap().message.contains("driver bug"));
        assert!(batch.get("ok").unwrap().success);
        assert_eq!(sink.states_of("boom").first(), Some(&LifecycleState::Pending));
        assert_eq!(sink.states_of("boom").last(), Some(&LifecycleState::Failed));
        assert_eq!(sink.batch_results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_timeout_fails_only_the_slow_task() {
        let settings = CollectorSettings {
            threading_enabled: true,
            pool_timeout_secs: 10,
            ..Default::default()
        };
        let pool = pool(settings, MemorySink::new());

        let batch = pool
            .run("b1", vec![task("slow", "hang"), task("fast", "10.0.0.2")])
            .await;

        let slow = batch.get("slow").unwrap();
        assert_eq!(slow.error_kind(), Some(TaskErrorKind::PoolTimeout));
        assert!(batch.get("fast").unwrap().success);
        assert!(batch.success);
        assert_eq!(pool.status().active_tasks, 0);
    }

    #[tokio::test]
    async fn repeated_task_ids_are_tracked_and_cancelled_together() {
        let settings = CollectorSettings {
            threading_enabled: true,
            max_workers: 3,
            ..Default::default()
        };
        let pool = pool(settings, MemorySink::new());

        let canceller = async {
            while pool.status().active_tasks < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(pool.cancel_task("dup"));
        };
        let (batch, ()) = tokio::join!(
            pool.run(
                "b1",
                vec![task("dup", "hang"), task("dup", "hang"), task("solo", "10.0.0.3")],
            ),
            canceller,
        );

        assert_eq!(batch.total_tasks, 3);
        let dups: Vec<&TaskResult> = batch
            .task_results
            .iter()
            .filter(|r| r.task_id == "dup")
            .collect();
        assert_eq!(dups.len(), 2);
        assert!(dups.iter().all(|r| r.error_kind() == Some(TaskErrorKind::Cancelled)));
        assert!(batch.get("solo").unwrap().success);
        assert_eq!(pool.status().active_tasks, 0);
        assert!(!pool.cancel_task("dup"));
    }

    #[tokio::test]
    async fn status_reflects_settings_and_lifecycle() {
        let pool = pool(CollectorSettings::default(), MemorySink::new());
        let status = pool.status();
        assert!(!status.running);
        assert_eq!(status.max_workers, 2);
        assert_eq!(status.pool_timeout_secs, 300);

        pool.start();
        assert!(pool.status().running);
        pool.stop().await;
        assert!(!pool.status().running);
        assert!(!pool.cancel_task("nope"));
    }

    #[tokio::test]
    async fn empty_batch_is_successful() {
        let pool = pool(CollectorSettings::default(), MemorySink::new());
        let batch = pool.run("empty", Vec::new()).await;
        assert!(batch.success);
        assert_eq!(batch.total_tasks, 0);
        assert_eq!(batch.mode, ExecutionMode::Serial);
    }
}
