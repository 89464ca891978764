//! Task lifecycle reporting.
//!
//! The collector reports state transitions and final results through a
//! [`LifecycleSink`]. Sinks are fire-and-forget from the collector's point of
//! view: a failing sink is logged and never affects a task outcome.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::task::{BatchResult, TaskResult};

/// Task state as seen by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub task_id: String,
    pub state: LifecycleState,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(task_id: impl Into<String>, state: LifecycleState, attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            at: Utc::now(),
            attempt,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Outbound reporting seam.
pub trait LifecycleSink: Send + Sync {
    fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()>;

    fn publish_task(&self, _result: &TaskResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn publish_batch(&self, _result: &BatchResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records an event, logging sink failures instead of propagating them.
pub(crate) fn emit(sink: &dyn LifecycleSink, event: LifecycleEvent) {
    if let Err(e) = sink.record(&event) {
        warn!(
            "Lifecycle sink rejected {:?} for task {}: {:#}",
            event.state, event.task_id, e
        );
    }
}

pub(crate) fn emit_task(sink: &dyn LifecycleSink, result: &TaskResult) {
    if let Err(e) = sink.publish_task(result) {
        warn!("Failed to publish result of task {}: {:#}", result.task_id, e);
    }
}

pub(crate) fn emit_batch(sink: &dyn LifecycleSink, result: &BatchResult) {
    if let Err(e) = sink.publish_batch(result) {
        warn!("Failed to publish batch {}: {:#}", result.batch_id, e);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LifecycleSink for NoopSink {
    fn record(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes one log line per transition and result.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl LifecycleSink for LogSink {
    fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match &event.detail {
            Some(detail) => info!(
                "task {} -> {:?} (attempt {}): {}",
                event.task_id, event.state, event.attempt, detail
            ),
            None => info!(
                "task {} -> {:?} (attempt {})",
                event.task_id, event.state, event.attempt
            ),
        }
        Ok(())
    }

    fn publish_task(&self, result: &TaskResult) -> anyhow::Result<()> {
        info!(
            "task {} on {}: success={} commands {}/{} in {:.2}s",
            result.task_id,
            result.host,
            result.success,
            result.success_commands,
            result.total_commands,
            result.execution_time_secs
        );
        Ok(())
    }

    fn publish_batch(&self, result: &BatchResult) -> anyhow::Result<()> {
        info!(
            "batch {}: {}/{} tasks succeeded in {:.2}s",
            result.batch_id, result.success_tasks, result.total_tasks, result.execution_time_secs
        );
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    tasks: Arc<Mutex<Vec<TaskResult>>>,
    batches: Arc<Mutex<Vec<BatchResult>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Events for one task, in emission order.
    pub fn states_of(&self, task_id: &str) -> Vec<LifecycleState> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.state)
            .collect()
    }

    pub fn task_results(&self) -> Vec<TaskResult> {
        self.tasks.lock().clone()
    }

    pub fn batch_results(&self) -> Vec<BatchResult> {
        self.batches.lock().clone()
    }
}

impl LifecycleSink for MemorySink {
    fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn publish_task(&self, result: &TaskResult) -> anyhow::Result<()> {
        self.tasks.lock().push(result.clone());
        Ok(())
    }

    fn publish_batch(&self, result: &BatchResult) -> anyhow::Result<()> {
        self.batches.lock().push(result.clone());
        Ok(())
    }
}

/// One JSON line per record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonlRecord {
    Event(LifecycleEvent),
    Task(TaskResult),
    Batch(BatchResult),
}

impl JsonlRecord {
    /// Parses records written by [`JsonlSink`], skipping blank lines.
    pub fn parse_all(jsonl: &str) -> Result<Vec<Self>, serde_json::Error> {
        jsonl
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect()
    }
}

/// Appends JSON lines to any writer (file, socket, buffer).
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write(&self, record: &JsonlRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> LifecycleSink for JsonlSink<W> {
    fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.write(&JsonlRecord::Event(event.clone()))
    }

    fn publish_task(&self, result: &TaskResult) -> anyhow::Result<()> {
        self.write(&JsonlRecord::Task(result.clone()))
    }

    fn publish_batch(&self, result: &BatchResult) -> anyhow::Result<()> {
        self.write(&JsonlRecord::Batch(result.clone()))
    }
}

/// Forwards to every inner sink. Fails if any inner sink fails, after trying all.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LifecycleSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LifecycleSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn LifecycleSink>) {
        self.sinks.push(sink);
    }

    fn each(&self, f: impl Fn(&dyn LifecycleSink) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                failures.push(format!("{e:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{} sink(s) failed: {}", failures.len(), failures.join("; "))
        }
    }
}

impl LifecycleSink for FanoutSink {
    fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.each(|sink| sink.record(event))
    }

    fn publish_task(&self, result: &TaskResult) -> anyhow::Result<()> {
        self.each(|sink| sink.publish_task(result))
    }

    fn publish_batch(&self, result: &BatchResult) -> anyhow::Result<()> {
        self.each(|sink| sink.publish_batch(result))
    }
}
