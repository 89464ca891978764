//! Collection facade.
//!
//! [`Collector`] is what an HTTP handler or queue worker talks to. It
//! validates inbound requests synchronously, builds [`CollectionTask`]s and
//! hands them to the [`WorkerPool`]. Everything below the task boundary comes
//! back as result data, never as an error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CollectorSettings;
use crate::error::{CollectorError, ValidationError};
use crate::lifecycle::{LifecycleSink, LogSink};
use crate::pool::{PoolStatus, WorkerPool};
use crate::profile::{ProfileRegistry, ProfileSummary};
use crate::retry::RetryController;
use crate::session::{Connector, SessionExecutor, SshConnector};
use crate::task::{
    BatchResult, CollectionTask, CommandResult, CommandSpec, Credentials, TaskRequest,
    TaskResult, generate_task_id, unix_secs,
};

/// Outcome of [`Collector::test_connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionCheck {
    pub success: bool,
    pub host: String,
    pub port: u16,
    pub message: String,
    pub elapsed_secs: f64,
}

pub struct Collector {
    settings: CollectorSettings,
    profiles: Arc<ProfileRegistry>,
    connector: Arc<dyn Connector>,
    pool: WorkerPool,
}

impl Collector {
    /// Builtin profiles, the SSH connector at the configured security level
    /// and lifecycle events written to the log.
    pub fn new(settings: CollectorSettings) -> Result<Self, CollectorError> {
        let connector = Arc::new(SshConnector::with_level(settings.security_level));
        Self::with_components(
            settings,
            Arc::new(ProfileRegistry::builtin()),
            connector,
            Arc::new(LogSink),
        )
    }

    pub fn with_components(
        settings: CollectorSettings,
        profiles: Arc<ProfileRegistry>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn LifecycleSink>,
    ) -> Result<Self, CollectorError> {
        settings.validate()?;
        let controller = Arc::new(RetryController::new(
            connector.clone(),
            profiles.clone(),
            sink,
            settings.retry_delay(),
        ));
        let pool = WorkerPool::new(controller, &settings);
        info!(
            "Collector ready: {} device profiles, {} workers",
            profiles.len(),
            pool.max_workers()
        );
        Ok(Self {
            settings,
            profiles,
            connector,
            pool,
        })
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    /// Validates and runs one task with retries.
    pub async fn collect(&self, request: TaskRequest) -> Result<TaskResult, CollectorError> {
        let task = request.into_task(&self.settings)?;
        Ok(self.collect_task(task).await)
    }

    pub async fn collect_task(&self, task: CollectionTask) -> TaskResult {
        self.pool.run_one(task).await
    }

    /// Validates every request first; nothing runs if any is malformed.
    pub async fn collect_batch(
        &self,
        requests: Vec<TaskRequest>,
        max_workers: Option<usize>,
    ) -> Result<BatchResult, CollectorError> {
        let tasks = requests
            .into_iter()
            .map(|r| r.into_task(&self.settings))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.run_tasks(tasks, max_workers).await)
    }

    /// Runs prebuilt tasks as one batch.
    pub async fn run_tasks(
        &self,
        tasks: Vec<CollectionTask>,
        max_workers: Option<usize>,
    ) -> BatchResult {
        let workers = max_workers.unwrap_or(self.pool.max_workers());
        self.pool
            .run_batch(batch_id(), tasks, workers, self.pool.threading_enabled())
            .await
    }

    /// The same command list against many hosts.
    pub async fn collect_multi_host(
        &self,
        credentials: Vec<Credentials>,
        commands: Vec<CommandSpec>,
        max_workers: Option<usize>,
        timeout: Option<Duration>,
        retry_count: Option<u32>,
    ) -> Result<BatchResult, CollectorError> {
        let ts = unix_secs();
        let timeout =
            timeout.unwrap_or(Duration::from_secs(self.settings.default_task_timeout_secs));
        let retry_count = retry_count.unwrap_or(self.settings.default_retry_count);

        let tasks = credentials
            .into_iter()
            .enumerate()
            .map(|(i, creds)| {
                creds.validate()?;
                let task_id = format!("multi_host_task_{}_{}_{}", i, creds.host(), ts);
                CollectionTask::new(task_id, creds, commands.clone(), timeout, retry_count)
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        Ok(self.run_tasks(tasks, max_workers).await)
    }

    /// Opens and closes one session without running anything.
    pub async fn test_connection(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectionCheck, CollectorError> {
        credentials.validate()?;
        let started = Instant::now();
        let mut session = self.session();
        let outcome = session.connect(credentials).await;
        session.disconnect().await;

        let (success, message) = match outcome {
            Ok(()) => (
                true,
                format!("connected to {}", credentials.device_addr()),
            ),
            Err(e) => (false, e.to_string()),
        };
        Ok(ConnectionCheck {
            success,
            host: credentials.host().to_string(),
            port: credentials.port(),
            message,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// One session, no retries. A failed connect is an error.
    pub async fn execute_commands(
        &self,
        credentials: &Credentials,
        commands: &[CommandSpec],
    ) -> Result<Vec<CommandResult>, CollectorError> {
        credentials.validate()?;
        if commands.is_empty() {
            return Err(ValidationError::NoCommands(credentials.host().to_string()).into());
        }
        for (i, cmd) in commands.iter().enumerate() {
            cmd.validate(i)?;
        }

        let mut session = self.session();
        if let Err(e) = session.connect(credentials).await {
            session.disconnect().await;
            return Err(e.into());
        }
        let results = session.execute_all(commands).await;
        session.disconnect().await;
        debug!(
            "{} ran {} command(s) on {}",
            credentials.username(),
            results.len(),
            credentials.host()
        );
        Ok(results)
    }

    pub async fn execute_simple_command(
        &self,
        host: &str,
        username: &str,
        password: &str,
        command: &str,
        device_type: Option<&str>,
    ) -> Result<CommandResult, CollectorError> {
        let mut credentials = Credentials::with_password(host, username, password)?;
        if let Some(device_type) = device_type {
            credentials = credentials.for_device_type(device_type);
        }
        let mut results = self
            .execute_commands(&credentials, &[CommandSpec::new(command)])
            .await?;
        // execute_all yields one result per command.
        Ok(results.remove(0))
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.pool.cancel_task(task_id)
    }

    /// Cancels everything in flight and waits for sessions to close.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub fn supported_devices(&self) -> Vec<ProfileSummary> {
        self.profiles.describe()
    }

    pub fn supported_device_types(&self) -> BTreeSet<String> {
        self.profiles.list_types()
    }

    /// Re-reads the profile source. Returns the number of profiles now loaded.
    pub fn reload_profiles(&self) -> usize {
        self.profiles.reload()
    }

    fn session(&self) -> SessionExecutor {
        SessionExecutor::new(
            self.connector.clone(),
            self.profiles.clone(),
            CancellationToken::new(),
        )
    }
}

fn batch_id() -> String {
    format!("batch_{}", generate_task_id().trim_start_matches("task_"))
}
