//! Task data model: credentials, command specs, tasks and their results.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{CollectorSettings, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::error::ValidationError;
use crate::resolver::{MAX_DELAY_FACTOR, MAX_LOOPS_LIMIT};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DEVICE_TYPE: &str = "linux";

/// Raw, unvalidated credentials as they arrive from a controller or queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CredentialsSpec {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Inline PEM/OpenSSH key or a path to a key file.
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub timeout: u64,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_device_type() -> String {
    DEFAULT_DEVICE_TYPE.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Validated SSH credentials. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    device_type: String,
    timeout: Duration,
}

impl Credentials {
    /// Builds password-authenticated credentials with default port, type and timeout.
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        CredentialsSpec {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            password: Some(password.into()),
            private_key: None,
            device_type: default_device_type(),
            timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
        .try_into()
    }

    /// Same credentials for another device type.
    pub fn for_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `user@host:port`, used as the device address in logs.
    pub fn device_addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Re-checks the required fields and a non-zero timeout, which
    /// [`Credentials::with_timeout`] can still set after construction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(
            &self.host,
            &self.username,
            self.password.as_deref(),
            self.private_key.as_deref(),
        )?;
        check_connect_timeout(self.timeout.as_secs_f64())
    }
}

fn check_connect_timeout(secs: f64) -> Result<(), ValidationError> {
    if secs <= 0.0 {
        return Err(ValidationError::InvalidField {
            field: "timeout",
            reason: "connection timeout must be positive".to_string(),
        });
    }
    Ok(())
}

fn validate_fields(
    host: &str,
    username: &str,
    password: Option<&str>,
    private_key: Option<&str>,
) -> Result<(), ValidationError> {
    if host.trim().is_empty() {
        return Err(ValidationError::MissingHost);
    }
    if username.trim().is_empty() {
        return Err(ValidationError::MissingUsername);
    }
    let has_password = password.is_some_and(|p| !p.is_empty());
    let has_key = private_key.is_some_and(|k| !k.trim().is_empty());
    if !has_password && !has_key {
        return Err(ValidationError::MissingAuth);
    }
    Ok(())
}

impl TryFrom<CredentialsSpec> for Credentials {
    type Error = ValidationError;

    fn try_from(spec: CredentialsSpec) -> Result<Self, Self::Error> {
        validate_fields(
            &spec.host,
            &spec.username,
            spec.password.as_deref(),
            spec.private_key.as_deref(),
        )?;
        check_connect_timeout(spec.timeout as f64)?;
        let device_type = if spec.device_type.trim().is_empty() {
            default_device_type()
        } else {
            spec.device_type.trim().to_string()
        };
        Ok(Self {
            host: spec.host.trim().to_string(),
            port: spec.port,
            username: spec.username,
            password: spec.password.filter(|p| !p.is_empty()),
            private_key: spec.private_key.filter(|k| !k.trim().is_empty()),
            device_type,
            timeout: Duration::from_secs(spec.timeout),
        })
    }
}

impl From<&Credentials> for CredentialsSpec {
    fn from(c: &Credentials) -> Self {
        Self {
            host: c.host.clone(),
            port: c.port,
            username: c.username.clone(),
            password: c.password.clone(),
            private_key: c.private_key.clone(),
            device_type: c.device_type.clone(),
            timeout: c.timeout.as_secs(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("device_type", &self.device_type)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A command as supplied by the caller.
///
/// `None` fields are left for the device profile to fill; `Some` values are
/// caller overrides and survive resolution unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_expect_string(mut self, expect: impl Into<String>) -> Self {
        self.expect_string = Some(expect.into());
        self
    }

    pub fn with_delay_factor(mut self, delay_factor: f64) -> Self {
        self.delay_factor = Some(delay_factor);
        self
    }

    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = Some(max_loops);
        self
    }

    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand(index));
        }
        if let Some(delay) = self.delay_factor
            && !(delay > 0.0 && delay <= MAX_DELAY_FACTOR)
        {
            return Err(ValidationError::InvalidField {
                field: "delay_factor",
                reason: format!(
                    "command[{index}] delay_factor must be in (0, {MAX_DELAY_FACTOR}], got {delay}"
                ),
            });
        }
        if let Some(loops) = self.max_loops
            && !(1..=MAX_LOOPS_LIMIT).contains(&loops)
        {
            return Err(ValidationError::InvalidField {
                field: "max_loops",
                reason: format!(
                    "command[{index}] max_loops must be in 1..={MAX_LOOPS_LIMIT}, got {loops}"
                ),
            });
        }
        Ok(())
    }
}

/// One unit of work: one host, an ordered command list, a retry budget.
#[derive(Debug, Clone)]
pub struct CollectionTask {
    task_id: String,
    credentials: Credentials,
    commands: Vec<CommandSpec>,
    timeout: Duration,
    retry_count: u32,
}

impl CollectionTask {
    pub fn new(
        task_id: impl Into<String>,
        credentials: Credentials,
        commands: Vec<CommandSpec>,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<Self, ValidationError> {
        let task_id = task_id.into();
        if task_id.trim().is_empty() {
            return Err(ValidationError::EmptyTaskId);
        }
        if commands.is_empty() {
            return Err(ValidationError::NoCommands(task_id));
        }
        for (i, cmd) in commands.iter().enumerate() {
            cmd.validate(i)?;
        }
        if retry_count == 0 {
            return Err(ValidationError::ZeroRetryCount);
        }
        if timeout.is_zero() {
            return Err(ValidationError::InvalidField {
                field: "timeout",
                reason: format!("task {task_id} timeout must be positive"),
            });
        }
        Ok(Self {
            task_id,
            credentials,
            commands,
            timeout,
            retry_count,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Inbound task submission (HTTP body or queue payload).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskRequest {
    /// Generated when absent.
    #[serde(default)]
    pub task_id: Option<String>,
    pub credentials: CredentialsSpec,
    pub commands: Vec<CommandSpec>,
    /// Task timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl TaskRequest {
    /// Validates the request into a task, filling defaults from `settings`.
    pub fn into_task(self, settings: &CollectorSettings) -> Result<CollectionTask, ValidationError> {
        let credentials = Credentials::try_from(self.credentials)?;
        let task_id = match self.task_id {
            Some(id) if id.trim().is_empty() => return Err(ValidationError::EmptyTaskId),
            Some(id) => id,
            None => generate_task_id(),
        };
        CollectionTask::new(
            task_id,
            credentials,
            self.commands,
            Duration::from_secs(self.timeout.unwrap_or(settings.default_task_timeout_secs)),
            self.retry_count.unwrap_or(settings.default_retry_count),
        )
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-unique task id of the form `task_<unix_ms>_<seq>`.
pub fn generate_task_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("task_{ms}_{}", TASK_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of one command on a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub command: String,
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(command: impl Into<String>, output: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Category of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Validation,
    Connection,
    Command,
    PoolTimeout,
    TaskTimeout,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

/// Final result of one task. Produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskResult {
    pub task_id: String,
    pub host: String,
    pub success: bool,
    pub results: Vec<CommandResult>,
    pub total_commands: usize,
    pub success_commands: usize,
    pub failed_commands: usize,
    pub execution_time_secs: f64,
    /// Attempt that produced this result (0 when no attempt was made).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    /// A task whose connection succeeded. Individual commands may still have failed.
    pub fn completed(
        task_id: impl Into<String>,
        host: impl Into<String>,
        results: Vec<CommandResult>,
        attempt: u32,
        elapsed: Duration,
    ) -> Self {
        let total = results.len();
        let ok = results.iter().filter(|r| r.success).count();
        Self {
            task_id: task_id.into(),
            host: host.into(),
            success: true,
            results,
            total_commands: total,
            success_commands: ok,
            failed_commands: total - ok,
            execution_time_secs: elapsed.as_secs_f64(),
            attempt,
            error: None,
        }
    }

    /// A task that produced no usable session. Every requested command counts as failed.
    pub fn failed(
        task_id: impl Into<String>,
        host: impl Into<String>,
        kind: TaskErrorKind,
        message: impl Into<String>,
        total_commands: usize,
        attempt: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            host: host.into(),
            success: false,
            results: Vec::new(),
            total_commands,
            success_commands: 0,
            failed_commands: total_commands,
            execution_time_secs: elapsed.as_secs_f64(),
            attempt,
            error: Some(TaskError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// How a batch was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Serial,
    Parallel { workers: usize },
}

/// Aggregated results of one batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchResult {
    pub batch_id: String,
    /// True when at least one task succeeded, or the batch was empty.
    pub success: bool,
    pub total_tasks: usize,
    pub success_tasks: usize,
    pub failed_tasks: usize,
    pub total_commands: usize,
    pub success_commands: usize,
    pub failed_commands: usize,
    pub execution_time_secs: f64,
    pub mode: ExecutionMode,
    /// Completion order, not submission order.
    pub task_results: Vec<TaskResult>,
}

impl BatchResult {
    pub fn from_results(
        batch_id: impl Into<String>,
        task_results: Vec<TaskResult>,
        mode: ExecutionMode,
        elapsed: Duration,
    ) -> Self {
        let total_tasks = task_results.len();
        let success_tasks = task_results.iter().filter(|r| r.success).count();
        Self {
            batch_id: batch_id.into(),
            success: total_tasks == 0 || success_tasks > 0,
            total_tasks,
            success_tasks,
            failed_tasks: total_tasks - success_tasks,
            total_commands: task_results.iter().map(|r| r.total_commands).sum(),
            success_commands: task_results.iter().map(|r| r.success_commands).sum(),
            failed_commands: task_results.iter().map(|r| r.failed_commands).sum(),
            execution_time_secs: elapsed.as_secs_f64(),
            mode,
            task_results,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.task_id == task_id)
    }
}
