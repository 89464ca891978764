//! Error types for task validation, SSH connection and command execution.
//!
//! Errors below the task boundary (connection, command, pool timeout) are
//! captured into [`crate::task::TaskResult`] fields by the retry controller
//! and the worker pool. Only [`CollectorError`] reaches callers of the facade.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed task, credentials or command input.
///
/// Raised before any network activity and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host is required")]
    MissingHost,

    #[error("username is required")]
    MissingUsername,

    /// Neither a password nor a private key was supplied.
    #[error("password or private_key is required")]
    MissingAuth,

    #[error("task {0} has no commands")]
    NoCommands(String),

    #[error("command[{0}] is empty")]
    EmptyCommand(usize),

    #[error("task_id must not be empty")]
    EmptyTaskId,

    #[error("retry_count must be at least 1")]
    ZeroRetryCount,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Auth,
    Timeout,
    Unreachable,
    Unknown,
}

/// A failed connection attempt. Retried by the retry controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ssh connection {kind:?} error for {host}: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub host: String,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn auth(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Auth, host, message)
    }

    pub fn timeout(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Timeout, host, message)
    }

    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Unreachable, host, message)
    }

    pub fn unknown(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Unknown, host, message)
    }

    /// Classifies an async-ssh2-tokio failure.
    pub fn from_ssh(host: &str, err: async_ssh2_tokio::Error) -> Self {
        match err {
            async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
                Self::auth(host, err.to_string())
            }
            async_ssh2_tokio::Error::AddressInvalid(e) => Self::unreachable(host, e.to_string()),
            async_ssh2_tokio::Error::SshError(e) => Self::from_russh(host, e),
            other => Self::unknown(host, other.to_string()),
        }
    }

    /// Classifies a russh failure raised while opening the shell channel.
    pub fn from_russh(host: &str, err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => Self::unreachable(host, e.to_string()),
            russh::Error::ConnectionTimeout | russh::Error::InactivityTimeout => {
                Self::timeout(host, err.to_string())
            }
            russh::Error::NotAuthenticated => Self::auth(host, err.to_string()),
            other => Self::unknown(host, other.to_string()),
        }
    }
}

/// Why [`crate::session::SessionExecutor::connect`] did not produce a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("connect cancelled")]
    Cancelled,

    #[error("session already connected")]
    AlreadyConnected,
}

impl ConnectFailure {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// A single command failed on a live connection.
///
/// Recorded on the command result; never aborts the remaining commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("command timed out after {0:.1}s")]
    Timeout(f64),

    #[error("device reported an error: {0}")]
    DeviceError(String),

    #[error("channel closed while waiting for prompt")]
    ChannelClosed,

    #[error("command cancelled")]
    Cancelled,

    #[error("session not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// A dispatched task did not finish within the pool-wide timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {task_id} did not finish within {timeout_secs}s pool timeout")]
pub struct PoolTimeoutError {
    pub task_id: String,
    pub timeout_secs: u64,
}

/// Anything uncaught below the task boundary (panics included).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown error: {0}")]
pub struct UnknownError(pub String);

/// Top-level error returned to callers of the crate.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A one-shot session could not be opened.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectFailure),

    #[error("profile source error: {0}")]
    ProfileSource(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
