//! SSH session execution.
//!
//! A [`SessionExecutor`] owns at most one live session to one device. It
//! connects, runs an ordered list of commands one at a time (each resolved
//! against the device profile first) and always disconnects.
//!
//! # Main Components
//!
//! - [`Connector`] / [`Shell`] - transport seam; [`SshConnector`] is the real one
//! - [`SessionExecutor`] - per-attempt session state machine
//! - [`PromptMatcher`] - prompt, pager and error detection

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, ConnectFailure, ConnectionError};
use crate::profile::{DeviceProfile, ProfileLookup};
use crate::resolver::{CommandResolver, EffectiveCommand};
use crate::task::{CommandResult, CommandSpec, Credentials};

pub use prompt::PromptMatcher;
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::SshConnector;

mod prompt;
mod security;
mod ssh;

/// Upper bound for closing a shell; a hung close must not hold the task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a shell returns for one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellOutput {
    pub output: String,
    /// First output line matching a profile error pattern, if any.
    pub device_error: Option<String>,
}

/// Opens shells. Implemented by [`SshConnector`] and by test doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        profile: Option<Arc<DeviceProfile>>,
    ) -> Result<Box<dyn Shell>, ConnectionError>;
}

/// One interactive session on a device.
#[async_trait]
pub trait Shell: Send {
    /// Runs one command and reads until the device is back at a prompt.
    async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError>;

    /// Closes the session. Called at most once by the executor.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Session lifecycle: `Disconnected -> Connecting -> Connected -> Executing -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Executing,
}

/// Runs commands on one device over one session.
///
/// Owned by exactly one attempt; never shared across tasks.
pub struct SessionExecutor {
    connector: Arc<dyn Connector>,
    profiles: Arc<dyn ProfileLookup>,
    cancel: CancellationToken,
    state: SessionState,
    shell: Option<Box<dyn Shell>>,
    host: String,
    device_type: String,
}

impl SessionExecutor {
    pub fn new(
        connector: Arc<dyn Connector>,
        profiles: Arc<dyn ProfileLookup>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            profiles,
            cancel,
            state: SessionState::Disconnected,
            shell: None,
            host: String::new(),
            device_type: String::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.shell.is_some()
    }

    /// Opens the session.
    ///
    /// Credentials are validated before any network I/O. The attempt is
    /// bounded by the credentials timeout and aborted by cancellation.
    pub async fn connect(&mut self, credentials: &Credentials) -> Result<(), ConnectFailure> {
        if self.shell.is_some() {
            return Err(ConnectFailure::AlreadyConnected);
        }
        credentials.validate()?;

        self.state = SessionState::Connecting;
        self.host = credentials.host().to_string();
        self.device_type = credentials.device_type().to_string();
        let profile = self.profiles.get_profile(credentials.device_type());
        if profile.is_none() {
            debug!(
                "No device profile for '{}', using generic defaults",
                credentials.device_type()
            );
        }

        info!("Connecting to {}", credentials.device_addr());
        let timeout = credentials.timeout();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectFailure::Cancelled),
            res = tokio::time::timeout(timeout, self.connector.connect(credentials, profile)) => {
                match res {
                    Ok(Ok(shell)) => Ok(shell),
                    Ok(Err(e)) => Err(ConnectFailure::Connection(e)),
                    Err(_) => Err(ConnectFailure::Connection(ConnectionError::timeout(
                        credentials.host(),
                        format!("no session within {:.1}s", timeout.as_secs_f64()),
                    ))),
                }
            }
        };

        match result {
            Ok(shell) => {
                self.shell = Some(shell);
                self.state = SessionState::Connected;
                info!("Connected to {}", credentials.device_addr());
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                warn!("Connection to {} failed: {}", credentials.device_addr(), e);
                Err(e)
            }
        }
    }

    /// Resolves and runs one command. A failure is recorded, not raised.
    pub async fn execute_command(&mut self, spec: &CommandSpec) -> CommandResult {
        let effective = CommandResolver::new(self.profiles.as_ref()).resolve(spec, &self.device_type);
        self.execute_effective(&effective).await
    }

    /// Resolves every command against the session's device type, then runs them in order.
    ///
    /// Once cancelled, the remaining commands are recorded as cancelled without
    /// touching the device.
    pub async fn execute_all(&mut self, specs: &[CommandSpec]) -> Vec<CommandResult> {
        let effective =
            CommandResolver::new(self.profiles.as_ref()).resolve_all(specs, &self.device_type);
        let total = effective.len();
        let mut results = Vec::with_capacity(total);
        for (i, cmd) in effective.iter().enumerate() {
            if self.cancel.is_cancelled() {
                results.push(CommandResult::failed(&cmd.command, "", CommandError::Cancelled));
                continue;
            }
            info!("{} command {}/{}: {}", self.host, i + 1, total, cmd.command);
            let result = self.execute_effective(cmd).await;
            if let Some(err) = result.error.as_ref() {
                warn!("{} command '{}' failed, continuing: {}", self.host, cmd.command, err);
            }
            results.push(result);
        }
        results
    }

    async fn execute_effective(&mut self, cmd: &EffectiveCommand) -> CommandResult {
        let Some(shell) = self.shell.as_mut() else {
            return CommandResult::failed(&cmd.command, "", CommandError::NotConnected);
        };
        self.state = SessionState::Executing;
        let read_timeout = cmd.read_timeout();
        debug!(
            "Executing '{}' (expect={:?}, delay_factor={}, max_loops={}, budget={:.1}s)",
            cmd.command,
            cmd.expect_string,
            cmd.delay_factor,
            cmd.max_loops,
            read_timeout.as_secs_f64()
        );

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
            res = tokio::time::timeout(read_timeout, shell.run(cmd)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(CommandError::Timeout(read_timeout.as_secs_f64())),
            },
        };
        self.state = SessionState::Connected;

        match outcome {
            Ok(ShellOutput {
                output,
                device_error: None,
            }) => {
                debug!("'{}' returned {} bytes", cmd.command, output.len());
                CommandResult::ok(&cmd.command, output)
            }
            Ok(ShellOutput {
                output,
                device_error: Some(line),
            }) => CommandResult::failed(&cmd.command, output, CommandError::DeviceError(line)),
            Err(e) => CommandResult::failed(&cmd.command, "", e),
        }
    }

    /// Closes the session if one is open. Idempotent; errors are logged and swallowed.
    pub async fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        let Some(mut shell) = self.shell.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shell.close()).await {
            Ok(Ok(())) => info!("Disconnected from {}", self.host),
            Ok(Err(e)) => warn!("Error while disconnecting from {}: {}", self.host, e),
            Err(_) => warn!("Disconnect from {} timed out; dropping session", self.host),
        }
    }
}

impl Drop for SessionExecutor {
    fn drop(&mut self) {
        if self.shell.is_some() {
            warn!(
                "Session to {} dropped while connected; transport closes on drop",
                self.host
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileRegistry;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        closes: AtomicUsize,
        seen: Mutex<Vec<EffectiveCommand>>,
    }

    struct RecordingShell(Arc<Recorder>);

    #[async_trait]
    impl Shell for RecordingShell {
        async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
            self.0.seen.lock().push(command.clone());
            match command.command.as_str() {
                "bad" => Ok(ShellOutput {
                    output: "Error: Unrecognized command".to_string(),
                    device_error: Some("Error: Unrecognized command".to_string()),
                }),
                "hang" => std::future::pending().await,
                other => Ok(ShellOutput {
                    output: format!("out:{other}"),
                    device_error: None,
                }),
            }
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("transport already gone")
        }
    }

    struct RecordingConnector(Arc<Recorder>);

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(
            &self,
            _credentials: &Credentials,
            _profile: Option<Arc<DeviceProfile>>,
        ) -> Result<Box<dyn Shell>, ConnectionError> {
            Ok(Box::new(RecordingShell(self.0.clone())))
        }
    }

    fn executor(recorder: &Arc<Recorder>, cancel: CancellationToken) -> SessionExecutor {
        SessionExecutor::new(
            Arc::new(RecordingConnector(recorder.clone())),
            Arc::new(ProfileRegistry::builtin()),
            cancel,
        )
    }

    fn huawei() -> Credentials {
        Credentials::with_password("10.0.0.1", "admin", "pw")
            .unwrap()
            .for_device_type("huawei")
    }

    #[tokio::test]
    async fn commands_run_in_order_and_failures_do_not_abort() {
        let recorder = Arc::new(Recorder::default());
        let mut session = executor(&recorder, CancellationToken::new());
        session.connect(&huawei()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let results = session
            .execute_all(&[
                CommandSpec::new("display version"),
                CommandSpec::new("bad"),
                CommandSpec::new("display clock"),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("Unrecognized"));
        assert!(results[2].success);

        let seen = recorder.seen.lock();
        assert_eq!(seen[0].max_loops, 500);
        assert_eq!(seen[0].delay_factor, 2.0);
        assert_eq!(seen[2].max_loops, 1000);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_swallows_errors() {
        let recorder = Arc::new(Recorder::default());
        let mut session = executor(&recorder, CancellationToken::new());
        session.connect(&huawei()).await.unwrap();

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn command_without_connection_is_a_failed_result() {
        let recorder = Arc::new(Recorder::default());
        let mut session = executor(&recorder, CancellationToken::new());
        let result = session.execute_command(&CommandSpec::new("display version")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("session not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_times_out_from_its_loop_budget() {
        let recorder = Arc::new(Recorder::default());
        let mut session = executor(&recorder, CancellationToken::new());
        session.connect(&huawei()).await.unwrap();

        let spec = CommandSpec::new("hang").with_max_loops(10).with_delay_factor(1.0);
        let result = session.execute_command(&spec).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out after 6.0s"));
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn profile_read_timeout_caps_a_long_loop_budget() {
        let mut profile = crate::profile::builtin::linux();
        profile.connection_params.read_timeout_secs = Some(3);
        let profiles = ProfileRegistry::empty();
        profiles.load(Arc::new(crate::profile::StaticSource::new(vec![profile])));

        let recorder = Arc::new(Recorder::default());
        let mut session = SessionExecutor::new(
            Arc::new(RecordingConnector(recorder.clone())),
            Arc::new(profiles),
            CancellationToken::new(),
        );
        let creds = Credentials::with_password("10.0.0.2", "root", "pw").unwrap();
        session.connect(&creds).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = session.execute_command(&CommandSpec::new("hang")).await;

        assert_eq!(result.error.as_deref(), Some("command timed out after 3.0s"));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_command_and_skips_rest() {
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let mut session = executor(&recorder, cancel.clone());
        session.connect(&huawei()).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let results = session
            .execute_all(&[CommandSpec::new("hang"), CommandSpec::new("display version")])
            .await;
        session.disconnect().await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.as_deref() == Some("command cancelled")));
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_connect_is_rejected_while_connected() {
        let recorder = Arc::new(Recorder::default());
        let mut session = executor(&recorder, CancellationToken::new());
        let creds = Credentials::with_password("10.0.0.1", "admin", "pw").unwrap();
        session.connect(&creds).await.unwrap();
        assert!(matches!(
            session.connect(&creds).await,
            Err(ConnectFailure::AlreadyConnected)
        ));
        session.disconnect().await;
    }
}
