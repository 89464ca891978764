use super::*;

use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use log::trace;
use regex::Regex;
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::prompt::{self, PromptMatcher};
use crate::profile::ConnectionParams;

/// Session inactivity limit when the profile does not set one.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for the paging toggle sent right after login.
const PAGING_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens interactive PTY shells over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    security: ConnectionSecurityOptions,
}

impl SshConnector {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        Self { security }
    }

    pub fn with_level(level: SecurityLevel) -> Self {
        Self::new(ConnectionSecurityOptions::for_level(level))
    }

    fn auth_method(credentials: &Credentials) -> AuthMethod {
        match (credentials.private_key(), credentials.password()) {
            (Some(key), _) if key.contains("-----BEGIN") => AuthMethod::with_key(key, None),
            (Some(path), _) => AuthMethod::with_key_file(path, None),
            (None, Some(password)) => AuthMethod::with_password(password),
            // Credentials cannot be built without one of the two.
            (None, None) => AuthMethod::with_password(""),
        }
    }
}

fn phase_timeout(
    profile: Option<&DeviceProfile>,
    pick: fn(&ConnectionParams) -> Option<u64>,
    fallback: Duration,
) -> Duration {
    profile
        .and_then(|p| pick(&p.connection_params))
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        profile: Option<Arc<DeviceProfile>>,
    ) -> Result<Box<dyn Shell>, ConnectionError> {
        let host = credentials.host();
        let device_addr = credentials.device_addr();
        let session_timeout = phase_timeout(
            profile.as_deref(),
            |c| c.session_timeout_secs,
            DEFAULT_SESSION_TIMEOUT,
        );
        let auth_timeout = phase_timeout(
            profile.as_deref(),
            |c| c.auth_timeout_secs,
            credentials.timeout(),
        );
        let banner_timeout = phase_timeout(
            profile.as_deref(),
            |c| c.banner_timeout_secs,
            credentials.timeout(),
        );

        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: Some(session_timeout),
            ..Default::default()
        };

        let login = Client::connect_with_config(
            (host.to_string(), credentials.port()),
            credentials.username(),
            Self::auth_method(credentials),
            self.security.server_check.clone(),
            config,
        );
        let client = tokio::time::timeout(auth_timeout, login)
            .await
            .map_err(|_| {
                ConnectionError::timeout(
                    host,
                    format!("not authenticated within {}s", auth_timeout.as_secs()),
                )
            })?
            .map_err(|e| ConnectionError::from_ssh(host, e))?;
        debug!("{} TCP connection successful", device_addr);

        let mut channel = client
            .get_channel()
            .await
            .map_err(|e| ConnectionError::from_ssh(host, e))?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await
            .map_err(|e| ConnectionError::from_russh(host, e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ConnectionError::from_russh(host, e))?;
        debug!("{} Shell request successful", device_addr);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_task_device_addr = device_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = receiver_from_user.recv() => match data {
                        Some(data) => {
                            if let Err(e) = channel.data(data.as_bytes()).await {
                                debug!("{} Failed to send data to shell: {:?}", io_task_device_addr, e);
                                break;
                            }
                        }
                        None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            let text = String::from_utf8_lossy(data).into_owned();
                            if sender_to_user.send(text).await.is_err() {
                                debug!("{} Shell output receiver dropped. Closing task.", io_task_device_addr);
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("{} Shell exited with status code: {}", io_task_device_addr, exit_status);
                            break;
                        }
                        Some(ChannelMsg::Eof) | None => {
                            debug!("{} Shell sent EOF.", io_task_device_addr);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
            let _ = channel.close().await;
            debug!("{} SSH I/O task ended.", io_task_device_addr);
        });

        let mut io = ShellIo::new(
            sender_to_shell,
            receiver_from_shell,
            PromptMatcher::for_profile(profile.as_deref()),
            device_addr,
        );
        io.await_banner(banner_timeout).await.map_err(|e| match e {
            CommandError::Timeout(_) => ConnectionError::timeout(
                host,
                format!("no prompt within {}s of login", banner_timeout.as_secs()),
            ),
            other => ConnectionError::unknown(host, format!("waiting for initial prompt: {other}")),
        })?;

        if let Some(disable) = profile
            .as_ref()
            .and_then(|p| p.paging_commands.disable_paging.clone())
        {
            io.disable_paging(&disable).await;
        }

        Ok(Box::new(SshShell { client, io }))
    }
}

/// The text side of a shell: a sender towards the device, a receiver of its
/// output and the prompt last seen.
struct ShellIo {
    sender: Sender<String>,
    recv: Receiver<String>,
    matcher: PromptMatcher,
    device_addr: String,
    prompt: String,
}

impl ShellIo {
    fn new(
        sender: Sender<String>,
        recv: Receiver<String>,
        matcher: PromptMatcher,
        device_addr: String,
    ) -> Self {
        Self {
            sender,
            recv,
            matcher,
            device_addr,
            prompt: String::new(),
        }
    }

    async fn send(&self, data: String) -> Result<(), CommandError> {
        self.sender
            .send(data)
            .await
            .map_err(|e| CommandError::Send(e.to_string()))
    }

    /// Reads until the buffer tail is a prompt, answering pager prompts.
    async fn read_until_prompt(&mut self, expect: Option<&Regex>) -> Result<String, CommandError> {
        let mut buffer = String::new();
        loop {
            let chunk = self.recv.recv().await.ok_or(CommandError::ChannelClosed)?;
            trace!("{:?}", chunk);
            buffer.push_str(&prompt::strip_ansi(&chunk));

            let tail = prompt::tail(&buffer);
            let tail_len = tail.len();
            if self.matcher.is_more(tail) {
                buffer.truncate(buffer.len() - tail_len);
                trace!("Pager prompt on {}, sending space", self.device_addr);
                self.send(" ".to_string()).await?;
                continue;
            }
            if self.matcher.ready(tail.trim_end_matches('\r'), expect) {
                return Ok(buffer);
            }
        }
    }

    /// Waits for the login banner to end in a prompt and remembers it.
    async fn await_banner(&mut self, limit: Duration) -> Result<(), CommandError> {
        let banner = tokio::time::timeout(limit, self.read_until_prompt(None))
            .await
            .map_err(|_| CommandError::Timeout(limit.as_secs_f64()))??;
        self.prompt = prompt::tail(&banner).trim().to_string();
        debug!("{} initial prompt: {:?}", self.device_addr, self.prompt);
        Ok(())
    }

    /// Sends the paging toggle. A failure is logged; the session stays usable.
    async fn disable_paging(&mut self, command: &str) -> bool {
        let result = async {
            self.send(format!("{command}\n")).await?;
            self.read_until_prompt(None).await
        };
        let outcome = tokio::time::timeout(PAGING_TIMEOUT, result).await;
        match outcome {
            Ok(Ok(_)) => {
                debug!("{} paging disabled via '{}'", self.device_addr, command);
                true
            }
            Ok(Err(e)) => {
                warn!("{} '{}' failed: {}", self.device_addr, command, e);
                false
            }
            Err(_) => {
                warn!("{} '{}' timed out", self.device_addr, command);
                false
            }
        }
    }

    async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
        // Drop residue from an earlier timed-out command.
        while self.recv.try_recv().is_ok() {}

        self.send(format!("{}\n", command.command)).await?;
        let expect = command.expect_string.as_deref().map(prompt::expect_regex);
        let raw = self.read_until_prompt(expect.as_ref()).await?;

        let tail = prompt::tail(&raw).trim();
        if !tail.is_empty() && tail != self.prompt {
            trace!("{} prompt changed to {:?}", self.device_addr, tail);
            self.prompt = tail.to_string();
        }

        let output = prompt::clean_output(&raw, &command.command);
        let device_error = self.matcher.find_error(&output);
        Ok(ShellOutput {
            output,
            device_error,
        })
    }
}

/// A live SSH shell channel with prompt tracking.
struct SshShell {
    client: Client,
    io: ShellIo,
}

#[async_trait]
impl Shell for SshShell {
    async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
        self.io.run(command).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        debug!("Safely closing SSH connection to {}...", self.io.device_addr);
        if !self.client.is_closed() {
            if let Err(e) = self.io.sender.send("exit\n".to_string()).await {
                debug!("Failed to send exit command: {:?}", e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.io.recv.close();
        // The client and I/O task shut down when the shell is dropped.
        Ok(())
    }
}
