#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcollector::collector::Collector;
use rcollector::config::CollectorSettings;
use rcollector::error::{CommandError, ConnectionError};
use rcollector::lifecycle::MemorySink;
use rcollector::profile::{DeviceProfile, ProfileRegistry};
use rcollector::resolver::EffectiveCommand;
use rcollector::session::{Connector, Shell, ShellOutput};
use rcollector::task::{CommandSpec, CredentialsSpec, TaskRequest};

/// How one fake host behaves.
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    /// Connects that fail before one succeeds (`u32::MAX` never succeeds).
    pub failing_connects: u32,
    pub command_delay: Duration,
    /// Every command blocks until cancelled.
    pub hang: bool,
}

#[derive(Default)]
pub struct Lab {
    scripts: Mutex<HashMap<String, HostScript>>,
    connect_attempts: Mutex<HashMap<String, u32>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// `host:command` in execution order.
    pub executed: Mutex<Vec<String>>,
    pub effective: Mutex<Vec<EffectiveCommand>>,
}

impl Lab {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, host: &str, script: HostScript) {
        self.scripts.lock().insert(host.to_string(), script);
    }

    pub fn attempts(&self, host: &str) -> u32 {
        self.connect_attempts.lock().get(host).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct LabConnector(pub Arc<Lab>);

#[async_trait]
impl Connector for LabConnector {
    async fn connect(
        &self,
        credentials: &rcollector::task::Credentials,
        _profile: Option<Arc<DeviceProfile>>,
    ) -> Result<Box<dyn Shell>, ConnectionError> {
        let host = credentials.host().to_string();
        let script = self.0.scripts.lock().get(&host).cloned().unwrap_or_default();
        let attempt = {
            let mut attempts = self.0.connect_attempts.lock();
            let n = attempts.entry(host.clone()).or_default();
            *n += 1;
            *n
        };
        if attempt <= script.failing_connects {
            return Err(ConnectionError::unreachable(&host, "connection refused"));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LabShell {
            lab: self.0.clone(),
            host,
            script,
        }))
    }
}

struct LabShell {
    lab: Arc<Lab>,
    host: String,
    script: HostScript,
}

#[async_trait]
impl Shell for LabShell {
    async fn run(&mut self, command: &EffectiveCommand) -> Result<ShellOutput, CommandError> {
        self.lab.effective.lock().push(command.clone());
        if self.script.hang {
            std::future::pending::<()>().await;
        }
        if !self.script.command_delay.is_zero() {
            tokio::time::sleep(self.script.command_delay).await;
        }
        self.lab
            .executed
            .lock()
            .push(format!("{}:{}", self.host, command.command));
        if command.command.starts_with("bogus") {
            return Ok(ShellOutput {
                output: "Error: Unrecognized command found at '^' position.".to_string(),
                device_error: Some("Error: Unrecognized command found at '^' position.".to_string()),
            });
        }
        Ok(ShellOutput {
            output: format!("{} output of {}", self.host, command.command),
            device_error: None,
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.lab.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn collector(lab: &Arc<Lab>, settings: CollectorSettings) -> (Collector, MemorySink) {
    let sink = MemorySink::new();
    let collector = Collector::with_components(
        settings,
        Arc::new(ProfileRegistry::builtin()),
        Arc::new(LabConnector(lab.clone())),
        Arc::new(sink.clone()),
    )
    .expect("valid settings");
    (collector, sink)
}

pub fn credentials(host: &str) -> CredentialsSpec {
    CredentialsSpec {
        host: host.to_string(),
        port: 22,
        username: "admin".to_string(),
        password: Some("secret".to_string()),
        private_key: None,
        device_type: "linux".to_string(),
        timeout: 30,
    }
}

pub fn request(task_id: &str, host: &str, commands: &[&str]) -> TaskRequest {
    TaskRequest {
        task_id: Some(task_id.to_string()),
        credentials: credentials(host),
        commands: commands.iter().map(|c| CommandSpec::new(*c)).collect(),
        timeout: None,
        retry_count: Some(1),
    }
}
