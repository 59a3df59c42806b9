//! Bootstrap pipeline: connect with bounded retry, run the command
//! sequence, then read back the server configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::remote::{CommandOutput, ConnectTarget, Connector, HostKeyPolicy, RemoteSession};
use super::ssh::SshConnector;
use crate::error::{ProvisionError, ShellError};
use crate::keys::SshKeyPair;
use crate::model::ServerConfiguration;

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Configuration file written by the server package.
pub const SERVER_CONFIG_PATH: &str = "/opt/lantern/data/server.json";

/// Commands that turn a fresh Ubuntu instance into a running server.
pub const BOOTSTRAP_COMMANDS: [&str; 7] = [
    "sudo cloud-init status --wait",
    "sudo sh -c 'echo deb [trusted=yes] https://apt.fury.io/getlantern/ / > /etc/apt/sources.list.d/getlantern.list'",
    "sudo apt-get update -y -q",
    "sudo apt-get install -y lantern-server-manager sing-box-extensions fail2ban firewalld",
    "sudo firewall-cmd --add-port 22/tcp --permanent",
    "sudo systemctl restart systemd-journald",
    "sudo systemctl enable --now firewalld lantern-server-manager fail2ban sing-box-extensions",
];

/// Installer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    /// SSH port.
    pub port: u16,
    /// Retries after the first failed connection attempt.
    pub max_retries: u32,
    /// Fixed delay between connection attempts.
    pub retry_delay_secs: u64,
    /// Timeout of a single connection attempt.
    pub connect_timeout_secs: u64,
    /// Wait after the last command before reading the configuration.
    pub settle_delay_secs: u64,
    /// Remote path of the server configuration.
    pub config_path: String,
    /// Host key verification policy.
    pub host_key: HostKeyPolicy,
    /// Ordered bootstrap commands.
    pub commands: Vec<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            max_retries: 10,
            retry_delay_secs: 5,
            connect_timeout_secs: 30,
            settle_delay_secs: 5,
            config_path: SERVER_CONFIG_PATH.to_string(),
            host_key: HostKeyPolicy::AcceptAny,
            commands: BOOTSTRAP_COMMANDS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl InstallerSettings {
    /// Set the host key policy.
    #[must_use]
    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    /// Replace the command sequence.
    #[must_use]
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

/// Turns a reachable instance into a configured server.
#[derive(Clone)]
pub struct Installer {
    connector: Arc<dyn Connector>,
    settings: InstallerSettings,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Installer {
    /// Create an installer using `connector` for remote shells.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: InstallerSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Create an installer backed by libssh2.
    #[must_use]
    pub fn ssh(settings: InstallerSettings) -> Self {
        Self::new(Arc::new(SshConnector), settings)
    }

    /// Installer settings.
    #[must_use]
    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    /// Run the full bootstrap against `address`.
    ///
    /// # Errors
    /// Returns the first failure: connection, command, configuration read
    /// or parse, or cancellation.
    pub async fn install(
        &self,
        address: &str,
        user: &str,
        key: &SshKeyPair,
        cancel: &CancellationToken,
    ) -> Result<ServerConfiguration, ProvisionError> {
        info!(address = %address, user = %user, "Installing server");

        let mut session = self.connect(address, user, key, cancel).await?;
        let result = self.bootstrap(session.as_mut(), cancel).await;
        // A cancelled command may still hold the connection; drop it unclosed.
        if !matches!(result, Err(ProvisionError::Cancelled)) {
            session.close().await;
        }

        if result.is_ok() {
            info!(address = %address, "Server installed");
        }
        result
    }

    async fn bootstrap(
        &self,
        session: &mut dyn RemoteSession,
        cancel: &CancellationToken,
    ) -> Result<ServerConfiguration, ProvisionError> {
        self.run_commands(session, cancel).await?;
        pause(self.settings.settle_delay(), cancel).await?;
        self.read_server_config(session, cancel).await
    }

    /// Connect to `address`, retrying with a fixed delay.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Connection`] once all attempts failed,
    /// [`ProvisionError::HostKeyMismatch`] without retrying, or
    /// [`ProvisionError::Cancelled`].
    pub async fn connect(
        &self,
        address: &str,
        user: &str,
        key: &SshKeyPair,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, ProvisionError> {
        let target = ConnectTarget {
            address: address.to_string(),
            port: self.settings.port,
            user: user.to_string(),
            timeout: self.settings.connect_timeout(),
            host_key: self.settings.host_key.clone(),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                result = tokio::time::timeout(
                    target.timeout,
                    self.connector.connect(&target, key),
                ) => result.unwrap_or_else(|_| {
                    Err(ShellError::Connect(format!(
                        "timed out after {}s",
                        target.timeout.as_secs()
                    )))
                }),
            };

            match attempt {
                Ok(session) => {
                    debug!(address = %address, attempts, "SSH connection established");
                    return Ok(session);
                }
                Err(e) if !e.is_retryable() || attempts > self.settings.max_retries => {
                    return Err(give_up(address, attempts, e));
                }
                Err(e) => {
                    debug!(attempt = attempts, error = %e, "SSH connection failed, retrying...");
                    pause(self.settings.retry_delay(), cancel).await?;
                }
            }
        }
    }

    /// Run the command sequence, stopping at the first failure.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Command`] for the first command that
    /// cannot run or exits non-zero.
    pub async fn run_commands(
        &self,
        session: &mut dyn RemoteSession,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        for command in &self.settings.commands {
            let output = exec(session, command, cancel)
                .await?
                .map_err(|e| ProvisionError::Command {
                    command: command.clone(),
                    status: -1,
                    output: e.to_string(),
                })?;

            if !output.success() {
                return Err(ProvisionError::Command {
                    command: command.clone(),
                    status: output.status,
                    output: output.output,
                });
            }
            debug!(command = %command, output = %output.output.trim_end(), "Command output");
        }
        Ok(())
    }

    /// Read and parse the server configuration file.
    ///
    /// # Errors
    /// Returns [`ProvisionError::ConfigRead`] or
    /// [`ProvisionError::ConfigParse`].
    pub async fn read_server_config(
        &self,
        session: &mut dyn RemoteSession,
        cancel: &CancellationToken,
    ) -> Result<ServerConfiguration, ProvisionError> {
        let command = format!("sudo cat {}", self.settings.config_path);
        let output = exec(session, &command, cancel)
            .await?
            .map_err(|e| ProvisionError::ConfigRead(e.to_string()))?;

        if !output.success() {
            return Err(ProvisionError::ConfigRead(format!(
                "{} exited with status {}: {}",
                command,
                output.status,
                output.output.trim_end()
            )));
        }
        debug!(config = %output.output.trim_end(), "Config file contents");

        serde_json::from_str(&output.output).map_err(ProvisionError::ConfigParse)
    }
}

fn give_up(address: &str, attempts: u32, error: ShellError) -> ProvisionError {
    match error {
        ShellError::HostKeyMismatch { expected, actual } => ProvisionError::HostKeyMismatch {
            address: address.to_string(),
            expected,
            actual,
        },
        source => ProvisionError::Connection { attempts, source },
    }
}

async fn exec(
    session: &mut dyn RemoteSession,
    command: &str,
    cancel: &CancellationToken,
) -> Result<Result<CommandOutput, ShellError>, ProvisionError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProvisionError::Cancelled),
        result = session.exec(command) => Ok(result),
    }
}

/// Sleep for `delay` unless cancelled first.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), ProvisionError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ProvisionError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
