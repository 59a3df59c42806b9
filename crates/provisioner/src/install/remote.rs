//! Remote shell abstraction used by the installer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ShellError;
use crate::keys::SshKeyPair;

/// How the remote host's identity is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "fingerprint")]
pub enum HostKeyPolicy {
    /// Accept whatever key the host presents.
    #[default]
    AcceptAny,
    /// Require an OpenSSH style `SHA256:<base64>` fingerprint.
    Pinned(String),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Host name or IP address.
    pub address: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Per-attempt connect timeout.
    pub timeout: Duration,
    /// Host key verification policy.
    pub host_key: HostKeyPolicy,
}

/// Exit status and combined stdout/stderr of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status.
    pub status: i32,
    /// Combined output.
    pub output: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Opens authenticated remote shell sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt.
    async fn connect(
        &self,
        target: &ConnectTarget,
        key: &SshKeyPair,
    ) -> Result<Box<dyn RemoteSession>, ShellError>;
}

/// An established remote shell session.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a command to completion.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Close the session.
    async fn close(&mut self) {}
}
