//! In-memory remote shell used by tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::remote::{CommandOutput, ConnectTarget, Connector, RemoteSession};
use crate::error::ShellError;
use crate::keys::SshKeyPair;

/// Scripted remote host: every command succeeds except an optional
/// failing or stalling one, and `sudo cat` returns the configured file.
#[derive(Clone)]
pub(crate) struct FakeRemote {
    config: String,
    fail_at: Option<(usize, String)>,
    stall_at: Option<usize>,
    executed: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl FakeRemote {
    pub(crate) fn new(config: &str) -> Self {
        Self {
            config: config.to_string(),
            fail_at: None,
            stall_at: None,
            executed: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the `index`-th command (zero based) exit 1 with `output`.
    pub(crate) fn failing_at(mut self, index: usize, output: &str) -> Self {
        self.fail_at = Some((index, output.to_string()));
        self
    }

    /// Make the `index`-th command (zero based) never return.
    pub(crate) fn stalling_at(mut self, index: usize) -> Self {
        self.stall_at = Some(index);
        self
    }

    pub(crate) fn executed(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.executed)
    }

    pub(crate) fn closed(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

#[async_trait]
impl RemoteSession for FakeRemote {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
        let index = {
            let mut executed = self.executed.lock().unwrap();
            executed.push(command.to_string());
            executed.len() - 1
        };

        if self.stall_at == Some(index) {
            std::future::pending::<()>().await;
        }
        if let Some((fail, output)) = &self.fail_at {
            if *fail == index {
                return Ok(CommandOutput {
                    status: 1,
                    output: output.clone(),
                });
            }
        }

        let output = if command.starts_with("sudo cat ") {
            self.config.clone()
        } else {
            String::new()
        };
        Ok(CommandOutput { status: 0, output })
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

enum Behaviour {
    Unreachable,
    WrongHostKey,
    ReachableAfter(usize, FakeRemote),
}

/// Connector with a scripted outcome.
pub(crate) struct FakeConnector {
    behaviour: Behaviour,
    attempts: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<ConnectTarget>>>,
}

impl FakeConnector {
    fn with(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            attempts: Arc::new(AtomicUsize::new(0)),
            targets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self::with(Behaviour::Unreachable)
    }

    pub(crate) fn wrong_host_key() -> Self {
        Self::with(Behaviour::WrongHostKey)
    }

    /// Refuse `failures` attempts, then hand out `remote`.
    pub(crate) fn reachable_after(failures: usize, remote: FakeRemote) -> Self {
        Self::with(Behaviour::ReachableAfter(failures, remote))
    }

    pub(crate) fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }

    pub(crate) fn targets(&self) -> Arc<Mutex<Vec<ConnectTarget>>> {
        Arc::clone(&self.targets)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _key: &SshKeyPair,
    ) -> Result<Box<dyn RemoteSession>, ShellError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.clone());

        match &self.behaviour {
            Behaviour::Unreachable => Err(ShellError::Connect("connection refused".into())),
            Behaviour::WrongHostKey => Err(ShellError::HostKeyMismatch {
                expected: "SHA256:pinned".into(),
                actual: "SHA256:other".into(),
            }),
            Behaviour::ReachableAfter(failures, _) if attempt < *failures => {
                Err(ShellError::Connect("connection refused".into()))
            }
            Behaviour::ReachableAfter(_, remote) => Ok(Box::new(remote.clone())),
        }
    }
}
