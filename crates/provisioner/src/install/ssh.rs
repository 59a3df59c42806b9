//! `ssh2` backed [`Connector`].
//!
//! libssh2 is blocking, so every call runs on the blocking pool. The
//! session timeout bounds the handshake and authentication only; bootstrap
//! commands such as `cloud-init status --wait` run for as long as they need.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ssh2::{ExtendedData, HashType, Session};
use tracing::{debug, warn};

use super::remote::{CommandOutput, ConnectTarget, Connector, HostKeyPolicy, RemoteSession};
use crate::error::ShellError;
use crate::keys::SshKeyPair;

/// Connects with libssh2 using public key authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        key: &SshKeyPair,
    ) -> Result<Box<dyn RemoteSession>, ShellError> {
        let target = target.clone();
        let pem = key.private_key_pem().to_owned();

        let session = tokio::task::spawn_blocking(move || open_session(&target, &pem))
            .await
            .map_err(|e| ShellError::Connect(e.to_string()))??;

        Ok(Box::new(SshSession {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

fn open_session(target: &ConnectTarget, private_key_pem: &str) -> Result<Session, ShellError> {
    let addr = (target.address.as_str(), target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ShellError::Connect(format!("no address for {}", target.address)))?;

    let tcp = TcpStream::connect_timeout(&addr, target.timeout)?;
    let mut session = bounded_session(target.timeout)?;
    session.set_tcp_stream(tcp);
    session.handshake()?;

    verify_host_key(&session, &target.host_key, &target.address)?;

    session.userauth_pubkey_memory(&target.user, None, private_key_pem, None)?;
    if !session.authenticated() {
        return Err(ShellError::Connect(format!(
            "public key rejected for user {}",
            target.user
        )));
    }

    release_timeout(&session);
    debug!(address = %target.address, user = %target.user, "SSH connection established");
    Ok(session)
}

fn bounded_session(timeout: Duration) -> Result<Session, ShellError> {
    let session = Session::new()?;
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    Ok(session)
}

/// Lift the setup timeout; zero means block until the call completes.
fn release_timeout(session: &Session) {
    session.set_timeout(0);
}

fn verify_host_key(
    session: &Session,
    policy: &HostKeyPolicy,
    address: &str,
) -> Result<(), ShellError> {
    match policy {
        HostKeyPolicy::AcceptAny => {
            warn!(address = %address, "Skipping host key verification");
            Ok(())
        }
        HostKeyPolicy::Pinned(expected) => {
            let actual = session
                .host_key_hash(HashType::Sha256)
                .map(|hash| format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)))
                .ok_or_else(|| ShellError::Connect("host key unavailable".to_string()))?;
            if &actual == expected {
                Ok(())
            } else {
                Err(ShellError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
        }
    }
}

struct SshSession {
    session: Arc<Mutex<Session>>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
        let session = Arc::clone(&self.session);
        let command = command.to_owned();

        tokio::task::spawn_blocking(move || {
            let session = session.lock().unwrap_or_else(PoisonError::into_inner);
            run_command(&session, &command)
        })
        .await
        .map_err(|e| ShellError::Connect(e.to_string()))?
    }

    async fn close(&mut self) {
        let session = Arc::clone(&self.session);
        let closed = tokio::task::spawn_blocking(move || {
            // An abandoned command still holds the lock; drop without a goodbye.
            let session = match session.try_lock() {
                Ok(session) => session,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return None,
            };
            Some(session.disconnect(None, "bootstrap finished", None))
        })
        .await;
        match closed {
            Ok(Some(Err(e))) => debug!(error = %e, "SSH disconnect failed"),
            Ok(None) => debug!("SSH session busy, dropping without disconnect"),
            _ => {}
        }
    }
}

fn run_command(session: &Session, command: &str) -> Result<CommandOutput, ShellError> {
    let mut channel = session.channel_session()?;
    channel.handle_extended_data(ExtendedData::Merge)?;
    channel.exec(command)?;

    let mut raw = Vec::new();
    channel.read_to_end(&mut raw)?;
    channel.wait_close()?;

    Ok(CommandOutput {
        status: channel.exit_status()?,
        output: String::from_utf8_lossy(&raw).into_owned(),
    })
}
