//! Remote bootstrap installer.
//!
//! Turns a freshly created instance into a running server using only
//! SSH access authenticated with a single-use key pair:
//!
//! 1. Connect to `address:22`, retrying every 5s up to 10 times while the
//!    instance finishes booting
//! 2. Run the bootstrap commands in order, stopping at the first failure
//! 3. Wait for services to settle
//! 4. Read and parse `/opt/lantern/data/server.json`

mod installer;
mod remote;
mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use installer::pause;
pub use installer::{
    Installer, InstallerSettings, BOOTSTRAP_COMMANDS, SERVER_CONFIG_PATH, SSH_PORT,
};
pub use remote::{CommandOutput, ConnectTarget, Connector, HostKeyPolicy, RemoteSession};
pub use ssh::SshConnector;
