//! Cloud backends.

pub mod digitalocean;
pub mod gcp;

use crate::config::{ProviderKind, ProvisionerConfig};
use crate::install::Installer;
use crate::oauth::{start_oauth, OAuthFlow};
use crate::provider::Provisioner;
use crate::session::Session;

pub use digitalocean::DigitalOcean;
pub use gcp::Gcp;

/// Construct the backend selected by `config.provider` on `session`.
#[must_use]
pub fn build(
    config: &ProvisionerConfig,
    session: Session,
    installer: Installer,
) -> Box<dyn Provisioner> {
    match config.provider {
        ProviderKind::DigitalOcean => Box::new(DigitalOcean::new(
            session,
            config.digitalocean.clone(),
            installer,
            config.rollback_on_failure,
        )),
        ProviderKind::Gcp => Box::new(Gcp::new(
            session,
            config.gcp.clone(),
            installer,
            config.rollback_on_failure,
        )),
    }
}

/// Create a session, start its OAuth phase and return the configured
/// backend bound to it. Must be called within a Tokio runtime.
#[must_use]
pub fn provisioner_for(config: &ProvisionerConfig, oauth: OAuthFlow) -> Box<dyn Provisioner> {
    let session = Session::new();
    let installer = Installer::ssh(config.installer.clone());
    let provisioner = build(config, session.clone(), installer);
    start_oauth(&session, oauth);
    provisioner
}
