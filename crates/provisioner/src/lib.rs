//! Provision a cloud instance and bootstrap it into a running proxy server.
//!
//! A provisioning attempt is a [`Session`]: an ordered stream of events
//! covering three phases (OAuth, validation, provisioning). A
//! [`Provisioner`] backend publishes those events; the caller consumes
//! them and triggers the next phase.
//!
//! # Example
//!
//! ```rust,ignore
//! use provisioner::{drive, provisioner_for, OAuthFlow, Outcome, PresetSelector, Preferences};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = provisioner::ProvisionerConfig::default();
//!     let backend = provisioner_for(&config, OAuthFlow::with_token("dop_v1_..."));
//!
//!     let selector = PresetSelector(Preferences {
//!         entry: Some("my-project".into()),
//!         location: Some("ams3".into()),
//!         ..Preferences::default()
//!     });
//!     if let Outcome::Provisioned(server) = drive(backend.as_ref(), &selector, None).await? {
//!         println!("{}", server.encode()?);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod install;
pub mod keys;
pub mod model;
pub mod oauth;
pub mod provider;
pub mod providers;
pub mod rollback;
pub mod session;
pub mod workflow;

pub use config::{ProviderKind, ProvisionerConfig};
pub use error::{CloudError, ProvisionError, ShellError};
pub use model::{CloudLocation, Compartment, CompartmentEntry, GeoLocation, ServerConfiguration};
pub use oauth::{OAuthFlow, TokenSource};
pub use provider::Provisioner;
pub use providers::{provisioner_for, DigitalOcean, Gcp};
pub use session::{Event, EventKind, Session};
pub use workflow::{
    choose_target, drive, run, Outcome, Preferences, PresetSelector, Selection, Selector,
};
