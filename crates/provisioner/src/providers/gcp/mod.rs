//! Google Cloud backend.
//!
//! ## Mapping
//!
//! - **Compartment**: a billing account with at least one project
//! - **Entry**: a project linked to that account with usable zones
//! - **Location**: a zone that is `UP` and lies in a known region
//!
//! Instances get the public key through `ssh-keys` metadata, a network
//! tag opened by a firewall rule, and a static address promoted from
//! their ephemeral one. They are bootstrapped as `ubuntu`.

mod client;
pub mod models;
mod provisioner;

pub use client::{connect, GcpApi, GcpClient, BILLING_BASE_URL, COMPUTE_BASE_URL};
pub use provisioner::{Gcp, GcpSettings};
