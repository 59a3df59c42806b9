//! `DigitalOcean` backend.
//!
//! ## Mapping
//!
//! - **Compartment**: the account behind the token (uuid / email)
//! - **Entry**: a project
//! - **Location**: an available region whose slug starts with a known
//!   city code (`nyc1` is New York City)
//!
//! Droplets are created with a freshly registered SSH key and bootstrapped
//! as `root`.

mod client;
pub mod models;
mod provisioner;

pub use client::{connect, DigitalOceanApi, DigitalOceanClient, API_BASE_URL};
pub use provisioner::{DigitalOcean, DigitalOceanSettings};
