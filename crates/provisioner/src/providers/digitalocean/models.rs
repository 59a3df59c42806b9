//! `DigitalOcean` API request/response models.

use serde::{Deserialize, Serialize};

use crate::model::{
    CloudLocation, GeoLocation, AMSTERDAM, BANGALORE, FRANKFURT, LONDON, NEW_YORK_CITY,
    SAN_FRANCISCO, SINGAPORE, SYDNEY, TORONTO,
};

/// Account status that blocks resource creation.
pub const ACCOUNT_STATUS_LOCKED: &str = "locked";

/// Droplet status once it has booted.
pub const DROPLET_STATUS_ACTIVE: &str = "active";

/// `DigitalOcean` account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Account {
    /// Account UUID.
    pub uuid: String,
    /// Account email.
    pub email: String,
    /// Maximum number of droplets.
    #[serde(default)]
    pub droplet_limit: u32,
    /// Whether the email is verified.
    #[serde(default)]
    pub email_verified: bool,
    /// `active`, `warning` or `locked`.
    pub status: String,
    /// Explanation of the status.
    #[serde(default)]
    pub status_message: String,
}

/// Response wrapper for the account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    /// Account.
    pub account: Account,
}

/// `DigitalOcean` project.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Project {
    /// Project ID.
    pub id: String,
    /// Owner UUID.
    #[serde(default)]
    pub owner_uuid: String,
    /// Project name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Purpose.
    #[serde(default)]
    pub purpose: String,
    /// Environment.
    #[serde(default)]
    pub environment: String,
    /// Whether this is the default project.
    #[serde(default)]
    pub is_default: bool,
}

/// Response wrapper for project list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectListResponse {
    /// Projects.
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Links.
    #[serde(default)]
    pub links: Links,
}

/// Request to assign resources to a project.
#[derive(Debug, Clone, Serialize)]
pub struct AssignResourcesRequest {
    /// Resource URNs, e.g. `do:droplet:42`.
    pub resources: Vec<String>,
}

/// `DigitalOcean` region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Region {
    /// Region slug, e.g. `nyc1`.
    pub slug: String,
    /// Region name.
    pub name: String,
    /// Available sizes.
    #[serde(default)]
    pub sizes: Vec<String>,
    /// Whether new droplets can be created here.
    pub available: bool,
    /// Supported features.
    #[serde(default)]
    pub features: Vec<String>,
}

impl CloudLocation for Region {
    fn id(&self) -> &str {
        &self.slug
    }

    fn location(&self) -> Option<&'static GeoLocation> {
        let city = self.slug.get(..3)?.to_ascii_lowercase();
        match city.as_str() {
            "ams" => Some(&AMSTERDAM),
            "blr" => Some(&BANGALORE),
            "fra" => Some(&FRANKFURT),
            "lon" => Some(&LONDON),
            "nyc" => Some(&NEW_YORK_CITY),
            "sfo" => Some(&SAN_FRANCISCO),
            "sgp" => Some(&SINGAPORE),
            "syd" => Some(&SYDNEY),
            "tor" => Some(&TORONTO),
            _ => None,
        }
    }
}

/// Response wrapper for region list.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionListResponse {
    /// Regions.
    #[serde(default)]
    pub regions: Vec<Region>,
    /// Links.
    #[serde(default)]
    pub links: Links,
}

/// Pagination links.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    /// Page links.
    #[serde(default)]
    pub pages: Option<Pages>,
}

impl Links {
    /// URL of the next page, if any.
    #[must_use]
    pub fn next(&self) -> Option<&str> {
        self.pages.as_ref().and_then(|p| p.next.as_deref())
    }
}

/// Page links.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pages {
    /// Next page URL.
    pub next: Option<String>,
    /// Last page URL.
    pub last: Option<String>,
}

/// `DigitalOcean` droplet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Droplet {
    /// Droplet ID.
    pub id: u64,
    /// Droplet name.
    pub name: String,
    /// `new`, `active`, `off` or `archive`.
    pub status: String,
    /// Networks.
    #[serde(default)]
    pub networks: Networks,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Droplet {
    /// First public IPv4 address.
    #[must_use]
    pub fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|ip| ip.address_type == "public")
            .map(|ip| ip.ip_address.as_str())
    }

    /// Whether the droplet has booted and can be reached.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == DROPLET_STATUS_ACTIVE && self.public_ipv4().is_some()
    }
}

/// Droplet networks.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Networks {
    /// IPv4 addresses.
    #[serde(default)]
    pub v4: Vec<NetworkAddress>,
    /// IPv6 addresses.
    #[serde(default)]
    pub v6: Vec<NetworkAddress>,
}

/// Network address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkAddress {
    /// IP address.
    pub ip_address: String,
    /// `public` or `private`.
    #[serde(rename = "type")]
    pub address_type: String,
}

/// Response wrapper for a single droplet.
#[derive(Debug, Clone, Deserialize)]
pub struct DropletResponse {
    /// Droplet.
    pub droplet: Droplet,
}

/// Request to create a droplet.
#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    /// Droplet name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// Size slug.
    pub size: String,
    /// Image slug.
    pub image: String,
    /// SSH key IDs.
    pub ssh_keys: Vec<u64>,
    /// Tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Registered SSH key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshKey {
    /// Key ID.
    pub id: u64,
    /// Key fingerprint.
    pub fingerprint: String,
    /// Key name.
    pub name: String,
    /// Public key.
    pub public_key: String,
}

/// Response wrapper for a single SSH key.
#[derive(Debug, Clone, Deserialize)]
pub struct SshKeyResponse {
    /// SSH key.
    pub ssh_key: SshKey,
}

/// Request to register an SSH key.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSshKeyRequest {
    /// Key name.
    pub name: String,
    /// Public key in authorized-keys format.
    pub public_key: String,
}
