//! GCP API request and response models.

use serde::{Deserialize, Serialize};

use crate::model::{
    CloudLocation, GeoLocation, AMSTERDAM, FRANKFURT, LONDON, LOS_ANGELES, MUMBAI, SAO_PAULO,
    SINGAPORE, SYDNEY, TOKYO, TORONTO,
};

/// Zone status that accepts new instances.
pub const ZONE_STATUS_UP: &str = "UP";

/// Instance status once it has booted.
pub const INSTANCE_STATUS_RUNNING: &str = "RUNNING";

// ============================================================================
// Cloud Billing types
// ============================================================================

/// Billing account.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingAccount {
    /// Resource name, e.g. `billingAccounts/012345-567890-ABCDEF`.
    pub name: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Whether the account can pay for resources.
    #[serde(default)]
    pub open: bool,
}

/// Billing account list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingAccountListResponse {
    /// Billing accounts.
    #[serde(default)]
    pub billing_accounts: Vec<BillingAccount>,
    /// Token for the next page.
    pub next_page_token: Option<String>,
}

/// Billing state of a project.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBillingInfo {
    /// Resource name, e.g. `projects/my-project/billingInfo`.
    #[serde(default)]
    pub name: String,
    /// Project ID.
    pub project_id: String,
    /// Billing account paying for the project.
    #[serde(default)]
    pub billing_account_name: String,
    /// Whether billing is enabled.
    #[serde(default)]
    pub billing_enabled: bool,
}

/// Projects linked to a billing account.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBillingInfoListResponse {
    /// Billing info per project.
    #[serde(default)]
    pub project_billing_info: Vec<ProjectBillingInfo>,
    /// Token for the next page.
    pub next_page_token: Option<String>,
}

// ============================================================================
// Compute Engine types
// ============================================================================

/// Compute Engine zone.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    /// Zone name, e.g. `us-west2-a`.
    pub name: String,
    /// Region (URL).
    #[serde(default)]
    pub region: String,
    /// `UP` or `DOWN`.
    pub status: String,
}

impl Zone {
    /// Whether instances can be created in this zone.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.status == ZONE_STATUS_UP
    }
}

impl CloudLocation for Zone {
    fn id(&self) -> &str {
        &self.name
    }

    fn location(&self) -> Option<&'static GeoLocation> {
        match zone_to_region(&self.name) {
            "europe-west4" => Some(&AMSTERDAM),
            "europe-west3" => Some(&FRANKFURT),
            "europe-west2" => Some(&LONDON),
            "us-west2" => Some(&LOS_ANGELES),
            "northamerica-northeast2" => Some(&TORONTO),
            "asia-southeast1" => Some(&SINGAPORE),
            "australia-southeast1" => Some(&SYDNEY),
            "asia-northeast1" => Some(&TOKYO),
            "asia-south1" => Some(&MUMBAI),
            "southamerica-east1" => Some(&SAO_PAULO),
            _ => None,
        }
    }
}

/// Region of a zone (`us-west2-a` is in `us-west2`).
#[must_use]
pub fn zone_to_region(zone: &str) -> &str {
    zone.rsplit_once('-').map_or(zone, |(region, _)| region)
}

/// Zone list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneListResponse {
    /// Zones.
    #[serde(default)]
    pub items: Vec<Zone>,
    /// Token for the next page.
    pub next_page_token: Option<String>,
}

/// Compute Engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    /// Instance ID.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Status.
    pub status: String,
    /// Network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl GceInstance {
    /// External NAT address of the first interface.
    #[must_use]
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .and_then(|ac| ac.nat_i_p.as_deref())
    }

    /// Whether the instance is running with an external address.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == INSTANCE_STATUS_RUNNING && self.nat_ip().is_some()
    }
}

/// Network interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Network IP (internal).
    pub network_i_p: Option<String>,
    /// Access configs (for external IP).
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// Access configuration (external IP).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Access type.
    #[serde(rename = "type")]
    pub access_type: Option<String>,
    /// External NAT IP.
    pub nat_i_p: Option<String>,
}

/// Create instance request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Instance name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Machine type (partial URL).
    pub machine_type: String,
    /// Disks.
    pub disks: Vec<AttachedDiskDefinition>,
    /// Network interfaces.
    pub network_interfaces: Vec<NetworkInterfaceDefinition>,
    /// Network tags.
    pub tags: Tags,
    /// Metadata.
    pub metadata: Metadata,
}

/// Attached disk definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskDefinition {
    /// Boot disk.
    pub boot: bool,
    /// Auto delete.
    pub auto_delete: bool,
    /// Initialize params.
    pub initialize_params: InitializeParams,
}

/// Disk initialization parameters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Source image (URL).
    pub source_image: String,
}

/// Network interface definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceDefinition {
    /// Network (partial URL).
    pub network: String,
    /// Access configs.
    pub access_configs: Vec<AccessConfigDefinition>,
}

/// Access config definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfigDefinition {
    /// Access type.
    #[serde(rename = "type")]
    pub access_type: String,
    /// Name.
    pub name: String,
}

/// Network tags.
#[derive(Debug, Serialize)]
pub struct Tags {
    /// Tag values.
    pub items: Vec<String>,
}

/// Metadata for instance.
#[derive(Debug, Serialize)]
pub struct Metadata {
    /// Metadata items.
    pub items: Vec<MetadataItem>,
}

/// Metadata item.
#[derive(Debug, Serialize)]
pub struct MetadataItem {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
}

/// Firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    /// Rule name.
    pub name: String,
    /// Network (partial URL).
    #[serde(default)]
    pub network: String,
    /// `INGRESS` or `EGRESS`.
    #[serde(default)]
    pub direction: String,
    /// Allowed protocols.
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
    /// Source CIDR ranges.
    #[serde(default)]
    pub source_ranges: Vec<String>,
    /// Instances the rule applies to.
    #[serde(default)]
    pub target_tags: Vec<String>,
}

/// Protocol allowed by a firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirewallAllowed {
    /// Protocol name.
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
}

/// Regional static address.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Address name.
    pub name: String,
    /// IP address.
    pub address: String,
    /// `RESERVED`, `IN_USE`, ...
    #[serde(default)]
    pub status: String,
}

/// Request to reserve a static address.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAddressRequest {
    /// Address name.
    pub name: String,
    /// Ephemeral address to promote.
    pub address: String,
    /// Description.
    pub description: String,
}

/// GCP operation (async task).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name.
    pub name: String,
    /// Status.
    pub status: String,
    /// Target ID.
    pub target_id: Option<String>,
    /// Error.
    pub error: Option<OperationError>,
}

/// Operation error.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    /// Errors.
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

/// Operation error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorDetail {
    /// Error code.
    pub code: Option<String>,
    /// Error message.
    pub message: Option<String>,
}

/// Common GCP images.
pub mod images {
    /// Ubuntu 22.04 LTS.
    pub const UBUNTU_22_04: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";
}
