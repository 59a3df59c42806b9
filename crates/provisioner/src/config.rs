//! Provisioner configuration.
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration. Command-line flags override what is loaded here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CloudError;
use crate::install::InstallerSettings;
use crate::oauth::OAuthEndpoint;
use crate::providers::digitalocean::DigitalOceanSettings;
use crate::providers::gcp::GcpSettings;

/// Cloud backend to provision on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `DigitalOcean` droplets.
    #[default]
    DigitalOcean,
    /// Google Compute Engine instances.
    Gcp,
}

impl ProviderKind {
    /// Authorization endpoint used to obtain the access token.
    #[must_use]
    pub fn oauth_endpoint(self) -> OAuthEndpoint {
        match self {
            Self::DigitalOcean => OAuthEndpoint {
                authorize_url: "https://cloud.digitalocean.com/v1/oauth/authorize",
                scopes: &["read", "write"],
            },
            Self::Gcp => OAuthEndpoint {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
                scopes: &["https://www.googleapis.com/auth/cloud-platform"],
            },
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DigitalOcean => write!(f, "digitalocean"),
            Self::Gcp => write!(f, "gcp"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "digitalocean" | "do" => Ok(Self::DigitalOcean),
            "gcp" | "google" => Ok(Self::Gcp),
            _ => Err(anyhow::anyhow!(
                "Unknown provider: {s}. Supported: digitalocean, gcp"
            )),
        }
    }
}

/// OAuth client registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Client ID registered with the provider.
    pub client_id: String,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
    /// Pre-issued access token; skips the browser flow when set.
    pub token: Option<String>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_uri: "http://localhost:8765/callback".to_string(),
            token: None,
        }
    }
}

/// Full provisioner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Backend to use.
    pub provider: ProviderKind,
    /// OAuth client registration.
    pub oauth: OAuthSettings,
    /// Remote bootstrap.
    pub installer: InstallerSettings,
    /// Delete partially created resources when provisioning fails.
    pub rollback_on_failure: bool,
    /// `DigitalOcean` droplet parameters.
    pub digitalocean: DigitalOceanSettings,
    /// Google Cloud instance parameters.
    pub gcp: GcpSettings,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            oauth: OAuthSettings::default(),
            installer: InstallerSettings::default(),
            rollback_on_failure: true,
            digitalocean: DigitalOceanSettings::default(),
            gcp: GcpSettings::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    /// Returns [`CloudError::Config`] if the document is invalid.
    pub fn from_yaml(contents: &str) -> Result<Self, CloudError> {
        serde_yaml::from_str(contents)
            .map_err(|e| CloudError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns [`CloudError::Config`] if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, CloudError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            CloudError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }
}
