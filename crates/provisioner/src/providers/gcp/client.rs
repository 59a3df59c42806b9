//! GCP API client implementation.
//!
//! Talks to Cloud Billing for accounts and projects and to Compute Engine
//! for everything else, authenticated with an `OAuth2` access token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    Address, BillingAccount, BillingAccountListResponse, CreateAddressRequest,
    CreateInstanceRequest, Firewall, GceInstance, Operation, ProjectBillingInfo,
    ProjectBillingInfoListResponse, Zone, ZoneListResponse,
};
use crate::error::CloudError;

/// Cloud Billing API root.
pub const BILLING_BASE_URL: &str = "https://cloudbilling.googleapis.com/v1";

/// Compute Engine API root.
pub const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Operations the GCP backend needs from the APIs.
#[async_trait]
pub trait GcpApi: Send + Sync {
    /// Billing accounts visible to the token.
    async fn billing_accounts(&self) -> Result<Vec<BillingAccount>, CloudError>;

    /// Projects linked to `account` (its resource name).
    async fn billing_account_projects(&self, account: &str) -> Result<Vec<String>, CloudError>;

    /// Billing state of `project`.
    async fn project_billing(&self, project: &str) -> Result<ProjectBillingInfo, CloudError>;

    /// Zones of `project`.
    async fn zones(&self, project: &str) -> Result<Vec<Zone>, CloudError>;

    /// Firewall rule `name`; [`CloudError::NotFound`] if absent.
    async fn firewall(&self, project: &str, name: &str) -> Result<Firewall, CloudError>;

    /// Create a firewall rule.
    async fn create_firewall(&self, project: &str, rule: &Firewall) -> Result<(), CloudError>;

    /// Insert an instance.
    async fn create_instance(
        &self,
        project: &str,
        zone: &str,
        req: &CreateInstanceRequest,
    ) -> Result<Operation, CloudError>;

    /// Fetch an instance.
    async fn instance(&self, project: &str, zone: &str, name: &str)
        -> Result<GceInstance, CloudError>;

    /// Delete an instance.
    async fn delete_instance(&self, project: &str, zone: &str, name: &str)
        -> Result<(), CloudError>;

    /// Static address `name`; [`CloudError::NotFound`] if absent.
    async fn address(&self, project: &str, region: &str, name: &str)
        -> Result<Address, CloudError>;

    /// Reserve a static address.
    async fn create_address(
        &self,
        project: &str,
        region: &str,
        req: &CreateAddressRequest,
    ) -> Result<(), CloudError>;

    /// Release a static address.
    async fn delete_address(&self, project: &str, region: &str, name: &str)
        -> Result<(), CloudError>;
}

/// Build a client for the public APIs from an access token.
///
/// # Errors
/// Returns error if HTTP client cannot be created.
pub fn connect(token: &str) -> Result<Arc<dyn GcpApi>, CloudError> {
    Ok(Arc::new(GcpClient::new(token)?))
}

/// One page of a `nextPageToken` paginated list.
trait Page: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for BillingAccountListResponse {
    type Item = BillingAccount;

    fn into_parts(self) -> (Vec<BillingAccount>, Option<String>) {
        (self.billing_accounts, self.next_page_token)
    }
}

impl Page for ProjectBillingInfoListResponse {
    type Item = ProjectBillingInfo;

    fn into_parts(self) -> (Vec<ProjectBillingInfo>, Option<String>) {
        (self.project_billing_info, self.next_page_token)
    }
}

impl Page for ZoneListResponse {
    type Item = Zone;

    fn into_parts(self) -> (Vec<Zone>, Option<String>) {
        (self.items, self.next_page_token)
    }
}

/// GCP REST client.
#[derive(Clone)]
pub struct GcpClient {
    /// HTTP client.
    client: Client,
    /// Access token (from the OAuth flow).
    access_token: String,
    billing_url: String,
    compute_url: String,
}

impl std::fmt::Debug for GcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpClient")
            .field("billing_url", &self.billing_url)
            .field("compute_url", &self.compute_url)
            .finish_non_exhaustive()
    }
}

impl GcpClient {
    /// Create a new client for the public APIs.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(access_token: impl Into<String>) -> Result<Self, CloudError> {
        Self::with_base_urls(access_token, BILLING_BASE_URL, COMPUTE_BASE_URL)
    }

    /// Create a client against other API roots.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_urls(
        access_token: impl Into<String>,
        billing_url: impl Into<String>,
        compute_url: impl Into<String>,
    ) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            access_token: access_token.into(),
            billing_url: billing_url.into().trim_end_matches('/').to_string(),
            compute_url: compute_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn compute(&self, path: &str) -> String {
        format!("{}/projects/{path}", self.compute_url)
    }

    /// Make an authenticated GET request.
    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, CloudError> {
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Follow `nextPageToken` until exhausted.
    async fn get_all<P: Page>(&self, url: &str) -> Result<Vec<P::Item>, CloudError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page_url = match &token {
                Some(t) => format!("{url}?pageToken={t}"),
                None => url.to_string(),
            };
            let page: P = self.get(&page_url).await?;
            let (mut page_items, next) = page.into_parts();
            items.append(&mut page_items);

            match next.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => return Ok(items),
            }
        }
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, url: &str, body: &B) -> Result<T, CloudError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request that returns an operation.
    async fn post_operation<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<Operation, CloudError> {
        let operation: Operation = self.post(url, body).await?;
        if let Some(error) = &operation.error {
            let message = error
                .errors
                .iter()
                .filter_map(|e| e.message.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CloudError::Api {
                status: 400,
                message,
            });
        }
        Ok(operation)
    }

    /// Make an authenticated DELETE request. Missing resources count as
    /// deleted.
    async fn delete(&self, url: &str) -> Result<(), CloudError> {
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::status_error(status, text))
        }
    }

    /// Handle API response.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudError::Serialization(e)
            })
        } else {
            Err(Self::status_error(status, text))
        }
    }

    fn status_error(status: StatusCode, text: String) -> CloudError {
        match status {
            StatusCode::NOT_FOUND => CloudError::NotFound(text),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(text),
            StatusCode::TOO_MANY_REQUESTS => CloudError::QuotaExceeded(text),
            _ => CloudError::Api {
                status: status.as_u16(),
                message: text,
            },
        }
    }
}

#[async_trait]
impl GcpApi for GcpClient {
    async fn billing_accounts(&self) -> Result<Vec<BillingAccount>, CloudError> {
        let url = format!("{}/billingAccounts", self.billing_url);
        self.get_all::<BillingAccountListResponse>(&url).await
    }

    async fn billing_account_projects(&self, account: &str) -> Result<Vec<String>, CloudError> {
        let url = format!("{}/{account}/projects", self.billing_url);
        let infos = self.get_all::<ProjectBillingInfoListResponse>(&url).await?;
        Ok(infos.into_iter().map(|i| i.project_id).collect())
    }

    async fn project_billing(&self, project: &str) -> Result<ProjectBillingInfo, CloudError> {
        let url = format!("{}/projects/{project}/billingInfo", self.billing_url);
        self.get(&url).await
    }

    async fn zones(&self, project: &str) -> Result<Vec<Zone>, CloudError> {
        let url = self.compute(&format!("{project}/zones"));
        self.get_all::<ZoneListResponse>(&url).await
    }

    async fn firewall(&self, project: &str, name: &str) -> Result<Firewall, CloudError> {
        let url = self.compute(&format!("{project}/global/firewalls/{name}"));
        self.get(&url).await
    }

    async fn create_firewall(&self, project: &str, rule: &Firewall) -> Result<(), CloudError> {
        info!(project = %project, rule = %rule.name, "Creating firewall rule");
        let url = self.compute(&format!("{project}/global/firewalls"));
        self.post_operation(&url, rule).await.map(|_| ())
    }

    async fn create_instance(
        &self,
        project: &str,
        zone: &str,
        req: &CreateInstanceRequest,
    ) -> Result<Operation, CloudError> {
        info!(
            project = %project,
            zone = %zone,
            name = %req.name,
            machine_type = %req.machine_type,
            "Creating GCE instance"
        );
        let url = self.compute(&format!("{project}/zones/{zone}/instances"));
        let operation = self.post_operation(&url, req).await?;

        info!(
            name = %req.name,
            operation = %operation.name,
            "GCE instance creation initiated"
        );
        Ok(operation)
    }

    async fn instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<GceInstance, CloudError> {
        let url = self.compute(&format!("{project}/zones/{zone}/instances/{name}"));
        self.get(&url).await
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<(), CloudError> {
        info!(project = %project, zone = %zone, name = %name, "Deleting GCE instance");
        let url = self.compute(&format!("{project}/zones/{zone}/instances/{name}"));
        self.delete(&url).await
    }

    async fn address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Address, CloudError> {
        let url = self.compute(&format!("{project}/regions/{region}/addresses/{name}"));
        self.get(&url).await
    }

    async fn create_address(
        &self,
        project: &str,
        region: &str,
        req: &CreateAddressRequest,
    ) -> Result<(), CloudError> {
        info!(project = %project, region = %region, name = %req.name, "Reserving static address");
        let url = self.compute(&format!("{project}/regions/{region}/addresses"));
        self.post_operation(&url, req).await.map(|_| ())
    }

    async fn delete_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<(), CloudError> {
        info!(project = %project, region = %region, name = %name, "Releasing static address");
        let url = self.compute(&format!("{project}/regions/{region}/addresses/{name}"));
        self.delete(&url).await
    }
}
