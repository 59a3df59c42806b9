//! `DigitalOcean` API client implementation.
//!
//! API Documentation: <https://docs.digitalocean.com/reference/api/>

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    Account, AccountResponse, AssignResourcesRequest, CreateDropletRequest, CreateSshKeyRequest,
    Droplet, DropletResponse, Links, Project, ProjectListResponse, Region, RegionListResponse,
    SshKey, SshKeyResponse,
};
use crate::error::CloudError;

/// Base URL for `DigitalOcean` API.
pub const API_BASE_URL: &str = "https://api.digitalocean.com/v2";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Page size requested for list endpoints.
const PER_PAGE: u32 = 200;

/// Operations the `DigitalOcean` backend needs from the API.
#[async_trait]
pub trait DigitalOceanApi: Send + Sync {
    /// Account owning the token.
    async fn account(&self) -> Result<Account, CloudError>;

    /// All projects, across pages.
    async fn projects(&self) -> Result<Vec<Project>, CloudError>;

    /// All regions, across pages.
    async fn regions(&self) -> Result<Vec<Region>, CloudError>;

    /// Register a public key.
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey, CloudError>;

    /// Remove a registered key.
    async fn delete_ssh_key(&self, id: u64) -> Result<(), CloudError>;

    /// Create a droplet.
    async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError>;

    /// Fetch a droplet.
    async fn droplet(&self, id: u64) -> Result<Droplet, CloudError>;

    /// Destroy a droplet.
    async fn delete_droplet(&self, id: u64) -> Result<(), CloudError>;

    /// Move a droplet into a project.
    async fn assign_droplet(&self, project_id: &str, droplet_id: u64) -> Result<(), CloudError>;
}

/// Build a client for the public API from an access token.
///
/// # Errors
/// Returns error if HTTP client cannot be created.
pub fn connect(token: &str) -> Result<Arc<dyn DigitalOceanApi>, CloudError> {
    Ok(Arc::new(DigitalOceanClient::new(token)?))
}

/// One page of a paginated list.
trait Page: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Links);
}

impl Page for ProjectListResponse {
    type Item = Project;

    fn into_parts(self) -> (Vec<Project>, Links) {
        (self.projects, self.links)
    }
}

impl Page for RegionListResponse {
    type Item = Region;

    fn into_parts(self) -> (Vec<Region>, Links) {
        (self.regions, self.links)
    }
}

/// `DigitalOcean` REST client.
#[derive(Clone)]
pub struct DigitalOceanClient {
    /// HTTP client.
    client: Client,
    /// API token for authentication.
    api_token: String,
    /// API root, without trailing slash.
    base_url: String,
}

impl std::fmt::Debug for DigitalOceanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DigitalOceanClient {
    /// Create a new client for the public API.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(api_token: impl Into<String>) -> Result<Self, CloudError> {
        Self::with_base_url(api_token, API_BASE_URL)
    }

    /// Create a client against another API root.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        api_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_token: api_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.base_url)
        }
    }

    /// Make an authenticated GET request.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Follow `links.pages.next` until exhausted.
    async fn get_all<P: Page>(&self, path: &str) -> Result<Vec<P::Item>, CloudError> {
        let mut items = Vec::new();
        let mut next = Some(format!("{path}?per_page={PER_PAGE}"));

        while let Some(path) = next {
            let page: P = self.get(&path).await?;
            let (mut page_items, links) = page.into_parts();
            items.append(&mut page_items);
            next = links.next().map(str::to_string);
        }

        Ok(items)
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, CloudError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request whose response body is ignored.
    async fn post_empty<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), CloudError> {
        let url = self.url(path);
        debug!(url = %url, "POST request (empty response)");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Make an authenticated DELETE request. Missing resources count as
    /// deleted.
    async fn delete(&self, path: &str) -> Result<(), CloudError> {
        let url = self.url(path);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> Result<(), CloudError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::status_error(status, text))
        }
    }

    /// Handle API response, parsing JSON or error.
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
impl DigitalOceanApi for DigitalOceanClient {
    async fn account(&self) -> Result<Account, CloudError> {
        let response: AccountResponse = self.get("/account").await?;
        Ok(response.account)
    }

    async fn projects(&self) -> Result<Vec<Project>, CloudError> {
        self.get_all::<ProjectListResponse>("/projects").await
    }

    async fn regions(&self) -> Result<Vec<Region>, CloudError> {
        self.get_all::<RegionListResponse>("/regions").await
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey, CloudError> {
        let body = CreateSshKeyRequest {
            name: name.to_string(),
            public_key: public_key.to_string(),
        };
        let response: SshKeyResponse = self.post("/account/keys", &body).await?;
        info!(key_id = response.ssh_key.id, name = %name, "SSH key registered");
        Ok(response.ssh_key)
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<(), CloudError> {
        self.delete(&format!("/account/keys/{id}")).await
    }

    async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError> {
        info!(
            name = %req.name,
            size = %req.size,
            region = %req.region,
            "Creating droplet"
        );

        let response: DropletResponse = self.post("/droplets", req).await?;

        info!(droplet_id = response.droplet.id, "Droplet created");
        Ok(response.droplet)
    }

    async fn droplet(&self, id: u64) -> Result<Droplet, CloudError> {
        let response: DropletResponse = self.get(&format!("/droplets/{id}")).await?;
        Ok(response.droplet)
    }

    async fn delete_droplet(&self, id: u64) -> Result<(), CloudError> {
        info!(droplet_id = id, "Deleting droplet");
        self.delete(&format!("/droplets/{id}")).await
    }

    async fn assign_droplet(&self, project_id: &str, droplet_id: u64) -> Result<(), CloudError> {
        let body = AssignResourcesRequest {
            resources: vec![format!("do:droplet:{droplet_id}")],
        };
        self.post_empty(&format!("/projects/{project_id}/resources"), &body)
            .await
    }
}
