//! `DigitalOcean` implementation of [`Provisioner`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{connect, DigitalOceanApi};
use super::models::{CreateDropletRequest, Droplet, ACCOUNT_STATUS_LOCKED};
use crate::error::{CloudError, ProvisionError};
use crate::install::{pause, Installer};
use crate::keys::make_instance_name;
use crate::model::{CloudLocation, Compartment, CompartmentEntry, Location, ServerConfiguration};
use crate::provider::{
    checkpoint, conclude, fill_slot, generate_key_pair, guard, read_slot, spawn_phase,
    ClientFactory, ClientSlot, CompartmentStore, Phase, Provisioner,
};
use crate::rollback::Rollback;
use crate::session::Session;

/// Droplet parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanSettings {
    /// Size slug.
    pub size: String,
    /// Image slug.
    pub image: String,
    /// Tags applied to the droplet.
    pub tags: Vec<String>,
    /// Login user of the image.
    pub ssh_user: String,
    /// How long to wait for the droplet to become active.
    pub ready_timeout_secs: u64,
    /// Interval between status polls.
    pub poll_interval_secs: u64,
}

impl Default for DigitalOceanSettings {
    fn default() -> Self {
        Self {
            size: "s-1vcpu-1gb".to_string(),
            image: "ubuntu-22-04-x64".to_string(),
            tags: vec!["lantern".to_string()],
            ssh_user: "root".to_string(),
            ready_timeout_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

/// `DigitalOcean` provisioner.
///
/// The account is the single compartment; each project is an entry and
/// every entry offers the same available regions.
pub struct DigitalOcean {
    session: Session,
    settings: Arc<DigitalOceanSettings>,
    installer: Arc<Installer>,
    rollback_on_failure: bool,
    factory: ClientFactory<dyn DigitalOceanApi>,
    client: ClientSlot<dyn DigitalOceanApi>,
    compartments: CompartmentStore,
}

impl std::fmt::Debug for DigitalOcean {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOcean")
            .field("settings", &self.settings)
            .field("rollback_on_failure", &self.rollback_on_failure)
            .finish_non_exhaustive()
    }
}

impl DigitalOcean {
    /// Create a provisioner bound to `session`, talking to the public API.
    #[must_use]
    pub fn new(
        session: Session,
        settings: DigitalOceanSettings,
        installer: Installer,
        rollback_on_failure: bool,
    ) -> Self {
        Self {
            session,
            settings: Arc::new(settings),
            installer: Arc::new(installer),
            rollback_on_failure,
            factory: Arc::new(connect),
            client: Arc::default(),
            compartments: CompartmentStore::default(),
        }
    }

    /// Replace how the API client is built from the token.
    #[must_use]
    pub fn with_client_factory(mut self, factory: ClientFactory<dyn DigitalOceanApi>) -> Self {
        self.factory = factory;
        self
    }
}

impl Provisioner for DigitalOcean {
    fn validate(&self, token: &str) {
        let client = (self.factory)(token);
        let slot = Arc::clone(&self.client);
        let store = self.compartments.clone();
        let cancel = self.session.cancellation();

        spawn_phase(&self.session, Phase::Validation, None, async move {
            let client = client.map_err(ProvisionError::Validation)?;
            fill_slot(&slot, Arc::clone(&client));

            let compartments = guard(&cancel, discover(client.as_ref()))
                .await?
                .map_err(ProvisionError::Validation)?;
            store.publish(compartments);
            Ok(None)
        });
    }

    fn compartments(&self) -> Arc<[Compartment]> {
        self.compartments.snapshot()
    }

    fn session(&self) -> Session {
        self.session.clone()
    }

    fn provision(&self, entry_id: &str, location_id: &str) {
        let job = read_slot(&self.client).map(|client| Job {
            client,
            settings: Arc::clone(&self.settings),
            installer: Arc::clone(&self.installer),
            project_id: entry_id.to_string(),
            region: location_id.to_string(),
            cancel: self.session.cancellation(),
        });
        let rollback = Rollback::new(self.rollback_on_failure);

        spawn_phase(
            &self.session,
            Phase::Provisioning,
            Some(entry_id.to_string()),
            async move {
                let job = job.ok_or_else(|| {
                    ProvisionError::Provisioning("validation has not completed".to_string())
                })?;
                job.run(rollback).await
            },
        );
    }
}

/// Build the single account compartment.
async fn discover(client: &dyn DigitalOceanApi) -> Result<Vec<Compartment>, CloudError> {
    let account = client.account().await?;
    let projects = client.projects().await?;
    let regions = client.regions().await?;

    let locations: Vec<Location> = regions
        .into_iter()
        .filter(|r| r.available)
        .filter(|r| r.location().is_some())
        .map(|r| Arc::new(r) as Location)
        .collect();

    let entries: Vec<CompartmentEntry> = if locations.is_empty() {
        warn!(
            account = %account.email,
            projects = projects.len(),
            "No available region with a known location, skipping all projects"
        );
        Vec::new()
    } else {
        projects
            .into_iter()
            .map(|p| CompartmentEntry {
                id: p.id,
                locations: locations.clone(),
            })
            .collect()
    };

    debug!(
        account = %account.email,
        projects = entries.len(),
        locations = locations.len(),
        "Validation completed"
    );

    Ok(vec![Compartment {
        id: account.uuid,
        name: account.email,
        entries,
    }])
}

/// One provisioning attempt.
struct Job {
    client: Arc<dyn DigitalOceanApi>,
    settings: Arc<DigitalOceanSettings>,
    installer: Arc<Installer>,
    project_id: String,
    region: String,
    cancel: CancellationToken,
}

impl Job {
    async fn run(self, mut rollback: Rollback) -> Result<Option<String>, ProvisionError> {
        let result = self.create(&mut rollback).await;
        conclude(rollback, result).await
    }

    async fn create(&self, rollback: &mut Rollback) -> Result<ServerConfiguration, ProvisionError> {
        let account = guard(&self.cancel, self.client.account()).await??;
        if account.status == ACCOUNT_STATUS_LOCKED {
            return Err(CloudError::Unhealthy(format!(
                "account {} is locked: {}",
                account.email, account.status_message
            ))
            .into());
        }

        let keys = generate_key_pair().await?;
        let name = make_instance_name();

        let key = self.client.create_ssh_key(&name, &keys.public_key).await?;
        let client = Arc::clone(&self.client);
        rollback.push(format!("ssh key {}", key.id), async move {
            client.delete_ssh_key(key.id).await
        });
        checkpoint(&self.cancel)?;

        let request = CreateDropletRequest {
            name,
            region: self.region.clone(),
            size: self.settings.size.clone(),
            image: self.settings.image.clone(),
            ssh_keys: vec![key.id],
            tags: self.settings.tags.clone(),
        };
        let droplet = self.client.create_droplet(&request).await?;
        let droplet_id = droplet.id;
        let client = Arc::clone(&self.client);
        rollback.push(format!("droplet {droplet_id}"), async move {
            client.delete_droplet(droplet_id).await
        });
        debug!(droplet_id, "Created droplet");
        checkpoint(&self.cancel)?;

        guard(
            &self.cancel,
            self.client.assign_droplet(&self.project_id, droplet_id),
        )
        .await??;

        let droplet = self.wait_ready(droplet).await?;
        let address = droplet
            .public_ipv4()
            .ok_or_else(|| ProvisionError::Provisioning("droplet has no public IPv4".to_string()))?;

        let config = self
            .installer
            .install(address, &self.settings.ssh_user, &keys, &self.cancel)
            .await?;
        info!(droplet_id, address = %address, "Installed server on droplet");
        Ok(config)
    }

    /// Poll until the droplet is active with a public address.
    async fn wait_ready(&self, mut droplet: Droplet) -> Result<Droplet, ProvisionError> {
        let timeout = self.settings.ready_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(timeout);
        let interval = Duration::from_secs(self.settings.poll_interval_secs);

        loop {
            if droplet.is_ready() {
                info!(droplet_id = droplet.id, "Droplet is ready");
                return Ok(droplet);
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(timeout).into());
            }

            debug!(droplet_id = droplet.id, status = %droplet.status, "Polling droplet status");
            pause(interval, &self.cancel).await?;
            droplet = guard(&self.cancel, self.client.droplet(droplet.id)).await??;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::install::testing::{FakeConnector, FakeRemote};
    use crate::install::InstallerSettings;
    use crate::model::{location_labels, NEW_YORK_CITY};
    use crate::providers::digitalocean::models::{
        Account, NetworkAddress, Networks, Project, Region, SshKey,
    };
    use crate::session::EventKind;

    const SERVER_JSON: &str = r#"{"external_ip":"203.0.113.5","port":443,"access_token":"abc"}"#;

    struct FakeApi {
        account_status: &'static str,
        projects: Vec<&'static str>,
        regions: Vec<(&'static str, bool)>,
        polls_until_active: usize,
        polls: AtomicUsize,
        calls: Mutex<Vec<String>>,
        cancel_on_create: Mutex<Option<CancellationToken>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                account_status: "active",
                projects: vec!["proj-1"],
                regions: vec![("nyc1", true), ("sfo3", false)],
                polls_until_active: 1,
                polls: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                cancel_on_create: Mutex::new(None),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn droplet(&self, status: &str) -> Droplet {
            Droplet {
                id: 42,
                name: "lantern".into(),
                status: status.into(),
                networks: Networks {
                    v4: vec![NetworkAddress {
                        ip_address: "203.0.113.5".into(),
                        address_type: "public".into(),
                    }],
                    v6: vec![],
                },
                tags: vec![],
            }
        }
    }

    #[async_trait]
    impl DigitalOceanApi for FakeApi {
        async fn account(&self) -> Result<Account, CloudError> {
            Ok(Account {
                uuid: "acc-1".into(),
                email: "ops@example.com".into(),
                droplet_limit: 10,
                email_verified: true,
                status: self.account_status.into(),
                status_message: String::new(),
            })
        }

        async fn projects(&self) -> Result<Vec<Project>, CloudError> {
            Ok(self
                .projects
                .iter()
                .map(|id| Project {
                    id: (*id).to_string(),
                    owner_uuid: "acc-1".into(),
                    name: (*id).to_string(),
                    description: String::new(),
                    purpose: String::new(),
                    environment: String::new(),
                    is_default: false,
                })
                .collect())
        }

        async fn regions(&self) -> Result<Vec<Region>, CloudError> {
            Ok(self
                .regions
                .iter()
                .map(|(slug, available)| Region {
                    slug: (*slug).to_string(),
                    name: (*slug).to_string(),
                    sizes: vec![],
                    available: *available,
                    features: vec![],
                })
                .collect())
        }

        async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey, CloudError> {
            assert!(public_key.starts_with("ssh-rsa "));
            self.record("create_ssh_key");
            Ok(SshKey {
                id: 5,
                fingerprint: "fp".into(),
                name: name.into(),
                public_key: public_key.into(),
            })
        }

        async fn delete_ssh_key(&self, id: u64) -> Result<(), CloudError> {
            self.record(format!("delete_ssh_key {id}"));
            Ok(())
        }

        async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError> {
            assert_eq!(req.ssh_keys, vec![5]);
            self.record(format!("create_droplet {}", req.region));
            let cancel = self.cancel_on_create.lock().unwrap().clone();
            if let Some(cancel) = cancel {
                cancel.cancel();
                tokio::task::yield_now().await;
            }
            Ok(self.droplet("new"))
        }

        async fn droplet(&self, _id: u64) -> Result<Droplet, CloudError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if poll >= self.polls_until_active {
                Ok(self.droplet("active"))
            } else {
                Ok(self.droplet("new"))
            }
        }

        async fn delete_droplet(&self, id: u64) -> Result<(), CloudError> {
            self.record(format!("delete_droplet {id}"));
            Ok(())
        }

        async fn assign_droplet(&self, project_id: &str, droplet_id: u64) -> Result<(), CloudError> {
            self.record(format!("assign {project_id} {droplet_id}"));
            Ok(())
        }
    }

    fn provisioner(api: Arc<FakeApi>, connector: FakeConnector) -> DigitalOcean {
        let installer = Installer::new(Arc::new(connector), InstallerSettings::default());
        DigitalOcean::new(
            Session::new(),
            DigitalOceanSettings::default(),
            installer,
            true,
        )
        .with_client_factory(Arc::new(
            move |_token: &str| -> Result<Arc<dyn DigitalOceanApi>, CloudError> {
                Ok(api.clone())
            },
        ))
    }

    async fn validated(p: &DigitalOcean) {
        let session = p.session();
        p.validate("tok");
        assert_eq!(session.recv().await.unwrap().kind, EventKind::ValidationStarted);
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ValidationCompleted
        );
    }

    #[tokio::test]
    async fn test_only_available_regions_are_offered() {
        let p = provisioner(Arc::new(FakeApi::new()), FakeConnector::unreachable());
        validated(&p).await;

        let compartments = p.compartments();
        assert_eq!(compartments.len(), 1);
        assert_eq!(compartments[0].id, "acc-1");
        assert_eq!(compartments[0].name, "ops@example.com");

        let entry = &compartments[0].entries[0];
        assert_eq!(entry.id, "proj-1");
        assert_eq!(entry.locations.len(), 1);
        assert_eq!(entry.locations[0].location(), Some(&NEW_YORK_CITY));
        assert_eq!(location_labels(entry), vec!["nyc1 - New York City [US]"]);
    }

    #[tokio::test]
    async fn test_zero_projects_still_completes() {
        let api = FakeApi {
            projects: vec![],
            ..FakeApi::new()
        };
        let p = provisioner(Arc::new(api), FakeConnector::unreachable());
        validated(&p).await;

        assert_eq!(p.compartments().len(), 1);
        assert!(p.compartments()[0].entries.is_empty());
    }

    #[tokio::test]
    async fn test_no_usable_region_publishes_no_entries() {
        let api = FakeApi {
            regions: vec![("sfo3", false), ("xyz1", true)],
            ..FakeApi::new()
        };
        let p = provisioner(Arc::new(api), FakeConnector::unreachable());
        validated(&p).await;

        let compartments = p.compartments();
        assert_eq!(compartments.len(), 1);
        assert!(compartments[0].entries.is_empty());
    }

    #[tokio::test]
    async fn test_factory_failure_is_validation_error() {
        let p = provisioner(Arc::new(FakeApi::new()), FakeConnector::unreachable())
            .with_client_factory(Arc::new(
                |_token: &str| -> Result<Arc<dyn DigitalOceanApi>, CloudError> {
                    Err(CloudError::Auth("bad token".into()))
                },
            ));
        let session = p.session();
        p.validate("tok");

        assert_eq!(session.recv().await.unwrap().kind, EventKind::ValidationStarted);
        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ValidationError);
        assert!(matches!(failed.error, Some(ProvisionError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_provisioning() {
        let api = Arc::new(FakeApi {
            polls_until_active: 2,
            ..FakeApi::new()
        });
        let connector = FakeConnector::reachable_after(0, FakeRemote::new(SERVER_JSON));
        let targets = connector.targets();
        let p = provisioner(Arc::clone(&api), connector);
        validated(&p).await;

        let session = p.session();
        p.provision("proj-1", "nyc1");

        let started = session.recv().await.unwrap();
        assert_eq!(started.kind, EventKind::ProvisioningStarted);
        assert_eq!(started.message.as_deref(), Some("proj-1"));

        let done = session.recv().await.unwrap();
        assert_eq!(done.kind, EventKind::ProvisioningCompleted);
        assert_eq!(done.message.as_deref(), Some(SERVER_JSON));

        let target = targets.lock().unwrap()[0].clone();
        assert_eq!(target.address, "203.0.113.5");
        assert_eq!(target.user, "root");
        assert_eq!(
            api.calls(),
            vec!["create_ssh_key", "create_droplet nyc1", "assign proj-1 42"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_failure_rolls_back() {
        let api = Arc::new(FakeApi::new());
        let remote = FakeRemote::new(SERVER_JSON).failing_at(2, "E: Unable to locate package");
        let p = provisioner(
            Arc::clone(&api),
            FakeConnector::reachable_after(0, remote),
        );
        validated(&p).await;

        let session = p.session();
        p.provision("proj-1", "nyc1");
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ProvisioningStarted
        );
        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(failed.error, Some(ProvisionError::Command { .. })));

        let calls = api.calls();
        assert_eq!(
            &calls[3..],
            &["delete_droplet 42".to_string(), "delete_ssh_key 5".to_string()]
        );
    }

    #[tokio::test]
    async fn test_locked_account_creates_nothing() {
        let api = Arc::new(FakeApi {
            account_status: "locked",
            ..FakeApi::new()
        });
        let p = provisioner(Arc::clone(&api), FakeConnector::unreachable());
        validated(&p).await;

        let session = p.session();
        p.provision("proj-1", "nyc1");
        session.recv().await.unwrap();
        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(
            failed.error,
            Some(ProvisionError::Cloud(CloudError::Unhealthy(_)))
        ));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_provision_before_validation_fails() {
        let p = provisioner(Arc::new(FakeApi::new()), FakeConnector::unreachable());
        let session = p.session();
        p.provision("proj-1", "nyc1");

        session.recv().await.unwrap();
        let failed = session.recv().await.unwrap();
        assert!(matches!(failed.error, Some(ProvisionError::Provisioning(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_dial_rolls_back() {
        let api = Arc::new(FakeApi::new());
        let connector = FakeConnector::unreachable();
        let attempts = connector.attempts();
        let p = provisioner(Arc::clone(&api), connector);
        validated(&p).await;

        let session = p.session();
        p.provision("proj-1", "nyc1");
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ProvisioningStarted
        );

        while attempts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        session.cancel();
        session.wait().await;

        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(failed.error, Some(ProvisionError::Cancelled)));
        assert!(attempts.load(Ordering::SeqCst) < 11);

        let calls = api.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &["delete_droplet 42".to_string(), "delete_ssh_key 5".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_create_still_deletes_droplet() {
        let api = Arc::new(FakeApi::new());
        let p = provisioner(Arc::clone(&api), FakeConnector::unreachable());
        *api.cancel_on_create.lock().unwrap() = Some(p.session().cancellation());
        validated(&p).await;

        let session = p.session();
        p.provision("proj-1", "nyc1");
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ProvisioningStarted
        );
        session.wait().await;

        let failed = session.recv().await.unwrap();
        assert!(matches!(failed.error, Some(ProvisionError::Cancelled)));
        assert_eq!(
            api.calls(),
            vec![
                "create_ssh_key",
                "create_droplet nyc1",
                "delete_droplet 42",
                "delete_ssh_key 5"
            ]
        );
    }
}
