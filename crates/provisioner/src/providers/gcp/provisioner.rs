//! Google Cloud implementation of [`Provisioner`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{connect, GcpApi};
use super::models::{
    images, zone_to_region, AccessConfigDefinition, AttachedDiskDefinition, CreateAddressRequest,
    CreateInstanceRequest, Firewall, FirewallAllowed, GceInstance, InitializeParams, Metadata,
    MetadataItem, NetworkInterfaceDefinition, Tags,
};
use crate::error::{CloudError, ProvisionError};
use crate::install::{pause, Installer};
use crate::keys::{make_instance_name, SshKeyPair};
use crate::model::{CloudLocation, Compartment, CompartmentEntry, Location, ServerConfiguration};
use crate::provider::{
    checkpoint, conclude, fill_slot, generate_key_pair, guard, read_slot, spawn_phase,
    ClientFactory, ClientSlot, CompartmentStore, Phase, Provisioner,
};
use crate::rollback::Rollback;
use crate::session::Session;

/// Instance parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpSettings {
    /// Machine type.
    pub machine_type: String,
    /// Boot image (URL).
    pub image: String,
    /// Login user the key is installed for.
    pub ssh_user: String,
    /// Network the instance joins.
    pub network: String,
    /// Firewall rule opened for the server.
    pub firewall_rule: String,
    /// Network tag targeted by the rule.
    pub network_tag: String,
    /// How long to wait for the instance to run.
    pub ready_timeout_secs: u64,
    /// Interval between status polls.
    pub poll_interval_secs: u64,
}

impl Default for GcpSettings {
    fn default() -> Self {
        Self {
            machine_type: "e2-micro".to_string(),
            image: images::UBUNTU_22_04.to_string(),
            ssh_user: "ubuntu".to_string(),
            network: "global/networks/default".to_string(),
            firewall_rule: "lantern-allow-all".to_string(),
            network_tag: "lantern".to_string(),
            ready_timeout_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

/// Google Cloud provisioner.
///
/// Billing accounts are compartments, their projects are entries and each
/// project's zones are locations.
pub struct Gcp {
    session: Session,
    settings: Arc<GcpSettings>,
    installer: Arc<Installer>,
    rollback_on_failure: bool,
    factory: ClientFactory<dyn GcpApi>,
    client: ClientSlot<dyn GcpApi>,
    compartments: CompartmentStore,
}

impl std::fmt::Debug for Gcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gcp")
            .field("settings", &self.settings)
            .field("rollback_on_failure", &self.rollback_on_failure)
            .finish_non_exhaustive()
    }
}

impl Gcp {
    /// Create a provisioner bound to `session`, talking to the public APIs.
    #[must_use]
    pub fn new(
        session: Session,
        settings: GcpSettings,
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
    pub fn with_client_factory(mut self, factory: ClientFactory<dyn GcpApi>) -> Self {
        self.factory = factory;
        self
    }
}

impl Provisioner for Gcp {
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
            project: entry_id.to_string(),
            zone: location_id.to_string(),
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

/// One compartment per billing account that has projects.
async fn discover(client: &dyn GcpApi) -> Result<Vec<Compartment>, CloudError> {
    let accounts = client.billing_accounts().await?;
    debug!(accounts = accounts.len(), "Billing accounts retrieved");

    let mut compartments = Vec::new();
    for account in accounts {
        let projects = client.billing_account_projects(&account.name).await?;
        if projects.is_empty() {
            warn!(account = %account.name, "No projects found for billing account; skipping");
            continue;
        }

        let mut entries = Vec::new();
        for project in projects {
            let zones = match client.zones(&project).await {
                Ok(zones) => zones,
                Err(e) => {
                    warn!(project = %project, error = %e, "Failed to list zones; skipping project");
                    continue;
                }
            };

            let locations: Vec<Location> = zones
                .into_iter()
                .filter(|z| z.is_up() && z.location().is_some())
                .map(|z| Arc::new(z) as Location)
                .collect();
            if locations.is_empty() {
                warn!(project = %project, "No usable zones found for project; skipping");
                continue;
            }

            entries.push(CompartmentEntry {
                id: project,
                locations,
            });
        }

        debug!(account = %account.name, entries = entries.len(), "Projects retrieved");
        compartments.push(Compartment {
            id: account.name,
            name: account.display_name,
            entries,
        });
    }

    Ok(compartments)
}

/// One provisioning attempt.
struct Job {
    client: Arc<dyn GcpApi>,
    settings: Arc<GcpSettings>,
    installer: Arc<Installer>,
    project: String,
    zone: String,
    cancel: CancellationToken,
}

impl Job {
    async fn run(self, mut rollback: Rollback) -> Result<Option<String>, ProvisionError> {
        let result = self.create(&mut rollback).await;
        conclude(rollback, result).await
    }

    async fn create(&self, rollback: &mut Rollback) -> Result<ServerConfiguration, ProvisionError> {
        let keys = generate_key_pair().await?;

        self.check_health().await?;
        self.ensure_firewall().await?;

        let name = make_instance_name();
        let request = self.instance_request(&name, &keys);
        self.client
            .create_instance(&self.project, &self.zone, &request)
            .await?;
        let (client, project, zone, created) = (
            Arc::clone(&self.client),
            self.project.clone(),
            self.zone.clone(),
            name.clone(),
        );
        rollback.push(format!("instance {name}"), async move {
            client.delete_instance(&project, &zone, &created).await
        });
        checkpoint(&self.cancel)?;

        let instance = self.wait_ready(&name).await?;
        let address = self.static_address(&instance, rollback).await?;

        let config = self
            .installer
            .install(&address, &self.settings.ssh_user, &keys, &self.cancel)
            .await?;
        info!(instance = %name, address = %address, "Installed server on instance");
        Ok(config)
    }

    /// Billing must be enabled on the project.
    async fn check_health(&self) -> Result<(), ProvisionError> {
        let billing = guard(&self.cancel, self.client.project_billing(&self.project)).await??;
        if billing.billing_enabled {
            Ok(())
        } else {
            Err(CloudError::Unhealthy(format!(
                "billing is not enabled for project {}",
                self.project
            ))
            .into())
        }
    }

    async fn ensure_firewall(&self) -> Result<(), ProvisionError> {
        let name = &self.settings.firewall_rule;
        match guard(&self.cancel, self.client.firewall(&self.project, name)).await? {
            Ok(_) => {
                debug!(rule = %name, "Firewall rule exists");
                Ok(())
            }
            Err(CloudError::NotFound(_)) => {
                let rule = Firewall {
                    name: name.clone(),
                    network: self.settings.network.clone(),
                    direction: "INGRESS".to_string(),
                    allowed: ["tcp", "udp"]
                        .into_iter()
                        .map(|p| FirewallAllowed {
                            ip_protocol: p.to_string(),
                        })
                        .collect(),
                    source_ranges: vec!["0.0.0.0/0".to_string()],
                    target_tags: vec![self.settings.network_tag.clone()],
                };
                guard(&self.cancel, self.client.create_firewall(&self.project, &rule)).await??;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn instance_request(&self, name: &str, keys: &SshKeyPair) -> CreateInstanceRequest {
        let user = &self.settings.ssh_user;
        CreateInstanceRequest {
            name: name.to_string(),
            description: "Lantern server".to_string(),
            machine_type: format!("zones/{}/machineTypes/{}", self.zone, self.settings.machine_type),
            disks: vec![AttachedDiskDefinition {
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: self.settings.image.clone(),
                },
            }],
            network_interfaces: vec![NetworkInterfaceDefinition {
                network: self.settings.network.clone(),
                access_configs: vec![AccessConfigDefinition {
                    access_type: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                }],
            }],
            tags: Tags {
                items: vec![self.settings.network_tag.clone()],
            },
            metadata: Metadata {
                items: vec![MetadataItem {
                    key: "ssh-keys".to_string(),
                    value: format!("{user}:{} {user}", keys.public_key),
                }],
            },
        }
    }

    /// Poll until the instance is running with an external address.
    async fn wait_ready(&self, name: &str) -> Result<GceInstance, ProvisionError> {
        let timeout = self.settings.ready_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(timeout);
        let interval = Duration::from_secs(self.settings.poll_interval_secs);

        loop {
            let instance = guard(
                &self.cancel,
                self.client.instance(&self.project, &self.zone, name),
            )
            .await??;
            if instance.is_ready() {
                info!(instance = %name, "Instance is running");
                return Ok(instance);
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(timeout).into());
            }

            debug!(instance = %name, status = %instance.status, "Polling instance status");
            pause(interval, &self.cancel).await?;
        }
    }

    /// Reuse the address named after the instance or promote its
    /// ephemeral address to a static one.
    async fn static_address(
        &self,
        instance: &GceInstance,
        rollback: &mut Rollback,
    ) -> Result<String, ProvisionError> {
        let region = zone_to_region(&self.zone);
        match guard(
            &self.cancel,
            self.client.address(&self.project, region, &instance.name),
        )
        .await?
        {
            Ok(existing) => {
                debug!(address = %existing.address, "Using existing static address");
                return Ok(existing.address);
            }
            Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let nat_ip = instance
            .nat_ip()
            .ok_or_else(|| ProvisionError::Provisioning("instance has no external address".into()))?;
        let request = CreateAddressRequest {
            name: instance.name.clone(),
            address: nat_ip.to_string(),
            description: instance.description.clone(),
        };
        self.client
            .create_address(&self.project, region, &request)
            .await?;

        let (client, project, region, name) = (
            Arc::clone(&self.client),
            self.project.clone(),
            region.to_string(),
            instance.name.clone(),
        );
        rollback.push(format!("address {name}"), async move {
            client.delete_address(&project, &region, &name).await
        });
        checkpoint(&self.cancel)?;

        debug!(address = %nat_ip, "Created static address");
        Ok(nat_ip.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::install::testing::{FakeConnector, FakeRemote};
    use crate::install::InstallerSettings;
    use crate::model::{LOS_ANGELES, TOKYO};
    use crate::providers::gcp::models::{
        AccessConfig, Address, BillingAccount, NetworkInterface, Operation, ProjectBillingInfo,
        Zone,
    };
    use crate::session::EventKind;

    const SERVER_JSON: &str = r#"{"external_ip":"198.51.100.7","port":443,"access_token":"abc"}"#;

    struct FakeApi {
        billing_enabled: bool,
        firewall_exists: bool,
        existing_address: Option<&'static str>,
        calls: Mutex<Vec<String>>,
        cancel_on_create: Mutex<Option<CancellationToken>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                billing_enabled: true,
                firewall_exists: false,
                existing_address: None,
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
    }

    fn zone(name: &str, status: &str) -> Zone {
        Zone {
            name: name.to_string(),
            region: String::new(),
            status: status.to_string(),
        }
    }

    #[async_trait]
    impl GcpApi for FakeApi {
        async fn billing_accounts(&self) -> Result<Vec<BillingAccount>, CloudError> {
            Ok(["A", "B"]
                .into_iter()
                .map(|id| BillingAccount {
                    name: format!("billingAccounts/{id}"),
                    display_name: format!("Account {id}"),
                    open: true,
                })
                .collect())
        }

        async fn billing_account_projects(&self, account: &str) -> Result<Vec<String>, CloudError> {
            match account {
                "billingAccounts/A" => Ok(vec![
                    "alpha".into(),
                    "broken".into(),
                    "empty".into(),
                    "central".into(),
                ]),
                _ => Ok(vec![]),
            }
        }

        async fn project_billing(&self, project: &str) -> Result<ProjectBillingInfo, CloudError> {
            Ok(ProjectBillingInfo {
                name: format!("projects/{project}/billingInfo"),
                project_id: project.to_string(),
                billing_account_name: "billingAccounts/A".into(),
                billing_enabled: self.billing_enabled,
            })
        }

        async fn zones(&self, project: &str) -> Result<Vec<Zone>, CloudError> {
            match project {
                "alpha" => Ok(vec![
                    zone("us-west2-a", "UP"),
                    zone("asia-northeast1-b", "UP"),
                    zone("europe-west3-a", "DOWN"),
                ]),
                "broken" => Err(CloudError::Auth("compute API disabled".into())),
                "central" => Ok(vec![zone("us-central1-a", "UP")]),
                _ => Ok(vec![]),
            }
        }

        async fn firewall(&self, _project: &str, name: &str) -> Result<Firewall, CloudError> {
            if self.firewall_exists {
                Ok(Firewall {
                    name: name.into(),
                    network: String::new(),
                    direction: String::new(),
                    allowed: vec![],
                    source_ranges: vec![],
                    target_tags: vec![],
                })
            } else {
                Err(CloudError::NotFound(name.into()))
            }
        }

        async fn create_firewall(&self, _project: &str, rule: &Firewall) -> Result<(), CloudError> {
            self.record(format!("create_firewall {}", rule.name));
            Ok(())
        }

        async fn create_instance(
            &self,
            _project: &str,
            zone: &str,
            req: &CreateInstanceRequest,
        ) -> Result<Operation, CloudError> {
            let ssh_keys = &req.metadata.items[0];
            assert_eq!(ssh_keys.key, "ssh-keys");
            assert!(ssh_keys.value.starts_with("ubuntu:ssh-rsa "));
            self.record(format!("create_instance {zone}"));
            let cancel = self.cancel_on_create.lock().unwrap().clone();
            if let Some(cancel) = cancel {
                cancel.cancel();
                tokio::task::yield_now().await;
            }
            Ok(Operation {
                name: "op-1".into(),
                status: "RUNNING".into(),
                target_id: Some("42".into()),
                error: None,
            })
        }

        async fn instance(
            &self,
            _project: &str,
            _zone: &str,
            name: &str,
        ) -> Result<GceInstance, CloudError> {
            Ok(GceInstance {
                id: "42".into(),
                name: name.into(),
                description: "Lantern server".into(),
                status: "RUNNING".into(),
                network_interfaces: vec![NetworkInterface {
                    network_i_p: Some("10.0.0.2".into()),
                    access_configs: vec![AccessConfig {
                        access_type: Some("ONE_TO_ONE_NAT".into()),
                        nat_i_p: Some("198.51.100.7".into()),
                    }],
                }],
            })
        }

        async fn delete_instance(
            &self,
            _project: &str,
            _zone: &str,
            _name: &str,
        ) -> Result<(), CloudError> {
            self.record("delete_instance");
            Ok(())
        }

        async fn address(
            &self,
            _project: &str,
            _region: &str,
            name: &str,
        ) -> Result<Address, CloudError> {
            match self.existing_address {
                Some(ip) => Ok(Address {
                    name: name.into(),
                    address: ip.into(),
                    status: "RESERVED".into(),
                }),
                None => Err(CloudError::NotFound(name.into())),
            }
        }

        async fn create_address(
            &self,
            _project: &str,
            region: &str,
            req: &CreateAddressRequest,
        ) -> Result<(), CloudError> {
            self.record(format!("create_address {region} {}", req.address));
            Ok(())
        }

        async fn delete_address(
            &self,
            _project: &str,
            _region: &str,
            _name: &str,
        ) -> Result<(), CloudError> {
            self.record("delete_address");
            Ok(())
        }
    }

    fn provisioner(api: Arc<FakeApi>, connector: FakeConnector) -> Gcp {
        let installer = Installer::new(Arc::new(connector), InstallerSettings::default());
        Gcp::new(Session::new(), GcpSettings::default(), installer, true).with_client_factory(
            Arc::new(move |_token: &str| -> Result<Arc<dyn GcpApi>, CloudError> {
                Ok(api.clone())
            }),
        )
    }

    async fn validated(p: &Gcp) {
        let session = p.session();
        p.validate("tok");
        assert_eq!(session.recv().await.unwrap().kind, EventKind::ValidationStarted);
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ValidationCompleted
        );
    }

    #[tokio::test]
    async fn test_validation_skips_unusable_accounts_and_projects() {
        let p = provisioner(Arc::new(FakeApi::new()), FakeConnector::unreachable());
        validated(&p).await;

        let compartments = p.compartments();
        assert_eq!(compartments.len(), 1);
        assert_eq!(compartments[0].id, "billingAccounts/A");
        assert_eq!(compartments[0].name, "Account A");

        let entries = &compartments[0].entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "alpha");
        let geos: Vec<_> = entries[0]
            .locations
            .iter()
            .map(|l| l.location())
            .collect();
        assert_eq!(geos, vec![Some(&LOS_ANGELES), Some(&TOKYO)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_promotes_address() {
        let api = Arc::new(FakeApi::new());
        let connector = FakeConnector::reachable_after(1, FakeRemote::new(SERVER_JSON));
        let targets = connector.targets();
        let p = provisioner(Arc::clone(&api), connector);
        validated(&p).await;

        let session = p.session();
        p.provision("alpha", "us-west2-a");

        let started = session.recv().await.unwrap();
        assert_eq!(started.kind, EventKind::ProvisioningStarted);
        assert_eq!(started.message.as_deref(), Some("alpha"));

        let done = session.recv().await.unwrap();
        assert_eq!(done.kind, EventKind::ProvisioningCompleted);
        assert_eq!(done.message.as_deref(), Some(SERVER_JSON));

        let targets = targets.lock().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].address, "198.51.100.7");
        assert_eq!(targets[0].user, "ubuntu");
        assert_eq!(
            api.calls(),
            vec![
                "create_firewall lantern-allow-all",
                "create_instance us-west2-a",
                "create_address us-west2 198.51.100.7",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_failure_is_reported_and_rolled_back() {
        let api = Arc::new(FakeApi {
            firewall_exists: true,
            ..FakeApi::new()
        });
        let p = provisioner(Arc::clone(&api), FakeConnector::unreachable());
        validated(&p).await;

        let session = p.session();
        p.provision("alpha", "us-west2-a");
        session.recv().await.unwrap();

        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(
            failed.error,
            Some(ProvisionError::Connection { attempts: 11, .. })
        ));
        assert_eq!(
            api.calls(),
            vec![
                "create_instance us-west2-a",
                "create_address us-west2 198.51.100.7",
                "delete_address",
                "delete_instance",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_address_is_reused_and_kept() {
        let api = Arc::new(FakeApi {
            firewall_exists: true,
            existing_address: Some("203.0.113.9"),
            ..FakeApi::new()
        });
        let connector = FakeConnector::reachable_after(0, FakeRemote::new(SERVER_JSON));
        let targets = connector.targets();
        let p = provisioner(Arc::clone(&api), connector);
        validated(&p).await;

        let session = p.session();
        p.provision("alpha", "us-west2-a");
        session.recv().await.unwrap();
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ProvisioningCompleted
        );

        assert_eq!(targets.lock().unwrap()[0].address, "203.0.113.9");
        assert_eq!(api.calls(), vec!["create_instance us-west2-a"]);
    }

    #[tokio::test]
    async fn test_unhealthy_project_creates_nothing() {
        let api = Arc::new(FakeApi {
            billing_enabled: false,
            ..FakeApi::new()
        });
        let p = provisioner(Arc::clone(&api), FakeConnector::unreachable());
        validated(&p).await;

        let session = p.session();
        p.provision("alpha", "us-west2-a");
        session.recv().await.unwrap();

        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(
            failed.error,
            Some(ProvisionError::Cloud(CloudError::Unhealthy(_)))
        ));
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_create_still_deletes_instance() {
        let api = Arc::new(FakeApi {
            firewall_exists: true,
            ..FakeApi::new()
        });
        let p = provisioner(Arc::clone(&api), FakeConnector::unreachable());
        *api.cancel_on_create.lock().unwrap() = Some(p.session().cancellation());
        validated(&p).await;

        let session = p.session();
        p.provision("alpha", "us-west2-a");
        assert_eq!(
            session.recv().await.unwrap().kind,
            EventKind::ProvisioningStarted
        );
        session.wait().await;

        let failed = session.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::ProvisioningError);
        assert!(matches!(failed.error, Some(ProvisionError::Cancelled)));
        assert_eq!(
            api.calls(),
            vec!["create_instance us-west2-a", "delete_instance"]
        );
    }
}
