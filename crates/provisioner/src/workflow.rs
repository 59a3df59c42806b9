//! Receiver-driven control loop over a provisioning session.
//!
//! [`drive`] blocks on the session's events, advances the workflow on each
//! phase completion and stops at the first terminal event.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::ProvisionError;
use crate::model::{
    compartment_by_name, compartment_names, entry_by_id, entry_ids, location_by_label,
    location_label, location_labels, Compartment, ServerConfiguration,
};
use crate::provider::Provisioner;
use crate::session::{EventKind, ProtocolTracker};

/// Where to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Compartment entry ID.
    pub entry_id: String,
    /// Location ID within that entry.
    pub location_id: String,
}

/// How a session ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A server was installed.
    Provisioned(ServerConfiguration),
    /// Validation found no entry to provision in.
    NothingToProvision,
    /// The user cancelled authorization.
    Cancelled,
}

/// Chooses the target once validation has completed.
#[async_trait]
pub trait Selector: Send + Sync {
    /// Pick an entry and location among `compartments`.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Selection`] if no choice can be made.
    async fn select(&self, compartments: Arc<[Compartment]>) -> Result<Selection, ProvisionError>;
}

/// Choices made up front; unset ones fall back to an interactive prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    /// Compartment display name.
    pub compartment: Option<String>,
    /// Entry ID.
    pub entry: Option<String>,
    /// Location label or location ID.
    pub location: Option<String>,
}

/// Resolve a [`Selection`] from `prefs`, calling `choose(prompt, options)`
/// for anything unset. A single option is taken without asking.
///
/// # Errors
/// Returns [`ProvisionError::Selection`] for unknown preferences or empty
/// option lists, or whatever `choose` returns.
pub fn choose_target<F>(
    compartments: &[Compartment],
    prefs: &Preferences,
    mut choose: F,
) -> Result<Selection, ProvisionError>
where
    F: FnMut(&str, &[String]) -> Result<usize, ProvisionError>,
{
    let compartment_name = pick(
        "Please select an account",
        prefs.compartment.as_deref(),
        &compartment_names(compartments),
        &mut choose,
    )?;
    let compartment = compartment_by_name(compartments, &compartment_name).ok_or_else(|| {
        ProvisionError::Selection(format!("unknown compartment: {compartment_name}"))
    })?;

    let entry_id = pick(
        "Please select a project",
        prefs.entry.as_deref(),
        &entry_ids(&compartment.entries),
        &mut choose,
    )?;
    let entry = entry_by_id(&compartment.entries, &entry_id)
        .ok_or_else(|| ProvisionError::Selection(format!("unknown project: {entry_id}")))?;

    // A preset location may be given by ID as well as by label.
    let wanted = prefs.location.as_deref().map(|wanted| {
        entry
            .locations
            .iter()
            .find(|l| l.id() == wanted)
            .and_then(|l| location_label(l.as_ref()))
            .unwrap_or_else(|| wanted.to_string())
    });
    let label = pick(
        "Please select a location",
        wanted.as_deref(),
        &location_labels(entry),
        &mut choose,
    )?;
    let location = location_by_label(&entry.locations, &label)
        .ok_or_else(|| ProvisionError::Selection(format!("unknown location: {label}")))?;

    Ok(Selection {
        entry_id: entry.id.clone(),
        location_id: location.id().to_string(),
    })
}

fn pick<F>(
    prompt: &str,
    preset: Option<&str>,
    options: &[String],
    choose: &mut F,
) -> Result<String, ProvisionError>
where
    F: FnMut(&str, &[String]) -> Result<usize, ProvisionError>,
{
    if let Some(preset) = preset {
        return Ok(preset.to_string());
    }
    match options {
        [] => Err(ProvisionError::Selection(format!("{prompt}: nothing to choose from"))),
        [only] => {
            info!(choice = %only, "Only one option available");
            Ok(only.clone())
        }
        _ => {
            let index = choose(prompt, options)?;
            options
                .get(index)
                .cloned()
                .ok_or_else(|| ProvisionError::Selection(format!("{prompt}: invalid choice")))
        }
    }
}

/// Selector that never prompts.
#[derive(Debug, Clone, Default)]
pub struct PresetSelector(pub Preferences);

#[async_trait]
impl Selector for PresetSelector {
    async fn select(&self, compartments: Arc<[Compartment]>) -> Result<Selection, ProvisionError> {
        choose_target(&compartments, &self.0, |prompt, _| {
            Err(ProvisionError::Selection(format!(
                "{prompt}: no preset and prompting is disabled"
            )))
        })
    }
}

/// Drive `provisioner`'s session to completion.
///
/// Validation starts as soon as OAuth completes and provisioning as soon
/// as `selector` has chosen a target. `idle_timeout` bounds the wait for
/// each single event.
///
/// # Errors
/// Returns the error carried by a terminal error event, a
/// [`ProvisionError::Protocol`] error for out-of-order events or an idle
/// timeout, or [`ProvisionError::Cancelled`] if the session was cancelled.
pub async fn drive(
    provisioner: &dyn Provisioner,
    selector: &dyn Selector,
    idle_timeout: Option<Duration>,
) -> Result<Outcome, ProvisionError> {
    let session = provisioner.session();
    let mut tracker = ProtocolTracker::new();

    loop {
        let event = match idle_timeout {
            Some(timeout) => session.recv_timeout(timeout).await.map_err(|_| {
                ProvisionError::Protocol(format!("no event within {}s", timeout.as_secs()))
            })?,
            None => session.recv().await,
        };
        let Some(event) = event else {
            return Err(ProvisionError::Cancelled);
        };
        tracker.observe(event.kind)?;

        match event.kind {
            EventKind::OAuthStarted => info!("OAuth started, waiting for user to complete"),
            EventKind::OAuthCompleted => {
                let token = event.message.ok_or_else(|| {
                    ProvisionError::Protocol("OAuth completed without a token".to_string())
                })?;
                debug!("OAuth completed");
                provisioner.validate(&token);
            }
            EventKind::OAuthCancelled => {
                info!("OAuth cancelled by user");
                return Ok(Outcome::Cancelled);
            }
            EventKind::ValidationStarted => debug!("Validation started"),
            EventKind::ValidationCompleted => {
                let compartments = provisioner.compartments();
                let usable = compartments
                    .iter()
                    .flat_map(|c| &c.entries)
                    .any(|e| !e.locations.is_empty());
                if !usable {
                    error!("No valid projects found, please check your billing account and permissions");
                    return Ok(Outcome::NothingToProvision);
                }
                debug!(compartments = compartments.len(), "Validation completed");

                let selection = selector.select(compartments).await?;
                info!(
                    entry = %selection.entry_id,
                    location = %selection.location_id,
                    "Provisioning"
                );
                provisioner.provision(&selection.entry_id, &selection.location_id);
            }
            EventKind::ProvisioningStarted => debug!("Provisioning started"),
            EventKind::ProvisioningCompleted => {
                let raw = event.message.ok_or_else(|| {
                    ProvisionError::Protocol("provisioning completed without a result".to_string())
                })?;
                let config = ServerConfiguration::decode(&raw).map_err(ProvisionError::ConfigParse)?;
                info!(external_ip = %config.external_ip, "Provisioning completed successfully");
                return Ok(Outcome::Provisioned(config));
            }
            EventKind::OAuthError | EventKind::ValidationError | EventKind::ProvisioningError => {
                let kind = event.kind;
                let cause = event.error.unwrap_or_else(|| {
                    ProvisionError::Protocol(format!("{kind} without a cause"))
                });
                error!(event = %kind, error = %cause, "Session failed");
                return Err(cause);
            }
        }
    }
}

/// Run [`drive`] until the session ends or `interrupt` resolves, then
/// wait for the session's background work.
///
/// Any failure, including an idle timeout or an interrupt, cancels the
/// session first so that running phases stop and roll back.
///
/// # Errors
/// Same as [`drive`]; an interrupt yields [`ProvisionError::Cancelled`].
pub async fn run(
    provisioner: &dyn Provisioner,
    selector: &dyn Selector,
    idle_timeout: Option<Duration>,
    interrupt: impl Future<Output = ()>,
) -> Result<Outcome, ProvisionError> {
    let session = provisioner.session();
    let outcome = tokio::select! {
        outcome = drive(provisioner, selector, idle_timeout) => outcome,
        () = interrupt => {
            warn!("Interrupted, cancelling session");
            Err(ProvisionError::Cancelled)
        }
    };

    if let Err(e) = &outcome {
        debug!(error = %e, "Cancelling in-flight work");
        session.cancel();
    }
    session.wait().await;
    outcome
}
