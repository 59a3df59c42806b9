//! Provider-agnostic provisioning contract.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{CloudError, ProvisionError};
use crate::keys::{make_ssh_key_pair, SshKeyPair};
use crate::model::{Compartment, ServerConfiguration};
use crate::rollback::Rollback;
use crate::session::{Event, EventKind, Session};

/// Builds a backend's API client from an access token.
pub type ClientFactory<C> = Arc<dyn Fn(&str) -> Result<Arc<C>, CloudError> + Send + Sync>;

/// API client published by validation and used by provisioning.
pub(crate) type ClientSlot<C> = Arc<RwLock<Option<Arc<C>>>>;

pub(crate) fn read_slot<C: ?Sized>(slot: &ClientSlot<C>) -> Option<Arc<C>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

pub(crate) fn fill_slot<C: ?Sized>(slot: &ClientSlot<C>, client: Arc<C>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
}

/// A cloud backend driven through sessions.
///
/// Every operation returns immediately; progress and results are reported
/// through [`Session`] events. Methods that start work must be called
/// from within a Tokio runtime.
pub trait Provisioner: Send + Sync {
    /// Exchange `token` for the list of compartments.
    ///
    /// Emits `ValidationStarted` immediately, then exactly one of
    /// `ValidationCompleted` or `ValidationError`.
    fn validate(&self, token: &str);

    /// Compartments found by the last completed validation.
    ///
    /// Only meaningful after `ValidationCompleted` has been observed.
    fn compartments(&self) -> Arc<[Compartment]>;

    /// The session created together with this provisioner.
    fn session(&self) -> Session;

    /// Create and bootstrap an instance in `entry_id` at `location_id`.
    ///
    /// Emits `ProvisioningStarted` (with `entry_id` as message)
    /// immediately, then exactly one of `ProvisioningCompleted` (with the
    /// encoded server configuration) or `ProvisioningError`.
    fn provision(&self, entry_id: &str, location_id: &str);
}

/// Compartment list written once by the validation task and read by the
/// caller after `ValidationCompleted`.
#[derive(Debug, Clone)]
pub(crate) struct CompartmentStore(Arc<RwLock<Arc<[Compartment]>>>);

impl Default for CompartmentStore {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(Arc::from(Vec::new()))))
    }
}

impl CompartmentStore {
    pub(crate) fn publish(&self, compartments: Vec<Compartment>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(compartments);
    }

    pub(crate) fn snapshot(&self) -> Arc<[Compartment]> {
        Arc::clone(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A background phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Validation,
    Provisioning,
}

impl Phase {
    fn started(self) -> EventKind {
        match self {
            Self::Validation => EventKind::ValidationStarted,
            Self::Provisioning => EventKind::ProvisioningStarted,
        }
    }

    fn completed(self) -> EventKind {
        match self {
            Self::Validation => EventKind::ValidationCompleted,
            Self::Provisioning => EventKind::ProvisioningCompleted,
        }
    }

    fn failed(self) -> EventKind {
        match self {
            Self::Validation => EventKind::ValidationError,
            Self::Provisioning => EventKind::ProvisioningError,
        }
    }
}

/// Emit the phase's start event, then run `work` as a tracked task and
/// emit its completion or error event.
///
/// `work` resolves to the optional completion message.
pub(crate) fn spawn_phase<F>(session: &Session, phase: Phase, message: Option<String>, work: F)
where
    F: Future<Output = Result<Option<String>, ProvisionError>> + Send + 'static,
{
    let emitter = session.emitter();
    emitter.emit(Event {
        kind: phase.started(),
        error: None,
        message,
    });

    session.spawn(async move {
        match work.await {
            Ok(Some(message)) => emitter.emit_message(phase.completed(), message),
            Ok(None) => emitter.emit_kind(phase.completed()),
            Err(e) => {
                error!(phase = ?phase, error = %e, "Phase failed");
                emitter.emit_error(phase.failed(), e);
            }
        }
    });
}

/// Await `fut` unless `cancel` fires first.
///
/// # Errors
/// Returns [`ProvisionError::Cancelled`] if cancelled.
pub(crate) async fn guard<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, ProvisionError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProvisionError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Fail if `cancel` has fired.
///
/// Resource-creating calls are awaited without racing cancellation so the
/// created resource is always recorded for rollback; this is checked once
/// the compensation is in place.
///
/// # Errors
/// Returns [`ProvisionError::Cancelled`] if cancelled.
pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        Err(ProvisionError::Cancelled)
    } else {
        Ok(())
    }
}

/// Generate the single-use key pair off the async workers.
///
/// # Errors
/// Returns [`ProvisionError::KeyGeneration`] if generation fails or panics.
pub(crate) async fn generate_key_pair() -> Result<SshKeyPair, ProvisionError> {
    tokio::task::spawn_blocking(make_ssh_key_pair)
        .await
        .map_err(|e| ProvisionError::KeyGeneration(e.to_string()))?
}

/// Keep or compensate the resources of a provisioning attempt and turn
/// its result into the completion message.
///
/// # Errors
/// Returns the attempt's error after unwinding `rollback`.
pub(crate) async fn conclude(
    rollback: Rollback,
    result: Result<ServerConfiguration, ProvisionError>,
) -> Result<Option<String>, ProvisionError> {
    match result {
        Ok(config) => {
            rollback.disarm();
            let encoded = config.encode().map_err(CloudError::from)?;
            Ok(Some(encoded))
        }
        Err(e) => {
            rollback.unwind().await;
            Err(e)
        }
    }
}
