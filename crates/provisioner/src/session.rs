//! Provisioning sessions and the event protocol.
//!
//! A [`Session`] is the single event source for one provisioning attempt.
//! Provider implementations publish into it through an [`EventEmitter`];
//! the caller consumes events one at a time and decides when to advance
//! to the next phase. The valid orderings are:
//!
//! ```text
//! OAuthStarted -> (OAuthCompleted | OAuthCancelled | OAuthError)
//! OAuthCompleted -> ValidationStarted -> (ValidationCompleted | ValidationError)
//! ValidationCompleted -> ProvisioningStarted -> (ProvisioningCompleted | ProvisioningError)
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::ProvisionError;

/// Kind of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OAuthStarted,
    OAuthCompleted,
    OAuthCancelled,
    OAuthError,
    ValidationStarted,
    ValidationCompleted,
    ValidationError,
    ProvisioningStarted,
    ProvisioningCompleted,
    ProvisioningError,
}

impl EventKind {
    /// Whether this event ends the workflow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.is_error() || matches!(self, Self::OAuthCancelled | Self::ProvisioningCompleted)
    }

    /// Whether this event carries a failure.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::OAuthError | Self::ValidationError | Self::ProvisioningError
        )
    }

    /// Whether `self` may be emitted directly after `prev` (`None` at
    /// session start).
    #[must_use]
    pub fn may_follow(self, prev: Option<EventKind>) -> bool {
        match prev {
            None => self == Self::OAuthStarted,
            Some(Self::OAuthStarted) => matches!(
                self,
                Self::OAuthCompleted | Self::OAuthCancelled | Self::OAuthError
            ),
            Some(Self::OAuthCompleted) => self == Self::ValidationStarted,
            Some(Self::ValidationStarted) => {
                matches!(self, Self::ValidationCompleted | Self::ValidationError)
            }
            Some(Self::ValidationCompleted) => self == Self::ProvisioningStarted,
            Some(Self::ProvisioningStarted) => {
                matches!(self, Self::ProvisioningCompleted | Self::ProvisioningError)
            }
            Some(_) => false,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OAuthStarted => "oauth_started",
            Self::OAuthCompleted => "oauth_completed",
            Self::OAuthCancelled => "oauth_cancelled",
            Self::OAuthError => "oauth_error",
            Self::ValidationStarted => "validation_started",
            Self::ValidationCompleted => "validation_completed",
            Self::ValidationError => "validation_error",
            Self::ProvisioningStarted => "provisioning_started",
            Self::ProvisioningCompleted => "provisioning_completed",
            Self::ProvisioningError => "provisioning_error",
        };
        f.write_str(name)
    }
}

/// An immutable session event.
#[derive(Debug)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Failure cause, set on error events.
    pub error: Option<ProvisionError>,
    /// Payload: the OAuth token, the compartment entry being provisioned,
    /// or the encoded server configuration.
    pub message: Option<String>,
}

impl Event {
    /// Create an event without payload.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            error: None,
            message: None,
        }
    }

    /// Create an event carrying a message.
    #[must_use]
    pub fn with_message(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            error: None,
            message: Some(message.into()),
        }
    }

    /// Create an event carrying an error.
    #[must_use]
    pub fn failed(kind: EventKind, error: ProvisionError) -> Self {
        Self {
            kind,
            error: Some(error),
            message: None,
        }
    }
}

/// Checks a stream of event kinds against the protocol.
#[derive(Debug, Default, Clone)]
pub struct ProtocolTracker {
    last: Option<EventKind>,
}

impl ProtocolTracker {
    /// Create a tracker at session start.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next event kind.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Protocol`] if `kind` may not follow the
    /// previously observed event.
    pub fn observe(&mut self, kind: EventKind) -> Result<(), ProvisionError> {
        if !kind.may_follow(self.last) {
            let prev = self
                .last
                .map_or_else(|| "session start".to_string(), |k| k.to_string());
            return Err(ProvisionError::Protocol(format!(
                "{kind} may not follow {prev}"
            )));
        }
        self.last = Some(kind);
        Ok(())
    }

    /// Whether a terminal event has been observed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.last.is_some_and(EventKind::is_terminal)
    }
}

/// Publishing half of a session.
///
/// Once a terminal event has been sent every later event is dropped.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Event>,
    last: Arc<Mutex<Option<EventKind>>>,
}

impl EventEmitter {
    /// Publish an event.
    pub fn emit(&self, event: Event) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(prev) = *last {
            if prev.is_terminal() {
                warn!(
                    event = %event.kind,
                    terminal = %prev,
                    "Dropping event emitted after terminal event"
                );
                return;
            }
        }
        if !event.kind.may_follow(*last) {
            warn!(event = %event.kind, previous = ?*last, "Event emitted out of order");
        }

        if event.kind.is_error() && event.error.is_none() {
            warn!(event = %event.kind, "Error event emitted without a cause");
        }
        debug!(event = %event.kind, "Emitting session event");
        *last = Some(event.kind);
        if self.tx.send(event).is_err() {
            debug!("Session receiver dropped; event discarded");
        }
    }

    /// Publish an event without payload.
    pub fn emit_kind(&self, kind: EventKind) {
        self.emit(Event::new(kind));
    }

    /// Publish an event with a message.
    pub fn emit_message(&self, kind: EventKind, message: impl Into<String>) {
        self.emit(Event::with_message(kind, message));
    }

    /// Publish an error event.
    pub fn emit_error(&self, kind: EventKind, error: ProvisionError) {
        self.emit(Event::failed(kind, error));
    }

    /// Whether a terminal event has already been sent.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let last = *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.is_some_and(EventKind::is_terminal)
    }
}

/// One provisioning attempt: event source, cancellation handle and the
/// background tasks working on its behalf.
///
/// `Session` is a cheap handle; clones share the same channel.
#[derive(Debug, Clone)]
pub struct Session {
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a new session.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            events: Arc::new(tokio::sync::Mutex::new(rx)),
            emitter: EventEmitter {
                tx,
                last: Arc::new(Mutex::new(None)),
            },
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Publishing handle for provider implementations.
    #[must_use]
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    /// Cancellation token observed by every background task.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of all in-flight work.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a background task tracked by this session.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the session is cancelled and no event is queued.
    pub async fn recv(&self) -> Option<Event> {
        let mut events = self.events.lock().await;
        tokio::select! {
            biased;
            event = events.recv() => event,
            () = self.cancel.cancelled() => None,
        }
    }

    /// Wait for the next event for at most `timeout`.
    ///
    /// # Errors
    /// Returns [`tokio::time::error::Elapsed`] if no event arrived in time.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Event>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.recv()).await
    }

    /// Wait until every tracked background task has finished.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
