//! Compensating actions for partially provisioned resources.
//!
//! Each resource-creating step pushes the action that undoes it. If a later
//! step fails the stack is unwound in reverse order; on success it is
//! disarmed and the resources are kept.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::error::CloudError;

/// Ordered stack of compensating actions.
pub struct Rollback {
    enabled: bool,
    steps: Vec<(String, BoxFuture<'static, Result<(), CloudError>>)>,
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.steps.iter().map(|(l, _)| l.as_str()).collect();
        f.debug_struct("Rollback")
            .field("enabled", &self.enabled)
            .field("steps", &labels)
            .finish()
    }
}

impl Rollback {
    /// Create an empty stack. A disabled stack records nothing and
    /// leaves resources in place on failure.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            steps: Vec::new(),
        }
    }

    /// Register the action undoing the step that just succeeded.
    pub fn push<F>(&mut self, label: impl Into<String>, undo: F)
    where
        F: Future<Output = Result<(), CloudError>> + Send + 'static,
    {
        if self.enabled {
            self.steps.push((label.into(), undo.boxed()));
        }
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no action is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything that was created.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run every action, most recent first. Failures are logged and do not
    /// stop the remaining actions.
    pub async fn unwind(mut self) {
        if !self.enabled {
            warn!("Rollback disabled; partially created resources were left in place");
            return;
        }

        while let Some((label, undo)) = self.steps.pop() {
            match undo.await {
                Ok(()) => info!(step = %label, "Rolled back"),
                Err(e) => error!(step = %label, error = %e, "Rollback step failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let log = recorder();
        let mut rollback = Rollback::new(true);
        for name in ["key", "instance", "address"] {
            let log = Arc::clone(&log);
            rollback.push(name, async move {
                log.lock().unwrap().push(name);
                Ok(())
            });
        }
        assert_eq!(rollback.len(), 3);

        rollback.unwind().await;
        assert_eq!(*log.lock().unwrap(), vec!["address", "instance", "key"]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_unwind() {
        let log = recorder();
        let mut rollback = Rollback::new(true);
        let first = Arc::clone(&log);
        rollback.push("first", async move {
            first.lock().unwrap().push("first");
            Ok(())
        });
        rollback.push("second", async move { Err(CloudError::NotFound("gone".into())) });

        rollback.unwind().await;
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_disabled_and_disarmed_do_nothing() {
        let log = recorder();

        let mut disabled = Rollback::new(false);
        let l = Arc::clone(&log);
        disabled.push("step", async move {
            l.lock().unwrap().push("disabled");
            Ok(())
        });
        assert!(disabled.is_empty());
        disabled.unwind().await;

        let mut armed = Rollback::new(true);
        let l = Arc::clone(&log);
        armed.push("step", async move {
            l.lock().unwrap().push("disarmed");
            Ok(())
        });
        armed.disarm();

        assert!(log.lock().unwrap().is_empty());
    }
}
