//! Error types for provisioning sessions and cloud collaborators.

use thiserror::Error;

/// Errors surfaced by a provider's cloud API client.
///
/// Empty listings are returned as `Ok(vec![])`; every variant here is a
/// genuine failure.
#[derive(Error, Debug)]
pub enum CloudError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Token was rejected or lacks the required scopes.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration or unexpected API shape.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Project or account failed a health pre-check.
    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    /// Quota exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors carried by terminal session events.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The OAuth phase failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Token exchange or scope enumeration failed.
    #[error("validation failed: {0}")]
    Validation(#[source] CloudError),

    /// Remote shell unreachable after exhausting retries.
    #[error("failed to dial SSH after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: ShellError,
    },

    /// Remote host presented an unexpected host key. Never retried.
    #[error("host key mismatch for {address}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        address: String,
        expected: String,
        actual: String,
    },

    /// A bootstrap command exited non-zero.
    #[error("command {command:?} failed with status {status}: {output}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    /// Server configuration could not be read after install.
    #[error("failed to read config file: {0}")]
    ConfigRead(String),

    /// Server configuration could not be parsed after install.
    #[error("failed to parse config file: {0}")]
    ConfigParse(#[source] serde_json::Error),

    /// Cloud resource creation or inspection failed.
    #[error("provisioning failed: {0}")]
    Cloud(#[from] CloudError),

    /// Any other provisioning failure.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// SSH key pair generation failed.
    #[error("failed to generate SSH key pair: {0}")]
    KeyGeneration(String),

    /// No compartment entry or location could be chosen.
    #[error("selection failed: {0}")]
    Selection(String),

    /// The session was cancelled while work was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Events arrived in an order the session protocol forbids.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Errors from a single remote shell operation.
#[derive(Error, Debug)]
pub enum ShellError {
    /// TCP connect, handshake or authentication failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Session or channel level failure.
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// I/O on the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host key did not match the pinned fingerprint.
    #[error("host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },
}

impl ShellError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::HostKeyMismatch { .. })
    }
}

/// Result alias for provisioning operations.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_host_key_mismatch_is_final() {
        assert!(ShellError::Connect("connection refused".into()).is_retryable());
        assert!(!ShellError::HostKeyMismatch {
            expected: "SHA256:a".into(),
            actual: "SHA256:b".into(),
        }
        .is_retryable());
    }
}
