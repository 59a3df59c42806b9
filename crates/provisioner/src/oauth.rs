//! OAuth phase of a session.
//!
//! The redirect listener and browser mechanics live behind two seams: a
//! [`BrowserOpener`] that shows the authorization page and a
//! [`TokenSource`] that eventually yields the access token.

use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::ProvisionError;
use crate::session::{EventKind, Session};

/// Authorization endpoint of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OAuthEndpoint {
    /// Authorization page URL.
    pub authorize_url: &'static str,
    /// Requested scopes.
    pub scopes: &'static [&'static str],
}

/// Opens a URL for the user.
pub trait BrowserOpener: Send + Sync {
    /// Open `url`.
    ///
    /// # Errors
    /// Returns an error if no browser could be launched.
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the desktop's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopBrowser;

impl BrowserOpener for DesktopBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        let mut cmd = if cfg!(target_os = "macos") {
            Command::new("open")
        } else if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/c", "start"]);
            cmd
        } else {
            Command::new("xdg-open")
        };
        cmd.arg(url).spawn().map(|_| ())
    }
}

/// Yields the access token once the user has authorized.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Wait for the token. `Ok(None)` means the user cancelled.
    async fn token(&self, cancel: &CancellationToken) -> Result<Option<String>, ProvisionError>;
}

/// A token known up front, e.g. from configuration.
#[derive(Debug, Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Resolve to `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Resolve as if the user cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _cancel: &CancellationToken) -> Result<Option<String>, ProvisionError> {
        Ok(self.0.clone())
    }
}

/// Everything needed to run the OAuth phase.
#[derive(Clone)]
pub struct OAuthFlow {
    /// Page shown to the user, if any.
    pub authorize_url: Option<Url>,
    /// Browser launcher; `None` skips opening the page.
    pub browser: Option<Arc<dyn BrowserOpener>>,
    /// Token source.
    pub tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for OAuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthFlow")
            .field("authorize_url", &self.authorize_url.as_ref().map(Url::as_str))
            .field("browser", &self.browser.is_some())
            .finish_non_exhaustive()
    }
}

impl OAuthFlow {
    /// Interactive flow: open `authorize_url` and wait on `tokens`.
    #[must_use]
    pub fn interactive(
        authorize_url: Url,
        browser: Arc<dyn BrowserOpener>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            authorize_url: Some(authorize_url),
            browser: Some(browser),
            tokens,
        }
    }

    /// Non-interactive flow with a pre-issued token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            authorize_url: None,
            browser: None,
            tokens: Arc::new(StaticToken::new(token)),
        }
    }
}

/// Build the implicit-grant authorization URL for `endpoint`.
///
/// # Errors
/// Returns an error if the endpoint URL is malformed.
pub fn authorize_url(
    endpoint: &OAuthEndpoint,
    client_id: &str,
    redirect_uri: &str,
) -> Result<Url, url::ParseError> {
    let state = format!("{:016x}", rand::random::<u64>());
    Url::parse_with_params(
        endpoint.authorize_url,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "token"),
            ("scope", &endpoint.scopes.join(" ")),
            ("state", &state),
        ],
    )
}

/// Run the OAuth phase in the background, emitting `OAuthStarted`
/// followed by exactly one of `OAuthCompleted` (token as message),
/// `OAuthCancelled` or `OAuthError`.
pub fn start_oauth(session: &Session, flow: OAuthFlow) {
    let emitter = session.emitter();
    let cancel = session.cancellation();

    session.spawn(async move {
        emitter.emit_kind(EventKind::OAuthStarted);

        if let (Some(browser), Some(url)) = (&flow.browser, &flow.authorize_url) {
            info!(url = %url, "Opening browser for authorization");
            if let Err(e) = browser.open(url.as_str()) {
                error!(error = %e, "Failed to open browser");
                emitter.emit_error(
                    EventKind::OAuthError,
                    ProvisionError::Authentication(format!("failed to open browser: {e}")),
                );
                return;
            }
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            token = flow.tokens.token(&cancel) => token,
        };

        match outcome {
            Ok(Some(token)) => {
                debug!("OAuth completed");
                emitter.emit_message(EventKind::OAuthCompleted, token);
            }
            Ok(None) => {
                info!("OAuth cancelled by user");
                emitter.emit_kind(EventKind::OAuthCancelled);
            }
            Err(e) => {
                error!(error = %e, "OAuth failed");
                emitter.emit_error(EventKind::OAuthError, e);
            }
        }
    });
}
