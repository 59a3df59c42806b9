//! Provisioner CLI - create a cloud instance and bootstrap a proxy server on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Password, Select};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisioner::oauth::{authorize_url, DesktopBrowser};
use provisioner::{
    choose_target, provisioner_for, run, Compartment, OAuthFlow, Outcome, Preferences,
    ProviderKind, ProvisionError, ProvisionerConfig, Selection, Selector, TokenSource,
};

/// Provisioner CLI - create and bootstrap a proxy server.
#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Provision a cloud instance and install a proxy server on it")]
struct Cli {
    /// Cloud provider (digitalocean, gcp). Overrides the configuration file.
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Pre-issued access token (or set `PROVISIONER_TOKEN` env var).
    #[arg(long, env = "PROVISIONER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration file path.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Account or billing account to use.
    #[arg(long)]
    compartment: Option<String>,

    /// Project to provision in.
    #[arg(long)]
    project: Option<String>,

    /// Location ID or label (e.g. ams3).
    #[arg(long)]
    location: Option<String>,

    /// Give up when no progress is reported for this many seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// Reads the access token the user copies from the redirect page.
struct PastedToken;

#[async_trait]
impl TokenSource for PastedToken {
    async fn token(&self, _cancel: &CancellationToken) -> Result<Option<String>, ProvisionError> {
        let token = tokio::task::spawn_blocking(|| {
            Password::with_theme(&ColorfulTheme::default())
                .with_prompt("Paste the access token (empty to cancel)")
                .allow_empty_password(true)
                .interact()
        })
        .await
        .map_err(|e| ProvisionError::Authentication(e.to_string()))?
        .map_err(|e| ProvisionError::Authentication(e.to_string()))?;

        let token = token.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }
}

/// Prompts on the terminal for anything not given on the command line.
struct PromptSelector(Preferences);

#[async_trait]
impl Selector for PromptSelector {
    async fn select(&self, compartments: Arc<[Compartment]>) -> Result<Selection, ProvisionError> {
        let prefs = self.0.clone();
        tokio::task::spawn_blocking(move || {
            choose_target(&compartments, &prefs, |prompt, options| {
                Select::with_theme(&ColorfulTheme::default())
                    .with_prompt(prompt)
                    .default(0)
                    .items(options)
                    .interact_opt()
                    .map_err(|e| ProvisionError::Selection(e.to_string()))?
                    .ok_or_else(|| ProvisionError::Selection("selection aborted".to_string()))
            })
        })
        .await
        .map_err(|e| ProvisionError::Selection(e.to_string()))?
    }
}

fn oauth_flow(config: &ProvisionerConfig, token: Option<String>) -> Result<OAuthFlow> {
    if let Some(token) = token.or_else(|| config.oauth.token.clone()) {
        return Ok(OAuthFlow::with_token(token));
    }

    if config.oauth.client_id.is_empty() {
        warn!("No OAuth client ID configured; the authorization page may reject the request");
    }
    let url = authorize_url(
        &config.provider.oauth_endpoint(),
        &config.oauth.client_id,
        &config.oauth.redirect_uri,
    )
    .context("Failed to build authorization URL")?;
    println!("If no browser opens, visit:\n  {url}");

    Ok(OAuthFlow::interactive(
        url,
        Arc::new(DesktopBrowser),
        Arc::new(PastedToken),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => ProvisionerConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ProvisionerConfig::default(),
    };
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }
    info!(provider = %config.provider, "Starting provisioner");

    let oauth = oauth_flow(&config, cli.token)?;
    let backend = provisioner_for(&config, oauth);
    let selector = PromptSelector(Preferences {
        compartment: cli.compartment,
        entry: cli.project,
        location: cli.location,
    });

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let outcome = run(
        backend.as_ref(),
        &selector,
        cli.idle_timeout.map(Duration::from_secs),
        interrupt,
    )
    .await;

    match outcome.context("Provisioning failed")? {
        Outcome::Provisioned(server) => {
            println!(
                "{}",
                server.encode().context("Failed to encode server configuration")?
            );
        }
        Outcome::NothingToProvision => {
            anyhow::bail!("No project is available to provision in; check billing and permissions");
        }
        Outcome::Cancelled => info!("Cancelled"),
    }

    Ok(())
}
