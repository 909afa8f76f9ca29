//! # carenest-gateway
//!
//! carenest gateway binary: loads settings, wires the collaborators, and
//! serves the real-time connection layer until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use carenest_core::UserId;
use carenest_server::collaborators::{
    Collaborators, EchoChatBackend, InMemoryFamilyService, JwtAuthValidator, issue_token,
};
use carenest_server::config::ServerConfig;
use carenest_server::server::CarenestServer;
use carenest_settings::CarenestSettings;
use clap::{Parser, Subcommand};

/// carenest real-time gateway.
#[derive(Parser, Debug)]
#[command(name = "carenest-gateway", about = "carenest real-time gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.carenest/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Family directory JSON file.
    #[arg(long)]
    families: Option<PathBuf>,

    /// Log level (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an access token for a user, signed with the configured secret.
    Token {
        /// User the token is issued for.
        user_id: String,

        /// Token lifetime in seconds.
        #[arg(long, default_value = "3600")]
        ttl_secs: u64,
    },
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(carenest_settings::settings_path)
    }

    /// Server configuration from settings with CLI overrides applied.
    fn server_config(&self, settings: &CarenestSettings) -> ServerConfig {
        let mut config = ServerConfig::from(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

fn load_families(path: Option<&Path>) -> Result<InMemoryFamilyService> {
    let Some(path) = path else {
        return Ok(InMemoryFamilyService::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read family directory: {}", path.display()))?;
    InMemoryFamilyService::from_json(&content)
        .with_context(|| format!("Invalid family directory: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings_path();
    let settings = carenest_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    settings.validate().context("Invalid settings")?;

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(settings.logging.level.as_str());
    carenest_core::logging::init_subscriber(level, args.json_logs || settings.logging.json);

    if settings.auth.jwt_secret.is_empty() {
        bail!("auth.jwtSecret is not set (settings file or CARENEST_JWT_SECRET)");
    }

    if let Some(Command::Token { user_id, ttl_secs }) = &args.command {
        let token = issue_token(
            settings.auth.jwt_secret.as_bytes(),
            &UserId::from(user_id.as_str()),
            Duration::from_secs(*ttl_secs),
            settings.auth.issuer.as_deref(),
        )
        .context("Failed to issue token")?;
        println!("{token}");
        return Ok(());
    }

    let families = load_families(args.families.as_deref())?;
    tracing::info!(families = families.family_count(), "family directory loaded");

    let collaborators = Collaborators {
        auth: Arc::new(JwtAuthValidator::from_settings(&settings.auth)),
        chat: Arc::new(EchoChatBackend::default()),
        family: Arc::new(families),
    };

    let mut server = CarenestServer::new(args.server_config(&settings), collaborators);
    match carenest_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!("carenest gateway listening on http://{addr}");

    carenest_server::shutdown::shutdown_signal().await;

    tracing::info!("Shutting down...");
    server.manager().shutdown().await;
    server.shutdown().shutdown();
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
