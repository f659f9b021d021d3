use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use forgeauth::config::{self, ConfigOverrides};
use forgeauth::forge::{self, rate_limit::RateLimitState};
use forgeauth::http;
use forgeauth::metrics::MetricsRegistry;
use forgeauth::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgeauth", about = "GitHub token forward-auth service")]
struct Cli {
    /// Path to the YAML configuration file.  Without it,
    /// /etc/forgeauth/config.yaml is read if it exists.
    #[arg(short, long)]
    config: Option<String>,

    /// GitHub organisation to authorise against (overrides the file).
    #[arg(long)]
    org: Option<String>,

    /// Listen address (overrides the file).
    #[arg(long)]
    listen: Option<String>,

    /// Cache lifetime in seconds, 0 to disable (overrides the file).
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Maximum number of cached results (overrides the file).
    #[arg(long)]
    cache_max_size: Option<usize>,

    /// Refuse classic personal access tokens: true or false (overrides the file).
    #[arg(long)]
    reject_classic_pats: Option<bool>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            org: self.org.clone(),
            listen: self.listen.clone(),
            api_url: None,
            cache_ttl: self.cache_ttl,
            cache_max_size: self.cache_max_size,
            reject_classic_pats: self.reject_classic_pats,
        }
        .with_env()
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: SocketAddr = state
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, org = %state.config.org, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path, cli.overrides())?,
        None => config::load_config_if_present(config::DEFAULT_CONFIG_PATH, cli.overrides())?,
    };
    let config_path = cli.config.as_deref().unwrap_or(config::DEFAULT_CONFIG_PATH);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path,
        org = %config.org,
        api_url = %config.upstream.api_url,
        cache_ttl_secs = config.cache.ttl,
        cache_max_size = config.cache.max_size,
        reject_classic_pats = config.auth.reject_classic_pats,
        "starting forgeauth"
    );

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Identity provider ----
    let rate_limit = RateLimitState::new()
        .with_gauge(metrics.metrics.upstream_api_rate_limit_remaining.clone());
    let provider = forge::build_provider(&config, rate_limit.clone(), Some(Arc::clone(&metrics.metrics)))?;

    // ---- App state ----
    let state = AppState::build(config, provider, rate_limit, metrics);

    // ---- Serve until signalled ----
    let result = run_http_server(state.clone()).await;
    state.cache.stop();

    match &result {
        Ok(()) => tracing::info!("forgeauth shut down cleanly"),
        Err(e) => tracing::error!(error = %format!("{e:#}"), "HTTP server failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_alone_configure_the_service() {
        let cli = Cli::try_parse_from([
            "forgeauth",
            "--org",
            "acme",
            "--cache-ttl",
            "60",
            "--cache-max-size",
            "5",
            "--reject-classic-pats",
            "false",
        ])
        .unwrap();
        assert_eq!(cli.config, None);

        let overrides = cli.overrides();
        assert_eq!(overrides.org.as_deref(), Some("acme"));
        assert_eq!(overrides.cache_ttl, Some(60));
        assert_eq!(overrides.cache_max_size, Some(5));
        assert_eq!(overrides.reject_classic_pats, Some(false));
    }

    #[test]
    fn policy_flags_are_optional() {
        let cli = Cli::try_parse_from(["forgeauth", "--config", "/tmp/forgeauth.yaml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/forgeauth.yaml"));
        assert_eq!(cli.cache_ttl, None);
        assert_eq!(cli.reject_classic_pats, None);
    }
}
