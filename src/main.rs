use anyhow::{Context, Result};
use clap::Parser;
use oauth_authn::config::{GatewayConfig, ValidationFlags};
use oauth_authn::gateway::{self, DEFAULT_SESSION_COOKIE, GatewayOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "oauth-authn")]
#[command(about = "OAuth 2.0 / OpenID Connect authenticating reverse proxy")]
struct Args {
    /// JSON file with contexts and handler settings
    #[arg(short, long, env = "AUTHN_CONFIG")]
    config: PathBuf,

    /// Host to bind to
    #[arg(long, env = "AUTHN_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "AUTHN_PORT", default_value = "8080")]
    port: u16,

    /// Upstream base URL. Without it authenticated requests get their tokens echoed back.
    #[arg(long, env = "AUTHN_UPSTREAM")]
    upstream: Option<String>,

    /// Name of the session cookie
    #[arg(long, env = "AUTHN_SESSION_COOKIE", default_value = DEFAULT_SESSION_COOKIE)]
    session_cookie: String,

    /// Seconds a session may stay unused before it is dropped
    #[arg(long, env = "AUTHN_SESSION_IDLE_SECS", default_value = "1800")]
    session_idle_secs: u64,

    /// Mark the session cookie Secure (clients connect over TLS)
    #[arg(long, env = "AUTHN_SECURE_COOKIE")]
    secure_cookie: bool,

    /// Header carrying the client certificate from the TLS terminator
    #[arg(long, env = "AUTHN_CLIENT_CERT_HEADER")]
    client_cert_header: Option<String>,

    /// Requests per second per client IP
    #[arg(long, env = "AUTHN_RATE_LIMIT", default_value = "20")]
    rate_limit: u64,
}

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth_authn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args.config)?;
    let flags = ValidationFlags::from_env();
    if flags.skip_at || flags.skip_idt {
        tracing::warn!(
            "token validation partly disabled (access token: {}, id token: {})",
            flags.skip_at,
            flags.skip_idt
        );
    }

    let options = GatewayOptions {
        upstream: args.upstream.clone(),
        session_cookie: args.session_cookie.clone(),
        session_idle: std::time::Duration::from_secs(args.session_idle_secs),
        secure_cookie: args.secure_cookie,
        client_cert_header: args.client_cert_header.clone(),
        flags,
    };
    let app = gateway::build_router(&config, &options)?;

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(args.rate_limit.max(1))
            .burst_size((args.rate_limit.max(1) * 3) as u32)
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });
    let app = app.layer(GovernorLayer::new(governor_conf));

    // TcpListener::bind resolves hostnames like "localhost"
    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    match &args.upstream {
        Some(upstream) => tracing::info!("listening on {}, forwarding to {}", bind_addr, upstream),
        None => tracing::info!("listening on {} without upstream", bind_addr),
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
