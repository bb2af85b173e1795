use anyhow::{Context, Result};
use axum::routing::get;
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use session_host::{
    FileConfig, HostOptions, HubOptions, ScopeProvider, ServiceRegistry, SessionBuilder,
    SessionHub, SessionServicesExt, Startup, load_config,
};

#[derive(Parser)]
#[command(name = "session-host")]
#[command(about = "Hosts interactive server-side sessions over WebSocket")]
struct Cli {
    /// Path to config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Per-session click counter
#[derive(Default)]
struct Counter(AtomicI64);

#[derive(Deserialize)]
struct Increment {
    #[serde(default = "one")]
    by: i64,
}

fn one() -> i64 {
    1
}

/// Demo application: one counter per session, rendered by the client.
#[derive(Default)]
struct CounterApp;

impl Startup for CounterApp {
    fn configure_services(&self, services: &mut ServiceRegistry) -> Result<()> {
        services.try_add_scoped::<Counter, _>(|_| Ok(Arc::new(Counter::default())));
        Ok(())
    }

    fn configure(&self, app: &mut SessionBuilder<'_>, _services: &ScopeProvider) -> Result<()> {
        app.add_component("counter", "#app");
        app.on_event("increment", |scope: Arc<ScopeProvider>, payload: Value| async move {
            let step = if payload.is_null() {
                1
            } else {
                serde_json::from_value::<Increment>(payload)?.by
            };
            let counter = scope.resolve::<Counter>()?;
            let count = counter.0.fetch_add(step, Ordering::SeqCst) + step;
            scope
                .interop()?
                .invoke_void("counter.render", vec![json!(count)])
                .await?;
            Ok(())
        });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "session_host=debug,tower_http=debug,info"
    } else {
        "session_host=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let host = cli
        .host
        .or_else(|| file_config.server.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.or(file_config.server.port).unwrap_or(9100);

    // Options first: the baseline registration only fills in what is absent.
    let mut services = ServiceRegistry::new();
    services.try_add_singleton(HostOptions::from_file(&file_config.hub));
    services.try_add_singleton(HubOptions::from_file(&file_config.hub));
    services
        .add_session_services_with::<CounterApp>()
        .context("Failed to register session services")?;
    let provider = services.build();

    let hub = provider.get::<SessionHub>()?;
    let app = session_host::hub::router(&provider)
        .context("Failed to build session router")?
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("Session host listening on http://{}", actual_addr);
    for endpoint in provider.endpoints().endpoints() {
        info!("  WS {} - session endpoint", endpoint);
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    hub.shutdown().await;
    info!("Shutdown complete");
    server_result
}
