//! TradeGuard - pre-trade risk and compliance monitor
//!
//! Runs the monitor against the paper gateway and serves the operator
//! control API until Ctrl+C.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeguard_backend::api;
use tradeguard_backend::clock::SystemClock;
use tradeguard_backend::config::Settings;
use tradeguard_backend::gateway::paper::PaperGateway;
use tradeguard_backend::gateway::GatewayEvent;
use tradeguard_backend::MonitorContext;

#[derive(Parser, Debug)]
#[command(name = "tradeguard")]
#[command(about = "Pre-trade risk and compliance monitor")]
struct Args {
    /// Config file (TOML). Falls back to TRADEGUARD_CONFIG, then defaults.
    #[arg(short, long, env = "TRADEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the control API bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = Settings::load(path)?;
            settings.apply_env_overrides();
            settings
        }
        None => Settings::from_env(),
    };
    if let Some(bind) = args.bind {
        settings.api.bind_addr = bind;
    }

    info!(
        instruments = settings.validator.instruments.len(),
        cooldown_secs = settings.thresholds.cooldown_secs,
        "starting tradeguard"
    );

    let (gateway, mut events) = PaperGateway::new(settings.gateway.paper.clone());
    let gateway = Arc::new(gateway.with_retry_policy(settings.gateway.retry.clone()));
    let ctx = Arc::new(MonitorContext::new(
        &settings,
        gateway.clone(),
        Arc::new(SystemClock::new()),
    ));
    ctx.start();

    // Gateway event pump
    let pump = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let lost = matches!(event, GatewayEvent::FrontDisconnected { .. });
                ctx.ingest(event);
                if lost {
                    spawn_reconnect(gateway.clone(), ctx.clone());
                }
            }
            info!("gateway event stream closed");
        })
    };

    if let Err(e) = ctx.bring_up().await {
        error!("gateway bring-up failed: {:#}", e);
    }

    let refresh = spawn_snapshot_refresh(ctx.clone(), settings.gateway.snapshot_refresh_secs);

    let addr: SocketAddr = settings
        .api
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.api.bind_addr))?;
    let app = api::create_router(ctx.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(addr).await?;
    info!("control API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(refresh) = refresh {
        refresh.abort();
    }
    pump.abort();
    ctx.shutdown().await;
    info!("tradeguard stopped");
    Ok(())
}

/// Run the gateway's retry schedule, then reload snapshots on success.
fn spawn_reconnect(gateway: Arc<PaperGateway>, ctx: Arc<MonitorContext>) {
    tokio::spawn(async move {
        match gateway.reconnect().await {
            Ok(attempt) => {
                info!(attempt, "gateway session restored");
                if let Err(e) = ctx.refresh_snapshots().await {
                    warn!("snapshot refresh after reconnect failed: {:#}", e);
                }
            }
            Err(e) => error!(error = %e, "gateway reconnect abandoned"),
        }
    });
}

fn spawn_snapshot_refresh(
    ctx: Arc<MonitorContext>,
    every_secs: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if every_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = ctx.refresh_snapshots().await {
                warn!("snapshot refresh failed: {:#}", e);
            }
        }
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeguard_backend=info,tradeguard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
