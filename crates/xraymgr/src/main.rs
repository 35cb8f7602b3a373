//! xraymgr server
//!
//! HTTP control plane plus the session and traffic background loops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use xraymgr::api::{AppState, build_router};
use xraymgr::links::LinkBuilder;
use xraymgr::notify::{NoopNotifier, Notifier, WebhookNotifier};
use xraymgr::proxy::Synthesizer;
use xraymgr::sessions::{LogTailer, SessionMonitor};
use xraymgr::slots::{SlotSwitchController, SystemdController};
use xraymgr::storage::Database;
use xraymgr::traffic::TrafficPoller;
use xraymgr::xray::XrayBinary;
use xraymgr_core::config::load_config;
use xraymgr_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "xraymgr")]
#[command(
    version,
    about = "xraymgr - credential store and blue/green config switcher for xray"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000", env = "XRAYMGR_ADDR")]
    addr: SocketAddr,

    /// Optional TOML configuration file.
    #[arg(long, env = "XRAYMGR_CONFIG")]
    config: Option<PathBuf>,

    /// Path to SQLite database file (overrides config and XRAY_DB).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter(&args.log_level), args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = args.db_path {
        config.database.path = path;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting xraymgr"
    );

    info!(path = %config.database.path.display(), "Opening credential store");
    let db = Database::open(&config.database.path).await?;

    let notifier: Arc<dyn Notifier> = match &config.notify.url {
        Some(url) => {
            info!(url = %url, "Webhook notifications enabled");
            Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(config.notify.timeout_secs),
            )?)
        }
        None => Arc::new(NoopNotifier),
    };

    let xray = Arc::new(XrayBinary::new(
        config.proxy.bin.clone(),
        vec![config.slots.a.api_port, config.slots.b.api_port],
        Duration::from_secs(config.proxy.validate_timeout_secs),
        Duration::from_secs(config.proxy.stats_timeout_secs),
    ));

    let switch = Arc::new(SlotSwitchController::new(
        db.clone(),
        config.proxy.template_path.clone(),
        Synthesizer::new(config.proxy.reality_tag.clone(), config.proxy.api_tag.clone()),
        config.slots.clone(),
        Arc::new(SystemdController::new(Duration::from_secs(
            config.slots.restart_timeout_secs,
        ))),
        xray.clone(),
    ));
    info!(active = %switch.active_slot().await, "Slot controller ready");

    let traffic = Arc::new(TrafficPoller::new(db.clone(), xray, Arc::clone(&notifier)));

    let tailer = LogTailer::new(vec![
        config.slots.a.access_log.clone(),
        config.slots.b.access_log.clone(),
    ]);
    let sessions = Arc::new(SessionMonitor::new(
        tailer,
        Duration::from_secs(config.sessions.kick_cooldown_secs),
        db.clone(),
        Arc::clone(&switch),
        notifier,
    ));

    let links = Arc::new(LinkBuilder::new(
        config.links.clone(),
        config.proxy.template_path.clone(),
        config.proxy.reality_tag.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let traffic_handle = Arc::clone(&traffic).spawn(
        Duration::from_secs(config.traffic.interval_secs.max(1)),
        shutdown_rx.clone(),
    );
    let sessions_handle = Arc::clone(&sessions).spawn(config.sessions.clone(), shutdown_rx);
    if config.sessions.auto_kick {
        info!("Automatic multi-session enforcement enabled");
    }

    let app = build_router(AppState {
        db,
        switch,
        links,
        sessions,
        traffic,
        default_window: config.sessions.window_secs,
    });

    let listener = tokio::net::TcpListener::bind(args.addr).await?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %args.addr, "HTTP server ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = traffic_handle.await;
    let _ = sessions_handle.await;

    info!("xraymgr stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
