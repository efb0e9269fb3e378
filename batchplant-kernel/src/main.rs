/**
 * BATCHPLANT KERNEL - Plant-floor coordinator entry point
 *
 * ROLE : Wires config, scales, relay bank, watchdog, power meter and the
 * session server, then owns the shutdown sequence.
 *
 * SHUTDOWN ORDER : sessions -> watchdog -> acquisition -> meter -> final all-off,
 * so the last command any relay receives is "off".
 */

mod acquisition;
mod config;
mod health;
mod http;
mod meter;
mod protocol;
mod relays;
mod safety;
mod session;
mod state;
mod weights;

use crate::acquisition::serial::SerialPortConnector;
use crate::acquisition::AcquisitionManager;
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::meter::PowerMeter;
use crate::protocol::notice_channel;
use crate::relays::build_backend;
use crate::safety::SafetySupervisor;
use crate::session::{SessionHub, SessionServer};
use crate::weights::WeightTable;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchplant_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("failed to load plant configuration")?;
    info!(
        sources = cfg.sources.len(),
        relays = cfg.actuators.relays.len(),
        backend = ?cfg.actuators.backend,
        "batchplant kernel starting"
    );

    let notices = notice_channel();
    let weights = WeightTable::new(cfg.sources.keys().cloned());

    let backend = build_backend(&cfg.actuators)
        .await
        .context("failed to initialise relay backend")?;

    let acquisition = Arc::new(AcquisitionManager::new(
        cfg.sources.clone(),
        cfg.serial.clone(),
        Arc::new(SerialPortConnector::new(cfg.serial.clone())),
        weights.clone(),
        notices.clone(),
    ));
    acquisition.start();

    let meter = cfg
        .power_meter
        .as_ref()
        .map(|conf| Arc::new(PowerMeter::from_config(conf, notices.clone())));

    let safety = Arc::new(SafetySupervisor::new(
        backend.clone(),
        weights.clone(),
        cfg.safety.clone(),
        notices.clone(),
    ));
    safety.start();

    let hub = Arc::new(SessionHub::new(backend.clone(), safety.clone(), weights, notices));
    let app_state = AppState {
        hub: hub.clone(),
        acquisition: acquisition.clone(),
        meter: meter.clone(),
        health: HealthTracker::new(),
    };

    let addr = format!("{}:{}", cfg.listen.host, cfg.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;
    let server = SessionServer::start(hub, listener, http::build_router(app_state), cfg.broadcast_period())
        .context("failed to start session server")?;
    info!("listening on ws://{}", server.local_addr());

    wait_for_signal().await;
    warn!("shutdown requested");

    server.stop().await;
    safety.stop().await;
    acquisition.stop().await;
    if let Some(meter) = meter {
        meter.stop().await;
    }
    if backend.set_all(false).await {
        info!("all relays off, bye");
    } else {
        warn!("final all-off was not confirmed by every relay");
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
