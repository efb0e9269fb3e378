/**
 * BATCHPLANT BUTTON NODE - Physical button monitor for the plant panel
 *
 * ROLE : Samples the panel's push buttons and streams every press/release to
 * the kernel as physical-button-state over an edge-source session.
 * It never commands relays; the kernel only rebroadcasts what it sends.
 *
 * BEHAVIOUR : no debounce, fixed poll rate, reconnects forever with a fixed delay.
 */

mod config;
mod frame;
mod inputs;
mod link;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchplant_button_node=info")),
        )
        .init();

    let cfg = config::load_config().await.context("failed to load button node configuration")?;
    let bank = open_inputs(&cfg)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested");
        }
        let _ = stop_tx.send(true);
    });

    info!(
        poll_hz = cfg.poll_hz,
        buttons = cfg.buttons.len(),
        "button node starting"
    );
    link::run(cfg, bank, stop_rx).await;
    Ok(())
}

#[cfg(feature = "rpi")]
fn open_inputs(cfg: &config::NodeConfig) -> Result<Box<dyn inputs::InputBank>> {
    let bank = inputs::RppalInputs::open(&cfg.buttons).context("cannot claim button pins")?;
    Ok(Box::new(bank))
}

#[cfg(not(feature = "rpi"))]
fn open_inputs(cfg: &config::NodeConfig) -> Result<Box<dyn inputs::InputBank>> {
    warn!("built without `rpi`: buttons are simulated and stay released");
    let names: Vec<String> = cfg.buttons.keys().cloned().collect();
    Ok(Box::new(inputs::SimulatedInputs::new(&names, cfg.active_low)))
}
