/**
 * POWER METER - Mixer motor supply readings (PZEM-016 on its own RTU line)
 *
 * ROLE :
 * Optional. Polls the meter's input registers at a fixed interval, caches the
 * last good reading and pushes it to every session as a power-update notice.
 *
 * REGISTERS (function 0x04) :
 * - 0x0000 voltage, 0.1 V
 * - 0x0001 current, 0.01 A
 * - 0x0003 active power, 0.1 W
 *
 * A failed poll is logged and skipped; the cache keeps the previous reading.
 */

use crate::config::PowerMeterConf;
use crate::protocol::{unix_millis, Notices, ServerMessage};
use crate::relays::coils::{flatten, open_rtu};
use crate::relays::RelayError;
use crate::state::{new_state, snapshot, Shared};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_modbus::client::{Context, Reader};
use tracing::{debug, info, warn};

const FIRST_REGISTER: u16 = 0x0000;
const REGISTER_COUNT: u16 = 4;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerReading {
    pub voltage: f64,
    pub ampere: f64,
    pub power: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
}

impl PowerReading {
    pub fn from_registers(regs: &[u16], read_at: OffsetDateTime) -> Option<Self> {
        if regs.len() < usize::from(REGISTER_COUNT) {
            return None;
        }
        Some(Self {
            voltage: f64::from(regs[0]) / 10.0,
            ampere: f64::from(regs[1]) / 100.0,
            power: f64::from(regs[3]) / 10.0,
            read_at,
        })
    }

    pub fn to_notice(&self) -> ServerMessage {
        ServerMessage::PowerUpdate {
            voltage: self.voltage,
            ampere: self.ampere,
            power: self.power,
            timestamp: unix_millis(self.read_at),
        }
    }
}

#[async_trait]
pub trait RegisterSource: Send {
    async fn read_input_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, RelayError>;
}

/// Opens the line lazily and reopens it after a transport failure.
pub struct RtuRegisters {
    conf: PowerMeterConf,
    ctx: Option<Context>,
}

impl RtuRegisters {
    pub fn new(conf: PowerMeterConf) -> Self {
        Self { conf, ctx: None }
    }
}

#[async_trait]
impl RegisterSource for RtuRegisters {
    async fn read_input_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, RelayError> {
        if self.ctx.is_none() {
            self.ctx = Some(open_rtu(&self.conf.port, self.conf.baud_rate, self.conf.slave_id)?);
            info!(port = %self.conf.port, "power meter connected");
        }
        let ctx = self.ctx.as_mut().ok_or(RelayError::Disconnected)?;
        let res = flatten(
            tokio::time::timeout(Duration::from_secs(1), ctx.read_input_registers(start, count)).await,
        );
        if matches!(res, Err(RelayError::Transport(_))) {
            self.ctx = None;
        }
        res
    }
}

pub struct PowerMeter {
    latest: Shared<Option<PowerReading>>,
    stop_tx: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PowerMeter {
    pub fn spawn(mut source: Box<dyn RegisterSource>, period: Duration, notices: Notices) -> Self {
        let latest: Shared<Option<PowerReading>> = new_state(None);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache = latest.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match source.read_input_registers(FIRST_REGISTER, REGISTER_COUNT).await {
                            Ok(regs) => match PowerReading::from_registers(&regs, OffsetDateTime::now_utc()) {
                                Some(reading) => {
                                    debug!(voltage = reading.voltage, ampere = reading.ampere, "power reading");
                                    let _ = notices.send(reading.to_notice());
                                    *cache.lock() = Some(reading);
                                }
                                None => warn!(got = regs.len(), "short power meter reply"),
                            },
                            Err(e) => warn!("power meter read failed: {e}"),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Self { latest, stop_tx, handle: parking_lot::Mutex::new(Some(handle)) }
    }

    pub fn from_config(conf: &PowerMeterConf, notices: Notices) -> Self {
        let period = Duration::from_millis(conf.poll_interval_ms.max(100));
        Self::spawn(Box::new(RtuRegisters::new(conf.clone())), period, notices)
    }

    pub fn latest(&self) -> Option<PowerReading> {
        snapshot(&self.latest)
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let Some(handle) = self.handle.lock().take() else { return };
        if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
            warn!("power meter loop did not stop in time");
        }
    }
}
