//! Fieldbus coil backend: one coil per relay on an RTU slave.
//!
//! Every transaction holds the bus lock, so commands never interleave on the
//! wire. A bus found closed at call time gets exactly one reconnect attempt.

use super::{ActuatorBackend, RelayError, RelayMap};
use crate::config::ModbusConf;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::{rtu, Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{debug, error, info, warn};

/// Protocol ceilings for FC01 reads and FC15 writes.
const MAX_READ_COILS: u32 = 2000;
const MAX_WRITE_COILS: u32 = 1968;

#[async_trait]
pub trait CoilBus: Send {
    fn is_connected(&self) -> bool;
    async fn connect(&mut self) -> Result<(), RelayError>;
    async fn write_coil(&mut self, address: u16, state: bool) -> Result<(), RelayError>;
    async fn write_coils(&mut self, start: u16, states: &[bool]) -> Result<(), RelayError>;
    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, RelayError>;
}

pub struct CoilBackend {
    map: RelayMap,
    inner: Mutex<CoilInner>,
}

struct CoilInner {
    bus: Box<dyn CoilBus>,
    state: BTreeMap<String, bool>,
}

impl CoilInner {
    async fn ensure_connected(&mut self) -> Result<(), RelayError> {
        if self.bus.is_connected() {
            return Ok(());
        }
        warn!("coil bus closed, reconnecting");
        self.bus.connect().await
    }

    /// Best-effort sequential single-coil writes; state follows confirmed writes only.
    async fn write_each(&mut self, relays: Vec<(u16, String)>, state: bool) -> bool {
        if let Err(e) = self.ensure_connected().await {
            error!("coil bus unavailable for single writes: {e}");
            return false;
        }
        let mut all_ok = true;
        for (address, name) in relays {
            match self.bus.write_coil(address, state).await {
                Ok(()) => {
                    self.state.insert(name, state);
                }
                Err(e) => {
                    error!(relay = %name, address, "coil write failed: {e}");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Reads `first..=last` in FC01-sized pieces.
    async fn read_span(&mut self, first: u16, last: u16) -> Result<Vec<bool>, RelayError> {
        let end = u32::from(last) + 1;
        let mut bits = Vec::with_capacity((end - u32::from(first)) as usize);
        let mut from = u32::from(first);
        while from < end {
            let count = (end - from).min(MAX_READ_COILS);
            // from <= last and count <= MAX_READ_COILS, both fit in u16
            let chunk = self.bus.read_coils(from as u16, count as u16).await?;
            bits.extend(chunk.into_iter().take(count as usize));
            from += count;
        }
        Ok(bits)
    }
}

/// One coil write covering `start..start+states.len()`, plus the relays it confirms.
struct CoilWrite {
    start: u16,
    states: Vec<bool>,
    relays: Vec<(u16, String)>,
}

impl CoilWrite {
    /// Splits into writes no longer than the FC15 limit.
    fn chunked(self) -> Vec<CoilWrite> {
        let state = self.states.first().copied().unwrap_or(false);
        let end = u32::from(self.start) + self.states.len() as u32;
        let mut out = Vec::new();
        let mut from = u32::from(self.start);
        while from < end {
            let to = (from + MAX_WRITE_COILS).min(end);
            let relays = self
                .relays
                .iter()
                .filter(|(addr, _)| (from..to).contains(&u32::from(*addr)))
                .cloned()
                .collect();
            // from < end <= u16::MAX + 1
            out.push(CoilWrite { start: from as u16, states: vec![state; (to - from) as usize], relays });
            from = to;
        }
        out
    }
}

impl CoilBackend {
    /// Connects (failure is only logged) and forces every coil off.
    pub async fn new(map: RelayMap, mut bus: Box<dyn CoilBus>) -> Self {
        if let Err(e) = bus.connect().await {
            warn!("coil bus not reachable at startup: {e}");
        }
        let backend = Self {
            inner: Mutex::new(CoilInner { bus, state: map.all_off() }),
            map,
        };
        if !backend.set_all(false).await {
            warn!("initial all-off not confirmed by the coil bus");
        }
        backend
    }

    /// Contiguous map: one write. Otherwise off covers the whole span in one
    /// write; on is split per run so unmapped coils in the gaps stay untouched.
    fn plan_set_all(&self, state: bool) -> Vec<CoilWrite> {
        let with_addresses = |start: u16, names: Vec<String>| -> Vec<(u16, String)> {
            names.into_iter().enumerate().map(|(i, n)| (start + i as u16, n)).collect()
        };
        let runs = self.map.contiguous_runs();
        let plan = match self.map.span() {
            Some((first, last)) if runs.len() > 1 && !state => {
                let len = usize::from(last - first) + 1;
                let relays = runs.into_iter().flat_map(|(start, names)| with_addresses(start, names)).collect();
                vec![CoilWrite { start: first, states: vec![false; len], relays }]
            }
            _ => runs
                .into_iter()
                .map(|(start, names)| CoilWrite {
                    start,
                    states: vec![state; names.len()],
                    relays: with_addresses(start, names),
                })
                .collect(),
        };
        plan.into_iter().flat_map(CoilWrite::chunked).collect()
    }
}

#[async_trait]
impl ActuatorBackend for CoilBackend {
    fn kind(&self) -> &'static str {
        "coils"
    }

    fn relays(&self) -> &RelayMap {
        &self.map
    }

    async fn set(&self, name: &str, state: bool) -> bool {
        let Some(address) = self.map.address(name) else {
            warn!(relay = name, "unknown relay");
            return false;
        };
        let name = name.trim().to_lowercase();
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.ensure_connected().await {
            error!(relay = %name, "coil bus unavailable: {e}");
            return false;
        }
        match inner.bus.write_coil(address, state).await {
            Ok(()) => {
                debug!(relay = %name, address, state, "coil written");
                inner.state.insert(name, state);
                true
            }
            Err(e) => {
                error!(relay = %name, address, "coil write failed: {e}");
                false
            }
        }
    }

    async fn set_all(&self, state: bool) -> bool {
        let plan = self.plan_set_all(state);
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.ensure_connected().await {
            error!("coil bus unavailable for set_all: {e}");
            return false;
        }
        let mut all_ok = true;
        for write in plan {
            match inner.bus.write_coils(write.start, &write.states).await {
                Ok(()) => {
                    for (_, name) in write.relays {
                        inner.state.insert(name, state);
                    }
                }
                Err(e) => {
                    warn!(start = write.start, count = write.states.len(), "multi-coil write failed, writing one by one: {e}");
                    all_ok &= inner.write_each(write.relays, state).await;
                }
            }
        }
        all_ok
    }

    async fn status(&self) -> BTreeMap<String, bool> {
        let Some((first, last)) = self.map.span() else {
            return BTreeMap::new();
        };
        let mut inner = self.inner.lock().await;
        let read = match inner.ensure_connected().await {
            Ok(()) => inner.read_span(first, last).await,
            Err(e) => Err(e),
        };
        match read {
            Ok(bits) => {
                for name in self.map.names() {
                    let Some(addr) = self.map.address(name) else { continue };
                    if let Some(bit) = bits.get(usize::from(addr - first)) {
                        inner.state.insert(name.to_string(), *bit);
                    }
                }
            }
            Err(e) => warn!("coil read-back failed, reporting cached state: {e}"),
        }
        inner.state.clone()
    }
}

/// RTU client over a local serial line.
pub struct RtuCoilBus {
    conf: ModbusConf,
    ctx: Option<Context>,
}

impl RtuCoilBus {
    pub fn new(conf: ModbusConf) -> Self {
        Self { conf, ctx: None }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.conf.timeout_ms)
    }

    /// Transport failures drop the context so the next call reconnects.
    fn settle<T>(&mut self, res: Result<T, RelayError>) -> Result<T, RelayError> {
        if matches!(res, Err(RelayError::Transport(_))) {
            self.ctx = None;
        }
        res
    }
}

pub(crate) fn flatten<T>(
    res: Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, RelayError> {
    match res {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(code))) => Err(RelayError::Exception(format!("{code:?}"))),
        Ok(Err(e)) => Err(RelayError::Transport(e.to_string())),
        Err(_) => Err(RelayError::Transport("request timed out".into())),
    }
}

pub(crate) fn open_rtu(port: &str, baud_rate: u32, slave_id: u8) -> Result<Context, RelayError> {
    let builder = tokio_serial::new(port, baud_rate);
    let stream = tokio_serial::SerialStream::open(&builder)
        .map_err(|e| RelayError::Transport(format!("{port}: {e}")))?;
    Ok(rtu::attach_slave(stream, Slave(slave_id)))
}

#[async_trait]
impl CoilBus for RtuCoilBus {
    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn connect(&mut self) -> Result<(), RelayError> {
        self.ctx = Some(open_rtu(&self.conf.port, self.conf.baud_rate, self.conf.slave_id)?);
        info!(port = %self.conf.port, slave = self.conf.slave_id, "coil bus connected");
        Ok(())
    }

    async fn write_coil(&mut self, address: u16, state: bool) -> Result<(), RelayError> {
        let timeout = self.timeout();
        let ctx = self.ctx.as_mut().ok_or(RelayError::Disconnected)?;
        let res = flatten(tokio::time::timeout(timeout, ctx.write_single_coil(address, state)).await);
        self.settle(res)
    }

    async fn write_coils(&mut self, start: u16, states: &[bool]) -> Result<(), RelayError> {
        let timeout = self.timeout();
        let ctx = self.ctx.as_mut().ok_or(RelayError::Disconnected)?;
        let res = flatten(tokio::time::timeout(timeout, ctx.write_multiple_coils(start, states)).await);
        self.settle(res)
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, RelayError> {
        let timeout = self.timeout();
        let ctx = self.ctx.as_mut().ok_or(RelayError::Disconnected)?;
        let res = flatten(tokio::time::timeout(timeout, ctx.read_coils(start, count)).await);
        self.settle(res)
    }
}

/// Counters and switches shared between a SimulatedCoils bus and its observers.
#[derive(Debug, Default)]
pub struct SimState {
    pub coils: Vec<bool>,
    pub connected: bool,
    pub connects: usize,
    pub single_writes: usize,
    pub multi_writes: usize,
    pub refuse_connect: bool,
    pub fail_writes: bool,
    pub fail_reads: bool,
    /// Answer FC15 with IllegalFunction, like slaves without multi-coil support.
    pub reject_multi: bool,
    pub largest_read: u16,
}

/// In-memory coil bank used by the simulated backend and the tests.
#[derive(Clone)]
pub struct SimulatedCoils {
    state: Arc<parking_lot::Mutex<SimState>>,
}

impl SimulatedCoils {
    pub fn new(size: usize) -> Self {
        let state = SimState { coils: vec![false; size], ..SimState::default() };
        Self { state: Arc::new(parking_lot::Mutex::new(state)) }
    }

    pub fn observer(&self) -> Arc<parking_lot::Mutex<SimState>> {
        self.state.clone()
    }

    fn check_range(sim: &SimState, start: u16, count: usize) -> Result<(), RelayError> {
        if usize::from(start) + count > sim.coils.len() {
            return Err(RelayError::Exception("IllegalDataAddress".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoilBus for SimulatedCoils {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn connect(&mut self) -> Result<(), RelayError> {
        let mut sim = self.state.lock();
        sim.connects += 1;
        if sim.refuse_connect {
            return Err(RelayError::Transport("simulated port busy".into()));
        }
        sim.connected = true;
        Ok(())
    }

    async fn write_coil(&mut self, address: u16, state: bool) -> Result<(), RelayError> {
        let mut sim = self.state.lock();
        if sim.fail_writes {
            return Err(RelayError::Transport("simulated write failure".into()));
        }
        Self::check_range(&sim, address, 1)?;
        sim.single_writes += 1;
        sim.coils[usize::from(address)] = state;
        Ok(())
    }

    async fn write_coils(&mut self, start: u16, states: &[bool]) -> Result<(), RelayError> {
        let mut sim = self.state.lock();
        if sim.fail_writes {
            return Err(RelayError::Transport("simulated write failure".into()));
        }
        if sim.reject_multi {
            return Err(RelayError::Exception("IllegalFunction".into()));
        }
        Self::check_range(&sim, start, states.len())?;
        sim.multi_writes += 1;
        let start = usize::from(start);
        sim.coils[start..start + states.len()].copy_from_slice(states);
        Ok(())
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, RelayError> {
        let mut sim = self.state.lock();
        if sim.fail_reads {
            return Err(RelayError::Transport("simulated read failure".into()));
        }
        Self::check_range(&sim, start, usize::from(count))?;
        sim.largest_read = sim.largest_read.max(count);
        let start = usize::from(start);
        Ok(sim.coils[start..start + usize::from(count)].to_vec())
    }
}
