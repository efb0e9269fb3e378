/**
 * ACTUATOR BACKEND - Uniform relay bank behind one capability
 *
 * ROLE :
 * Every relay command of the kernel (operator command, emergency stop,
 * watchdog trip, shutdown) goes through `ActuatorBackend`.
 *
 * CONTRACT :
 * - set / set_all return an explicit success flag, never an error past this boundary
 * - set / set_all are serialised inside the backend (one command at a time)
 * - status is "last known command", refreshed from hardware when read-back exists
 * - ActuatorState only changes on a confirmed write
 *
 * VARIANTS :
 * - gpio  : one pin per relay, active HIGH, no read-back
 * - coils : fieldbus coils, single write for set, multi-coil write for set_all, coil read-back
 */

pub mod coils;
pub mod gpio;

use crate::config::{ActuatorConf, BackendKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("duplicate relay address: {0}")]
    DuplicateAddress(u16),
    #[error("transport closed")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device exception: {0}")]
    Exception(String),
    #[error("backend unavailable: {0}")]
    Unsupported(String),
}

/// Immutable name -> address table loaded at startup.
#[derive(Debug, Clone)]
pub struct RelayMap {
    by_name: BTreeMap<String, u16>,
    by_address: BTreeMap<u16, String>,
}

impl RelayMap {
    pub fn new(relays: &BTreeMap<String, u16>) -> Result<Self, RelayError> {
        let mut by_address = BTreeMap::new();
        for (name, addr) in relays {
            if by_address.insert(*addr, name.to_lowercase()).is_some() {
                return Err(RelayError::DuplicateAddress(*addr));
            }
        }
        let by_name = relays.iter().map(|(n, a)| (n.to_lowercase(), *a)).collect();
        Ok(Self { by_name, by_address })
    }

    pub fn address(&self, name: &str) -> Option<u16> {
        self.by_name.get(&normalize(name)).copied()
    }

    pub fn name_of(&self, address: u16) -> Option<&str> {
        self.by_address.get(&address).map(String::as_str)
    }

    /// Address wins over name when both are given. Addresses outside u16 are unknown.
    pub fn resolve(&self, name: Option<&str>, address: Option<i64>) -> Option<String> {
        match address {
            Some(addr) => u16::try_from(addr).ok().and_then(|a| self.name_of(a)).map(str::to_string),
            None => name.and_then(|n| {
                let n = normalize(n);
                self.by_name.contains_key(&n).then_some(n)
            }),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Lowest and highest mapped address.
    pub fn span(&self) -> Option<(u16, u16)> {
        let first = *self.by_address.keys().next()?;
        let last = *self.by_address.keys().next_back()?;
        Some((first, last))
    }

    /// Maximal runs of consecutive addresses, as (start, names in address order).
    pub fn contiguous_runs(&self) -> Vec<(u16, Vec<String>)> {
        let mut runs: Vec<(u16, Vec<String>)> = Vec::new();
        let mut prev: Option<u16> = None;
        for (addr, name) in &self.by_address {
            match (prev, runs.last_mut()) {
                (Some(p), Some(run)) if p.checked_add(1) == Some(*addr) => run.1.push(name.clone()),
                _ => runs.push((*addr, vec![name.clone()])),
            }
            prev = Some(*addr);
        }
        runs
    }

    pub fn all_off(&self) -> BTreeMap<String, bool> {
        self.by_name.keys().map(|n| (n.clone(), false)).collect()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[async_trait]
pub trait ActuatorBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    fn relays(&self) -> &RelayMap;

    /// false if the name is unknown or the write failed; state untouched then.
    async fn set(&self, name: &str, state: bool) -> bool;

    /// Commands every known relay, true only if every write succeeded.
    async fn set_all(&self, state: bool) -> bool;

    async fn status(&self) -> BTreeMap<String, bool>;
}

pub type SharedBackend = Arc<dyn ActuatorBackend>;

/// Picks the variant from configuration and drives every relay off.
pub async fn build_backend(conf: &ActuatorConf) -> Result<SharedBackend, RelayError> {
    let map = RelayMap::new(&conf.relays)?;
    let backend: SharedBackend = match conf.backend {
        BackendKind::Gpio => {
            let driver = gpio::hardware_pins(&map)?;
            Arc::new(gpio::GpioBackend::new(map, driver))
        }
        BackendKind::Modbus => {
            let modbus = conf
                .modbus
                .clone()
                .ok_or_else(|| RelayError::Unsupported("missing modbus section".into()))?;
            let bus = coils::RtuCoilBus::new(modbus);
            Arc::new(coils::CoilBackend::new(map, Box::new(bus)).await)
        }
        BackendKind::Simulated => {
            warn!("simulated relay backend: nothing is wired to real outputs");
            let bus = coils::SimulatedCoils::new(64);
            Arc::new(coils::CoilBackend::new(map, Box::new(bus)).await)
        }
    };
    info!(backend = backend.kind(), relays = backend.relays().len(), "actuator backend ready");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, u16)]) -> RelayMap {
        let m: BTreeMap<String, u16> = pairs.iter().map(|(n, a)| (n.to_string(), *a)).collect();
        RelayMap::new(&m).unwrap()
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let m = map(&[("mixer", 8), ("vibrator", 9)]);
        assert_eq!(m.address("MIXER"), Some(8));
        assert_eq!(m.address(" vibrator "), Some(9));
        assert_eq!(m.name_of(9), Some("vibrator"));
        assert_eq!(m.address("pump"), None);
    }

    #[test]
    fn address_takes_precedence() {
        let m = map(&[("mixer", 8), ("vibrator", 9)]);
        assert_eq!(m.resolve(Some("mixer"), Some(9)), Some("vibrator".into()));
        assert_eq!(m.resolve(Some("mixer"), Some(42)), None);
        assert_eq!(m.resolve(Some("mixer"), Some(70_000)), None);
        assert_eq!(m.resolve(Some("mixer"), Some(-1)), None);
        assert_eq!(m.resolve(Some("Mixer"), None), Some("mixer".into()));
        assert_eq!(m.resolve(None, None), None);
    }

    #[test]
    fn duplicate_addresses_fail() {
        let m: BTreeMap<String, u16> = [("a".to_string(), 1), ("b".to_string(), 1)].into_iter().collect();
        assert!(matches!(RelayMap::new(&m), Err(RelayError::DuplicateAddress(1))));
    }

    #[test]
    fn runs_follow_address_gaps() {
        let m = map(&[("a", 0), ("b", 1), ("c", 2), ("d", 5), ("e", 6), ("f", 9)]);
        let runs = m.contiguous_runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], (0, vec!["a".to_string(), "b".into(), "c".into()]));
        assert_eq!(runs[1], (5, vec!["d".to_string(), "e".into()]));
        assert_eq!(runs[2], (9, vec!["f".to_string()]));
        assert_eq!(m.span(), Some((0, 9)));
    }
}
