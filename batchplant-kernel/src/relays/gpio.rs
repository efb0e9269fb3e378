//! Pin-per-relay backend. Active HIGH, no read-back: status is the last
//! command that the driver accepted.

use super::{ActuatorBackend, RelayError, RelayMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Synchronous output pin access. Writes are short register pokes.
pub trait PinDriver: Send {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), RelayError>;
}

pub struct GpioBackend {
    map: RelayMap,
    inner: Mutex<GpioInner>,
}

struct GpioInner {
    driver: Box<dyn PinDriver>,
    state: BTreeMap<String, bool>,
}

impl GpioBackend {
    /// Drives every mapped pin low before accepting commands.
    pub fn new(map: RelayMap, driver: Box<dyn PinDriver>) -> Self {
        let mut inner = GpioInner { driver, state: map.all_off() };
        for name in map.names() {
            if let Some(pin) = map.address(name) {
                if let Err(e) = inner.driver.write(pin, false) {
                    error!(relay = name, pin, "initial off failed: {e}");
                }
            }
        }
        info!(relays = map.len(), "gpio relays initialised off");
        Self { map, inner: Mutex::new(inner) }
    }

    fn write_one(&self, name: &str, state: bool) -> bool {
        let Some(pin) = self.map.address(name) else {
            warn!(relay = name, "unknown relay");
            return false;
        };
        let name = name.trim().to_lowercase();
        let mut inner = self.inner.lock();
        match inner.driver.write(pin, state) {
            Ok(()) => {
                inner.state.insert(name, state);
                true
            }
            Err(e) => {
                error!(relay = %name, pin, "pin write failed: {e}");
                false
            }
        }
    }

    fn write_all(&self, state: bool) -> bool {
        let mut inner = self.inner.lock();
        let mut all_ok = true;
        for name in self.map.names() {
            let Some(pin) = self.map.address(name) else { continue };
            match inner.driver.write(pin, state) {
                Ok(()) => {
                    inner.state.insert(name.to_string(), state);
                }
                Err(e) => {
                    error!(relay = name, pin, "pin write failed: {e}");
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

#[async_trait]
impl ActuatorBackend for GpioBackend {
    fn kind(&self) -> &'static str {
        "gpio"
    }

    fn relays(&self) -> &RelayMap {
        &self.map
    }

    async fn set(&self, name: &str, state: bool) -> bool {
        self.write_one(name, state)
    }

    async fn set_all(&self, state: bool) -> bool {
        self.write_all(state)
    }

    async fn status(&self) -> BTreeMap<String, bool> {
        self.inner.lock().state.clone()
    }
}

/// In-memory pin levels, shared so a caller can observe what was driven.
#[derive(Clone, Default)]
pub struct SimulatedPins {
    levels: Arc<Mutex<BTreeMap<u16, bool>>>,
    broken: Arc<Mutex<BTreeSet<u16>>>,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u16) -> Option<bool> {
        self.levels.lock().get(&pin).copied()
    }

    /// Makes every further write to `pin` fail.
    pub fn break_pin(&self, pin: u16) {
        self.broken.lock().insert(pin);
    }
}

impl PinDriver for SimulatedPins {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), RelayError> {
        if self.broken.lock().contains(&pin) {
            return Err(RelayError::Transport(format!("pin {pin} not responding")));
        }
        self.levels.lock().insert(pin, high);
        Ok(())
    }
}

#[cfg(feature = "rpi")]
pub struct RppalPins {
    pins: BTreeMap<u16, rppal::gpio::OutputPin>,
}

#[cfg(feature = "rpi")]
impl RppalPins {
    pub fn open(map: &RelayMap) -> Result<Self, RelayError> {
        let gpio = rppal::gpio::Gpio::new().map_err(|e| RelayError::Unsupported(e.to_string()))?;
        let mut pins = BTreeMap::new();
        for name in map.names() {
            let Some(addr) = map.address(name) else { continue };
            let bcm = u8::try_from(addr)
                .map_err(|_| RelayError::Unsupported(format!("pin {addr} out of range")))?;
            let pin = gpio.get(bcm).map_err(|e| RelayError::Transport(e.to_string()))?;
            pins.insert(addr, pin.into_output_low());
        }
        Ok(Self { pins })
    }
}

#[cfg(feature = "rpi")]
impl PinDriver for RppalPins {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), RelayError> {
        let out = self
            .pins
            .get_mut(&pin)
            .ok_or_else(|| RelayError::Transport(format!("pin {pin} not claimed")))?;
        if high {
            out.set_high();
        } else {
            out.set_low();
        }
        Ok(())
    }
}

#[cfg(feature = "rpi")]
pub fn hardware_pins(map: &RelayMap) -> Result<Box<dyn PinDriver>, RelayError> {
    Ok(Box::new(RppalPins::open(map)?))
}

#[cfg(not(feature = "rpi"))]
pub fn hardware_pins(_map: &RelayMap) -> Result<Box<dyn PinDriver>, RelayError> {
    Err(RelayError::Unsupported(
        "gpio backend needs a build with the `rpi` feature".into(),
    ))
}
