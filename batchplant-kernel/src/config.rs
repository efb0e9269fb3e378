use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Bounds that keep every derived `Duration` finite. NaN fails the range checks too.
const MIN_BROADCAST_HZ: f64 = 0.01;
const MAX_BROADCAST_HZ: f64 = 100.0;
const MAX_WATCHDOG_SECS: f64 = 3600.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid YAML in {path}: {source}")]
    Yaml { path: String, source: serde_yaml::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PlantConfig {
    pub listen: ListenConf,
    pub serial: SerialConf,
    /// material -> serial device, ex: pasir: /dev/ttyS0
    pub sources: BTreeMap<String, String>,
    pub actuators: ActuatorConf,
    pub safety: SafetyConf,
    pub broadcast_hz: f64,
    pub power_meter: Option<PowerMeterConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConf {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub sanity_limit: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gpio,
    Modbus,
    Simulated,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActuatorConf {
    pub backend: BackendKind,
    /// relay name -> pin number (gpio) or coil address (modbus)
    pub relays: BTreeMap<String, u16>,
    pub modbus: Option<ModbusConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModbusConf {
    pub port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    #[serde(default = "default_modbus_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyConf {
    pub watchdog_timeout_secs: f64,
    pub check_interval_ms: u64,
    pub spike_threshold_kg: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PowerMeterConf {
    pub port: String,
    #[serde(default = "default_meter_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_meter_slave")]
    pub slave_id: u8,
    #[serde(default = "default_meter_interval")]
    pub poll_interval_ms: u64,
}

fn default_modbus_timeout() -> u64 { 1000 }
fn default_meter_baud() -> u32 { 9600 }
fn default_meter_slave() -> u8 { 10 }
fn default_meter_interval() -> u64 { 1000 }

impl Default for ListenConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8765 }
    }
}

impl Default for SerialConf {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout_ms: 20,
            poll_interval_ms: 10,
            error_backoff_ms: 1000,
            sanity_limit: 10_000.0,
        }
    }
}

impl Default for ActuatorConf {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simulated,
            relays: [
                ("konveyor_atas", 0),
                ("konveyor_bawah", 1),
                ("silo_1", 2),
                ("silo_2", 3),
                ("pintu_pasir", 4),
                ("pintu_batu", 5),
                ("pompa_air", 6),
                ("semen", 7),
                ("mixer", 8),
                ("vibrator", 9),
                ("pintu_mixer", 10),
                ("klakson", 11),
            ]
            .into_iter()
            .map(|(name, addr)| (name.to_string(), addr))
            .collect(),
            modbus: None,
        }
    }
}

impl Default for SafetyConf {
    fn default() -> Self {
        Self {
            watchdog_timeout_secs: 5.0,
            check_interval_ms: 1000,
            spike_threshold_kg: 500.0,
        }
    }
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            listen: ListenConf::default(),
            serial: SerialConf::default(),
            sources: BTreeMap::new(),
            actuators: ActuatorConf::default(),
            safety: SafetyConf::default(),
            broadcast_hz: 2.0,
            power_meter: None,
        }
    }
}

impl SerialConf {
    pub fn read_timeout(&self) -> Duration { Duration::from_millis(self.read_timeout_ms) }
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn error_backoff(&self) -> Duration { Duration::from_millis(self.error_backoff_ms) }
}

impl SafetyConf {
    pub fn watchdog_timeout(&self) -> Duration { Duration::from_secs_f64(self.watchdog_timeout_secs) }
    pub fn check_interval(&self) -> Duration { Duration::from_millis(self.check_interval_ms) }
}

impl PlantConfig {
    pub fn broadcast_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.broadcast_hz)
    }

    /// Rejects configurations that would leave the relay bank or the watchdog ill-defined.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actuators.relays.is_empty() {
            return Err(ConfigError::Invalid("actuators.relays is empty".into()));
        }
        let mut seen = HashSet::new();
        for (name, addr) in &self.actuators.relays {
            if !seen.insert(*addr) {
                return Err(ConfigError::Invalid(format!(
                    "relay '{name}' reuses address {addr}"
                )));
            }
            if name.to_lowercase() != *name {
                return Err(ConfigError::Invalid(format!("relay '{name}' must be lower-case")));
            }
        }
        if self.actuators.backend == BackendKind::Modbus && self.actuators.modbus.is_none() {
            return Err(ConfigError::Invalid("backend modbus needs an actuators.modbus section".into()));
        }
        if !(MIN_BROADCAST_HZ..=MAX_BROADCAST_HZ).contains(&self.broadcast_hz) {
            return Err(ConfigError::Invalid(format!(
                "broadcast_hz must be within {MIN_BROADCAST_HZ}..={MAX_BROADCAST_HZ}"
            )));
        }
        if !(self.safety.watchdog_timeout_secs > 0.0 && self.safety.watchdog_timeout_secs <= MAX_WATCHDOG_SECS) {
            return Err(ConfigError::Invalid(format!(
                "safety.watchdog_timeout_secs must be within 0..={MAX_WATCHDOG_SECS}"
            )));
        }
        if self.safety.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("safety.check_interval_ms must be > 0".into()));
        }
        if !(self.serial.sanity_limit > 0.0 && self.serial.sanity_limit.is_finite()) {
            return Err(ConfigError::Invalid("serial.sanity_limit must be a positive number".into()));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("serial.read_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<PlantConfig, ConfigError> {
    let path = std::env::var("BATCHPLANT_CONFIG").unwrap_or_else(|_| "plant.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> Result<PlantConfig, ConfigError> {
    let cfg = if Path::new(path).exists() {
        let txt = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io { path: path.into(), source })?;
        if txt.trim().is_empty() {
            PlantConfig::default()
        } else {
            serde_yaml::from_str(&txt)
                .map_err(|source| ConfigError::Yaml { path: path.into(), source })?
        }
    } else {
        tracing::warn!("no {path}, using default config (simulated relays, no scales)");
        PlantConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = PlantConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.listen.port, 8765);
        assert_eq!(cfg.serial.sanity_limit, 10_000.0);
        assert_eq!(cfg.broadcast_period(), Duration::from_millis(500));
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let mut cfg = PlantConfig::default();
        cfg.actuators.relays.insert("mixer".into(), 1);
        cfg.actuators.relays.insert("vibrator".into(), 1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn non_finite_timings_are_rejected() {
        for hz in [f64::INFINITY, f64::NAN, 0.0, 1e-300, 1e6] {
            let cfg = PlantConfig { broadcast_hz: hz, ..PlantConfig::default() };
            assert!(cfg.validate().is_err(), "broadcast_hz {hz} accepted");
        }
        for secs in [f64::INFINITY, f64::NAN, -1.0, 1e12] {
            let mut cfg = PlantConfig::default();
            cfg.safety.watchdog_timeout_secs = secs;
            assert!(cfg.validate().is_err(), "watchdog_timeout_secs {secs} accepted");
        }
        let mut cfg = PlantConfig::default();
        cfg.serial.sanity_limit = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn modbus_backend_requires_section() {
        let mut cfg = PlantConfig::default();
        cfg.actuators.backend = BackendKind::Modbus;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn loads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen:
  host: 127.0.0.1
  port: 9000
sources:
  pasir: /dev/ttyS0
  semen: /dev/ttyS2
actuators:
  backend: modbus
  relays:
    mixer: 0
    vibrator: 1
  modbus:
    port: /dev/ttyUSB0
    baud_rate: 9600
    slave_id: 1
safety:
  watchdog_timeout_secs: 3
broadcast_hz: 1
"#
        )
        .unwrap();

        let cfg = load_config_from(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(cfg.listen.port, 9000);
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.actuators.backend, BackendKind::Modbus);
        assert_eq!(cfg.actuators.modbus.as_ref().unwrap().timeout_ms, 1000);
        assert_eq!(cfg.safety.watchdog_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.safety.check_interval_ms, 1000);
        assert_eq!(cfg.serial.baud_rate, 9600);
    }

    #[tokio::test]
    async fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "actuators: [not, a, map").unwrap();
        let res = load_config_from(file.path().to_str().unwrap()).await;
        assert!(matches!(res, Err(ConfigError::Yaml { .. })));
    }
}
