use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

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
pub struct NodeConfig {
    pub server: ServerConf,
    pub poll_hz: f64,
    pub reconnect_delay_secs: f64,
    /// relay name -> input pin
    pub buttons: BTreeMap<String, u8>,
    /// pressed = pin pulled to ground
    pub active_low: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 8765, path: "/edge".into() }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            poll_hz: 20.0,
            reconnect_delay_secs: 5.0,
            buttons: [
                ("konveyor_atas", 23),
                ("konveyor_bawah", 22),
                ("silo_1", 21),
                ("silo_2", 19),
                ("pintu_pasir", 17),
                ("pintu_batu", 4),
                ("pompa_air", 15),
                ("semen", 13),
                ("mixer", 12),
                ("vibrator", 14),
                ("pintu_mixer", 27),
                ("klakson", 26),
            ]
            .into_iter()
            .map(|(name, pin)| (name.to_string(), pin))
            .collect(),
            active_low: true,
        }
    }
}

impl NodeConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.poll_hz)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buttons.is_empty() {
            return Err(ConfigError::Invalid("buttons is empty".into()));
        }
        if !(self.poll_hz > 0.0 && self.poll_hz <= 1000.0) {
            return Err(ConfigError::Invalid("poll_hz must be in (0, 1000]".into()));
        }
        if !(self.reconnect_delay_secs > 0.0) {
            return Err(ConfigError::Invalid("reconnect_delay_secs must be > 0".into()));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid("server.path must start with '/'".into()));
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<NodeConfig, ConfigError> {
    let path = std::env::var("BUTTON_NODE_CONFIG").unwrap_or_else(|_| "button-node.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> Result<NodeConfig, ConfigError> {
    let cfg = if Path::new(path).exists() {
        let txt = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io { path: path.into(), source })?;
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml { path: path.into(), source })?
    } else {
        tracing::warn!("no {path}, using default button map");
        NodeConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}
