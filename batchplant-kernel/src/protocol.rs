/**
 * SESSION PROTOCOL - JSON text messages exchanged over the session transport
 *
 * ROLE :
 * Single source of truth for the envelope `{ "type": ..., ...fields }` used by
 * operator panels, button nodes and the kernel.
 *
 * COMPATIBILITY :
 * - canonical type names are kebab-case (relay-control, get-status...)
 * - older panels send snake_case (relay_control) and `gpio_pin` for the address,
 *   both are accepted on input
 * - the kernel always answers in kebab-case
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Fan-out of kernel notices (trips, spikes, offline sources) to every session.
pub type Notices = broadcast::Sender<ServerMessage>;

const NOTICE_BACKLOG: usize = 64;

pub fn notice_channel() -> Notices {
    broadcast::channel(NOTICE_BACKLOG).0
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Messages received from peers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(alias = "relay_control")]
    RelayControl {
        #[serde(default)]
        relay: Option<String>,
        /// Missing state means off
        #[serde(default)]
        state: bool,
        /// Kept wide so an out-of-range address still gets a failed ack
        #[serde(default, alias = "gpio_pin")]
        address: Option<i64>,
    },
    #[serde(alias = "get_status")]
    GetStatus {},
    #[serde(alias = "emergency_stop")]
    EmergencyStop {},
    #[serde(alias = "physical_button_state")]
    PhysicalButtonState {
        relay: String,
        state: bool,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Heartbeat {},
}

/// Messages sent by the kernel, either as a reply or as a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RelayAck {
        relay: String,
        state: bool,
        success: bool,
    },
    Status {
        relays: BTreeMap<String, bool>,
    },
    EmergencyAck {
        message: String,
        success: bool,
    },
    PhysicalButtonUpdate {
        relay: String,
        state: bool,
        timestamp: f64,
    },
    WeightUpdate {
        /// milliseconds since the Unix epoch
        timestamp: i64,
        weights: BTreeMap<String, f64>,
    },
    WatchdogTrip {
        message: String,
        idle_ms: u64,
        success: bool,
    },
    WeightSpike {
        material: String,
        previous: f64,
        current: f64,
        delta: f64,
    },
    SourceOffline {
        material: String,
        port: String,
        error: String,
    },
    PowerUpdate {
        voltage: f64,
        ampere: f64,
        power: f64,
        timestamp: i64,
    },
}

/// A validated physical button transition. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ButtonEdgeEvent {
    pub relay: String,
    pub pressed: bool,
    pub timestamp: f64,
}

impl ButtonEdgeEvent {
    pub fn into_update(self) -> ServerMessage {
        ServerMessage::PhysicalButtonUpdate {
            relay: self.relay,
            state: self.pressed,
            timestamp: self.timestamp,
        }
    }
}

pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode(msg: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Checks the fields of a physical-button-state and stamps missing timestamps.
pub fn validate_button(
    relay: &str,
    state: bool,
    timestamp: Option<f64>,
) -> Result<ButtonEdgeEvent, ProtocolError> {
    let relay = relay.trim();
    if relay.is_empty() {
        return Err(ProtocolError::InvalidField("relay"));
    }
    let timestamp = match timestamp {
        Some(ts) if ts.is_finite() && ts >= 0.0 => ts,
        Some(_) => return Err(ProtocolError::InvalidField("timestamp")),
        None => unix_seconds(OffsetDateTime::now_utc()),
    };
    Ok(ButtonEdgeEvent {
        relay: relay.to_string(),
        pressed: state,
        timestamp,
    })
}

pub fn unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn unix_seconds(t: OffsetDateTime) -> f64 {
    t.unix_timestamp_nanos() as f64 / 1e9
}

pub fn weight_update(weights: BTreeMap<String, f64>) -> ServerMessage {
    ServerMessage::WeightUpdate {
        timestamp: unix_millis(OffsetDateTime::now_utc()),
        weights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_canonical_relay_control() {
        let msg = decode(r#"{"type":"relay-control","relay":"mixer","state":true}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RelayControl { relay: Some("mixer".into()), state: true, address: None }
        );
    }

    #[test]
    fn decodes_legacy_snake_case_with_gpio_pin() {
        let msg = decode(r#"{"type":"relay_control","relay":"mixer","state":true,"gpio_pin":8}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RelayControl { relay: Some("mixer".into()), state: true, address: Some(8) }
        );
        assert_eq!(decode(r#"{"type":"emergency_stop"}"#).unwrap(), ClientMessage::EmergencyStop {});
        assert_eq!(decode(r#"{"type":"get_status"}"#).unwrap(), ClientMessage::GetStatus {});
    }

    #[test]
    fn out_of_range_address_still_decodes() {
        for (raw, addr) in [("70000", 70_000), ("-1", -1)] {
            let text = format!(r#"{{"type":"relay-control","state":true,"address":{raw}}}"#);
            assert!(matches!(
                decode(&text).unwrap(),
                ClientMessage::RelayControl { relay: None, address: Some(a), .. } if a == addr
            ));
        }
    }

    #[test]
    fn missing_state_means_off() {
        let msg = decode(r#"{"type":"relay-control","relay":"mixer"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::RelayControl { state: false, .. }));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(decode(r#"{"type":"open-all-valves"}"#).is_err());
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"relay":"mixer"}"#).is_err());
        assert!(decode(r#"{"type":"physical-button-state","relay":"silo_1"}"#).is_err());
    }

    #[test]
    fn server_messages_are_kebab_case() {
        let txt = encode(&ServerMessage::RelayAck { relay: "mixer".into(), state: true, success: false }).unwrap();
        let v: serde_json::Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(v["type"], "relay-ack");
        assert_eq!(v["success"], false);

        let txt = encode(&ServerMessage::EmergencyAck { message: "ok".into(), success: true }).unwrap();
        assert!(txt.contains(r#""type":"emergency-ack""#));
    }

    #[test]
    fn weight_update_survives_the_wire() {
        let weights: BTreeMap<String, f64> =
            [("pasir".to_string(), 125.5), ("semen".to_string(), -3.25)].into_iter().collect();
        let sent = weight_update(weights.clone());
        let received: ServerMessage = serde_json::from_str(&encode(&sent).unwrap()).unwrap();
        match received {
            ServerMessage::WeightUpdate { weights: got, timestamp } => {
                assert_eq!(got, weights);
                assert!(timestamp > 1_600_000_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn button_validation() {
        assert!(validate_button("  ", true, None).is_err());
        assert!(validate_button("silo_1", true, Some(f64::NAN)).is_err());

        let ev = validate_button("silo_1", true, Some(1700000000.5)).unwrap();
        assert_eq!(ev.relay, "silo_1");
        assert!(ev.pressed);
        assert_eq!(ev.timestamp, 1700000000.5);

        let stamped = validate_button("silo_1", false, None).unwrap();
        assert!(stamped.timestamp > 1_600_000_000.0);
    }
}
