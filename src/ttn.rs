use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Uplink envelope as published by the network server on
/// `<app_id>/devices/<dev_id>/up`. Only the fields the bridge needs;
/// the rest of the JSON (metadata, gateways, counters) is ignored.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Uplink {
    #[serde(default)]
    pub dev_id: Option<String>,
    pub port: u8,
    #[serde(default)]
    pub payload_raw: String,
}

impl Uplink {
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|err| anyhow!("error parsing uplink: {}", err))
    }

    /// The base64-decoded wire frame.
    pub fn frame(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.payload_raw)
            .map_err(|err| anyhow!("error decoding payload_raw: {}", err))
    }
}

/// Downlink envelope, published to `<app_id>/devices/<dev_id>/down`.
///
/// `schedule: replace` makes a new command supersede any queued one
/// for the same device.
#[derive(Clone, Debug, Serialize)]
pub struct Downlink {
    pub port: u8,
    pub confirmed: bool,
    pub payload_raw: String,
    pub schedule: &'static str,
}

impl Downlink {
    pub fn new(port: u8, frame: &[u8]) -> Self {
        Self {
            port,
            confirmed: false,
            payload_raw: STANDARD.encode(frame),
            schedule: "replace",
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn downlink_topic(app_id: &str, dev_id: &str) -> String {
    format!("{}/devices/{}/down", app_id, dev_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uplink_envelope() {
        let uplink = Uplink::from_json(
            r#"{"app_id":"tanks","dev_id":"node-01","port":2,"payload_raw":"AAE=","counter":7}"#,
        )
        .unwrap();

        assert_eq!(uplink.dev_id.as_deref(), Some("node-01"));
        assert_eq!(uplink.port, 2);
        assert_eq!(uplink.frame().unwrap(), vec![0, 1]);
    }

    #[test]
    fn bad_base64_is_an_error() {
        let uplink = Uplink::from_json(r#"{"port":1,"payload_raw":"!!"}"#).unwrap();
        assert!(uplink.frame().is_err());
    }

    #[test]
    fn downlink_envelope_replaces_queued_commands() {
        let downlink = Downlink::new(1, &[0x00, 0x0a, 0x01]);
        let json = downlink.to_payload().unwrap();

        assert!(json.contains(r#""schedule":"replace""#));
        assert!(json.contains(r#""confirmed":false"#));
        assert!(json.contains(r#""port":1"#));
    }

    #[test]
    fn builds_downlink_topic() {
        assert_eq!(
            downlink_topic("tanks", "node-01"),
            "tanks/devices/node-01/down"
        );
    }
}
