use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::calibration::{self, Coefficients, CHANNELS};
use crate::error::Error;
use crate::packet::RawStatus;

/// A decoded, calibrated status report. Immutable once built; the
/// timestamp is the gateway's receipt time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Status {
    pub battery: String,
    pub timestamp: DateTime<Utc>,
    pub panic: bool,
    pub manual_timeout: u16,
    pub pump: [bool; 4],
    pub target_flow: u8,
    pub flow_in: u8,
    pub flow_out: u8,
    pub current_level_raw: [u8; CHANNELS],
    pub target_level_raw: [u8; CHANNELS],
    pub min_level_raw: [u8; CHANNELS],
    pub max_level_raw: [u8; CHANNELS],
    pub current_level: [f64; CHANNELS],
    pub target_level: [f64; CHANNELS],
    pub min_level: [f64; CHANNELS],
    pub max_level: [f64; CHANNELS],
}

impl Status {
    pub fn from_raw(
        battery: &str,
        raw: &RawStatus,
        cal: &[Coefficients; CHANNELS],
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            battery: battery.to_string(),
            timestamp,
            panic: raw.panic,
            manual_timeout: raw.manual_timeout,
            pump: raw.pump,
            target_flow: raw.target_flow,
            flow_in: raw.flow_in,
            flow_out: raw.flow_out,
            current_level_raw: raw.current_level,
            target_level_raw: raw.target_level,
            min_level_raw: raw.min_level,
            max_level_raw: raw.max_level,
            current_level: calibration::raw_to_cm_triple(&raw.current_level, cal),
            target_level: calibration::raw_to_cm_triple(&raw.target_level, cal),
            min_level: calibration::raw_to_cm_triple(&raw.min_level, cal),
            max_level: calibration::raw_to_cm_triple(&raw.max_level, cal),
        }
    }
}

/// An operator-issued config request. The username comes from the
/// authorization layer in front of the bridge and is trusted as-is.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConfigRequest {
    #[serde(default)]
    pub battery: String,
    pub manual_timeout: u16,
    pub pump: [bool; 4],
    pub target_flow: u8,
    pub target_level: [f64; CHANNELS],
    pub min_level: [f64; CHANNELS],
    pub max_level: [f64; CHANNELS],
    pub username: String,
}

/// The desired state of one battery, as last issued by an operator.
///
/// A config row is append-only: a new request replaces the record
/// wholesale. The acknowledgement timestamp is the one field that is
/// filled in later, when an uplink is first observed to match.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Config {
    /// Database row id, set once persisted.
    pub id: Option<i64>,
    pub battery: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub ack_timestamp: Option<DateTime<Utc>>,
    pub manual_timeout: u16,
    pub pump: [bool; 4],
    pub target_flow: u8,
    pub target_level: [f64; CHANNELS],
    pub min_level: [f64; CHANNELS],
    pub max_level: [f64; CHANNELS],
    /// Raw equivalents as sent on the wire, computed from the cm values
    /// with the calibration in effect at issuance.
    pub target_level_raw: [u8; CHANNELS],
    pub min_level_raw: [u8; CHANNELS],
    pub max_level_raw: [u8; CHANNELS],
}

impl Config {
    pub fn from_request(
        request: ConfigRequest,
        cal: &[Coefficients; CHANNELS],
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            battery: request.battery,
            username: request.username,
            timestamp,
            ack_timestamp: None,
            manual_timeout: request.manual_timeout,
            pump: request.pump,
            target_flow: request.target_flow,
            target_level_raw: calibration::cm_to_raw_triple(&request.target_level, cal),
            min_level_raw: calibration::cm_to_raw_triple(&request.min_level, cal),
            max_level_raw: calibration::cm_to_raw_triple(&request.max_level, cal),
            target_level: request.target_level,
            min_level: request.min_level,
            max_level: request.max_level,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatteryEntry {
    pub status: Option<Status>,
    pub config: Option<Config>,
}

/// The gateway's authoritative in-memory state: last status and last
/// config per battery. Entries exist for every configured battery
/// before the first live frame arrives; the per-battery mutex is held
/// across a whole reconcile-and-publish sequence.
#[derive(Debug, Default)]
pub struct BatteryStore {
    entries: HashMap<String, Arc<Mutex<BatteryEntry>>>,
}

impl BatteryStore {
    pub fn new(batteries: &[String]) -> Self {
        let mut entries = HashMap::new();
        for battery in batteries {
            entries.insert(battery.clone(), Arc::new(Mutex::new(BatteryEntry::default())));
        }
        Self { entries }
    }

    pub fn entry(&self, battery: &str) -> Result<Arc<Mutex<BatteryEntry>>, Error> {
        self.entries
            .get(battery)
            .cloned()
            .ok_or_else(|| Error::UnknownBattery(battery.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
