use chrono::{DateTime, Utc};

use crate::battery::{Config, Status};
use crate::calibration::{self, Coefficients, CHANNELS};

/// Fixed tolerance between gateway-computed elapsed time and the
/// device-reported remaining minutes. Absorbs clock and transmission
/// jitter; not adaptive.
pub const TIMEOUT_MARGIN_MINUTES: i64 = 2;

/// Outcome of comparing an uplinked status against the stored config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// What the device's remaining timeout should read right now,
    /// derived from the config's nominal timeout and its age. This is
    /// the value a re-issued command carries; the stored config is
    /// never rewritten.
    pub expected_timeout: u16,
    pub mismatched: Vec<&'static str>,
}

impl Verdict {
    pub fn matches(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Decide whether a status complies with the config issued earlier.
///
/// Level setpoints are compared in the raw domain, but the config side
/// is recomputed from its stored centimeter values with the calibration
/// in effect *now* - so a calibration change makes the comparison fail
/// and forces a resend carrying the new raw values.
///
/// Pump flags only count while the device is in manual override
/// (reported timeout > 0); in automatic mode the controller drives the
/// pumps itself.
pub fn compare(
    status: &Status,
    config: &Config,
    cal: &[Coefficients; CHANNELS],
    now: DateTime<Utc>,
) -> Verdict {
    let elapsed = (now - config.timestamp).num_minutes().max(0);
    let expected_timeout = (config.manual_timeout as i64 - elapsed).max(0) as u16;

    let mut mismatched = Vec::new();

    if (status.manual_timeout as i64 - expected_timeout as i64).abs() > TIMEOUT_MARGIN_MINUTES {
        mismatched.push("manual_timeout");
    }
    if status.target_flow != config.target_flow {
        mismatched.push("target_flow");
    }
    if calibration::cm_to_raw_triple(&config.target_level, cal) != status.target_level_raw {
        mismatched.push("target_level");
    }
    if calibration::cm_to_raw_triple(&config.min_level, cal) != status.min_level_raw {
        mismatched.push("min_level");
    }
    if calibration::cm_to_raw_triple(&config.max_level, cal) != status.max_level_raw {
        mismatched.push("max_level");
    }
    if status.manual_timeout > 0 && status.pump != config.pump {
        mismatched.push("pump");
    }

    Verdict {
        expected_timeout,
        mismatched,
    }
}
