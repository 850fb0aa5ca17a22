use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Loop current covered by one raw sensor unit: a byte spans the
/// 4-20mA range of the level sensors.
pub const MA_PER_RAW_UNIT: f64 = 16.0 / 255.0;

/// Live zero of the current loop.
pub const OFFSET_MA: f64 = 4.0;

pub const CHANNELS: usize = 3;

/// Per-battery, per-channel linear calibration of a level sensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    /// Sensor response in mA per centimeter of water.
    pub ma_per_cm: f64,
    /// Height of the sensor's zero point.
    pub offset_cm: f64,
}

impl Default for Coefficients {
    fn default() -> Self {
        // 0.15mA/cm is the sensor datasheet value; a mounted sensor
        // gets its own numbers once it has been surveyed.
        Self {
            ma_per_cm: 0.15,
            offset_cm: 0.0,
        }
    }
}

/// Centimeters to raw sensor units, clamped to the byte domain.
///
/// Clamping here is a contract with the codec: `encode_config` writes
/// these values to the wire without further checks.
pub fn cm_to_raw(cm: f64, c: &Coefficients) -> u8 {
    let units = ((cm - c.offset_cm) * c.ma_per_cm - OFFSET_MA) / MA_PER_RAW_UNIT;
    units.round().clamp(0.0, 255.0) as u8
}

/// Raw sensor units to centimeters.
pub fn raw_to_cm(raw: u8, c: &Coefficients) -> f64 {
    (raw as f64 * MA_PER_RAW_UNIT + OFFSET_MA) / c.ma_per_cm + c.offset_cm
}

pub fn cm_to_raw_triple(
    cm: &[f64; CHANNELS],
    cal: &[Coefficients; CHANNELS],
) -> [u8; CHANNELS] {
    let mut raw = [0; CHANNELS];
    for (i, value) in cm.iter().enumerate() {
        raw[i] = cm_to_raw(*value, &cal[i]);
    }
    raw
}

pub fn raw_to_cm_triple(
    raw: &[u8; CHANNELS],
    cal: &[Coefficients; CHANNELS],
) -> [f64; CHANNELS] {
    let mut cm = [0.0; CHANNELS];
    for (i, value) in raw.iter().enumerate() {
        cm[i] = raw_to_cm(*value, &cal[i]);
    }
    cm
}

/// The calibration table, loaded from a YAML file at startup.
///
/// Batteries without an entry get datasheet defaults, which are written
/// back to the file so an operator has something to edit.
#[derive(Debug)]
pub struct Calibrations {
    path: PathBuf,
    entries: HashMap<String, [Coefficients; CHANNELS]>,
}

impl Calibrations {
    pub fn load<P: AsRef<Path>>(path: P, batteries: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut entries: HashMap<String, [Coefficients; CHANNELS]> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("error reading {}", path.display()))?;
            serde_yaml::from_str(&content)
                .map_err(|err| anyhow!("error parsing {}: {}", path.display(), err))?
        } else {
            warn!(
                "calibration file {} not found, starting from defaults",
                path.display()
            );
            HashMap::new()
        };

        let mut synthesized = 0;
        for battery in batteries {
            if !entries.contains_key(battery) {
                entries.insert(battery.clone(), [Coefficients::default(); CHANNELS]);
                synthesized += 1;
            }
        }

        let calibrations = Self { path, entries };

        if synthesized > 0 {
            info!("synthesized default calibration for {} batteries", synthesized);
            calibrations.save()?;
        }

        Ok(calibrations)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.entries)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("error writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn for_battery(&self, battery: &str) -> [Coefficients; CHANNELS] {
        self.entries
            .get(battery)
            .copied()
            .unwrap_or([Coefficients::default(); CHANNELS])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_is_clamped_to_byte_domain() {
        let c = Coefficients::default();

        assert_eq!(cm_to_raw(-1000.0, &c), 0);
        assert_eq!(cm_to_raw(1.0e9, &c), 255);
        for cm in [-50.0, 0.0, 26.0, 105.0, 300.0] {
            let raw = cm_to_raw(cm, &c);
            assert!((0..=255).contains(&(raw as i32)));
        }
    }

    #[test]
    fn round_trip_is_idempotent_within_one_unit() {
        let c = Coefficients {
            ma_per_cm: 0.15,
            offset_cm: -26.7,
        };

        for raw in 0..=255u8 {
            let cm = raw_to_cm(raw, &c);
            let back = cm_to_raw(cm, &c);
            assert!(
                (back as i16 - raw as i16).abs() <= 1,
                "raw {} -> {}cm -> {}",
                raw,
                cm,
                back
            );
        }
    }

    #[test]
    fn offset_shifts_the_scale() {
        let base = Coefficients::default();
        let shifted = Coefficients {
            offset_cm: 10.0,
            ..base
        };

        assert!((raw_to_cm(100, &shifted) - raw_to_cm(100, &base) - 10.0).abs() < 1e-9);
    }
}
