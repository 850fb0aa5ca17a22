use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::error::Error;

/// Static mapping between logical batteries and physical radio devices.
///
/// One device hosts its batteries on consecutive channels; channel N is
/// reached over application port N+1. The mapping comes straight from
/// the config file and never changes while the bridge runs.
#[derive(Clone, Debug, Default)]
pub struct DeviceDirectory {
    by_battery: HashMap<String, (String, u8)>,
    by_device: HashMap<(String, u8), String>,
}

impl DeviceDirectory {
    pub fn new(devices: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut directory = Self::default();

        for (device, batteries) in devices {
            for (channel, battery) in batteries.iter().enumerate() {
                let channel = channel as u8;
                if directory
                    .by_battery
                    .insert(battery.clone(), (device.clone(), channel))
                    .is_some()
                {
                    bail!("battery {} is mapped to more than one device", battery);
                }
                directory
                    .by_device
                    .insert((device.clone(), channel), battery.clone());
            }
        }

        if directory.by_battery.is_empty() {
            bail!("no devices configured, nothing to bridge");
        }

        Ok(directory)
    }

    pub fn battery_to_device(&self, battery: &str) -> Result<(&str, u8), Error> {
        self.by_battery
            .get(battery)
            .map(|(device, channel)| (device.as_str(), *channel))
            .ok_or_else(|| Error::UnknownBattery(battery.to_string()))
    }

    pub fn device_to_battery(&self, device: &str, channel: u8) -> Result<&str, Error> {
        self.by_device
            .get(&(device.to_string(), channel))
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownChannel {
                device: device.to_string(),
                channel,
            })
    }

    /// All configured battery ids, in stable order.
    pub fn batteries(&self) -> Vec<String> {
        let mut batteries: Vec<String> = self.by_battery.keys().cloned().collect();
        batteries.sort();
        batteries
    }
}
