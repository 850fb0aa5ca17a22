use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub mqtt: Mqtt,
    pub database: Database,

    /// device id -> ordered battery list; list position is the channel
    /// index, so channel N talks over application port N+1.
    pub devices: HashMap<String, Vec<String>>,

    #[serde(default = "Config::default_calibration_file")]
    pub calibration_file: String,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Application id the network server prefixes device topics with.
    pub app_id: String,

    /// Namespace for the bridge's own topics (commands in, observer
    /// fan-out and LWT out).
    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    pub url: String,
}

impl Database {
    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        serde_yaml::from_str(&content).map_err(|err| anyhow!("error parsing {}: {}", file, err))
    }

    pub fn mqtt(&self) -> &Mqtt {
        &self.mqtt
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn devices(&self) -> &HashMap<String, Vec<String>> {
        &self.devices
    }

    pub fn calibration_file(&self) -> &str {
        &self.calibration_file
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_calibration_file() -> String {
        "calibration.yaml".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "battery-bridge".to_string()
    }
}
