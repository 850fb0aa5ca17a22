pub use std::str::FromStr;
pub use std::sync::Arc;

pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::{broadcast, oneshot};

pub use crate::battery::{BatteryEntry, BatteryStore, Config, ConfigRequest, Status};
pub use crate::calibration::{Calibrations, Coefficients};
pub use crate::channels::Channels;
pub use crate::config;
pub use crate::coordinator::Coordinator;
pub use crate::database::{self, Database};
pub use crate::directory::DeviceDirectory;
pub use crate::error::Error;
pub use crate::mqtt;
pub use crate::options::Options;
pub use crate::packet;
pub use crate::ttn;
