use thiserror::Error;

/// Recoverable protocol and routing failures.
///
/// None of these abort the bridge: a frame or command that hits one of
/// these is dropped, logged and counted, and processing continues with
/// the next message. Startup-time configuration problems (no devices,
/// unreadable calibration file) are reported through `anyhow` instead.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Wire data too short to decode.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Telemetry only arrives on application ports 1 and 2.
    #[error("unknown application port {0}")]
    UnknownPort(u8),

    /// No battery configured for this device/channel pair.
    #[error("no battery configured for device {device} channel {channel}")]
    UnknownChannel { device: String, channel: u8 },

    /// Battery id not present in the device directory.
    #[error("unknown battery {0}")]
    UnknownBattery(String),
}
