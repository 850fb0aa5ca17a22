use crate::prelude::*;

pub mod reconcile;

use chrono::Utc;
use std::sync::Mutex;

/// Counters printed at shutdown, shared with the MQTT sender and the
/// database inserter.
#[derive(Default)]
pub struct Stats {
    pub uplinks_received: u64,
    pub statuses_decoded: u64,
    pub malformed_frames: u64,
    pub unknown_ports: u64,
    pub directory_misses: u64,
    pub panic_alerts: u64,
    pub commands_received: u64,
    pub configs_issued: u64,
    pub config_resends: u64,
    pub configs_acked: u64,
    pub ack_after_drift: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    pub database_writes: u64,
    pub database_errors: u64,
}

impl Stats {
    pub fn print_summary(&self) {
        info!("Statistics:");
        info!("  Uplinks received: {}", self.uplinks_received);
        info!("    Statuses decoded: {}", self.statuses_decoded);
        info!("    Malformed frames: {}", self.malformed_frames);
        info!("    Unknown ports: {}", self.unknown_ports);
        info!("    Directory misses: {}", self.directory_misses);
        info!("    Panic alerts: {}", self.panic_alerts);
        info!("  Commands received: {}", self.commands_received);
        info!("    Configs issued: {}", self.configs_issued);
        info!("    Configs re-sent: {}", self.config_resends);
        info!("    Configs acknowledged: {}", self.configs_acked);
        info!("    Drift after ack: {}", self.ack_after_drift);
        info!("  MQTT messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
        info!("  Database writes: {}", self.database_writes);
        info!("    Errors: {}", self.database_errors);
    }
}

/// The reconciliation engine. Owns no transport: frames and commands
/// arrive on `from_mqtt`, everything outbound leaves on `to_mqtt` and
/// `to_database`.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<config::Config>,
    channels: Channels,
    store: Arc<BatteryStore>,
    directory: Arc<DeviceDirectory>,
    calibrations: Arc<Calibrations>,
    pub stats: Arc<Mutex<Stats>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<config::Config>,
        channels: Channels,
        store: Arc<BatteryStore>,
        directory: Arc<DeviceDirectory>,
        calibrations: Arc<Calibrations>,
        stats: Arc<Mutex<Stats>>,
    ) -> Self {
        Self {
            config,
            channels,
            store,
            directory,
            calibrations,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.channels.from_mqtt.subscribe();

        loop {
            match receiver.recv().await? {
                mqtt::ChannelData::Message(message) => {
                    if let Err(e) = self.process_message(message).await {
                        warn!("failed to process message: {:#}", e);
                    }
                }
                mqtt::ChannelData::Shutdown => {
                    if let Ok(stats) = self.stats.lock() {
                        stats.print_summary();
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
    }

    async fn process_message(&self, message: mqtt::Message) -> Result<()> {
        let c = self.config.mqtt();

        match message.classify(c.app_id(), c.namespace())? {
            Some(mqtt::Inbound::Uplink { dev_id, uplink }) => {
                self.handle_uplink(&dev_id, uplink).await
            }
            Some(mqtt::Inbound::Command(request)) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.commands_received += 1;
                }
                self.process_command(request).await
            }
            None => Ok(()),
        }
    }

    /// Route a raw uplink to its battery and decode it. Everything
    /// recoverable is dropped here with a log line; only the decoded
    /// status makes it into the engine.
    async fn handle_uplink(&self, dev_id: &str, uplink: ttn::Uplink) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            stats.uplinks_received += 1;
        }

        let channel = match uplink.port {
            1 | 2 => uplink.port - 1,
            port => {
                info!("{}", Error::UnknownPort(port));
                if let Ok(mut stats) = self.stats.lock() {
                    stats.unknown_ports += 1;
                }
                return Ok(());
            }
        };

        let battery = match self.directory.device_to_battery(dev_id, channel) {
            Ok(battery) => battery.to_string(),
            Err(err) => {
                // a directory miss is a configuration error, not a
                // transient fault; nothing to retry
                error!("{}", err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.directory_misses += 1;
                }
                return Ok(());
            }
        };

        let raw = match uplink.frame().and_then(|frame| {
            packet::decode_status(&frame).map_err(anyhow::Error::from)
        }) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("dropping frame from {}: {:#}", dev_id, err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.malformed_frames += 1;
                }
                return Ok(());
            }
        };

        let cal = self.calibrations.for_battery(&battery);
        let status = Status::from_raw(&battery, &raw, &cal, Utc::now());
        if let Ok(mut stats) = self.stats.lock() {
            stats.statuses_decoded += 1;
        }

        self.process_uplink(status).await
    }

    /// The reconcile step: record the status, then hold it against the
    /// last issued config and re-send that config when the device has
    /// drifted. The battery's entry stays locked for the whole
    /// sequence so a concurrent command cannot interleave.
    pub async fn process_uplink(&self, status: Status) -> Result<()> {
        debug!("RX status: {:?}", status);

        let entry = self.store.entry(&status.battery)?;
        let mut entry = entry.lock().await;

        // edge-triggered: repeated panic frames do not re-alert
        let was_panicking = entry.status.as_ref().map(|s| s.panic).unwrap_or(false);
        if status.panic && !was_panicking {
            error!("panic mode enabled on {}: {:?}", status.battery, status);
            if let Ok(mut stats) = self.stats.lock() {
                stats.panic_alerts += 1;
            }
        }

        self.send_to_database(database::ChannelData::StatusRow(Box::new(status.clone())))?;
        entry.status = Some(status.clone());

        if let Some(config) = entry.config.as_mut() {
            let cal = self.calibrations.for_battery(&status.battery);
            let verdict = reconcile::compare(&status, config, &cal, status.timestamp);

            if !verdict.matches() {
                info!(
                    "{} does not match its config ({}), re-sending",
                    status.battery,
                    verdict.mismatched.join(", ")
                );
                self.send_downlink(config, verdict.expected_timeout, &cal)?;
                if let Ok(mut stats) = self.stats.lock() {
                    stats.config_resends += 1;
                }

                if config.ack_timestamp.is_some() {
                    warn!(
                        "{} drifted from a config it had already acknowledged",
                        status.battery
                    );
                    warn!("received: {:?}", status);
                    warn!("expected: {:?}", config);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.ack_after_drift += 1;
                    }
                }
            } else if config.ack_timestamp.is_none() {
                let now = Utc::now();
                config.ack_timestamp = Some(now);
                if let Some(id) = config.id {
                    self.send_to_database(database::ChannelData::AckConfig {
                        id,
                        timestamp: now,
                    })?;
                }
                info!("{} acknowledged its config", status.battery);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.configs_acked += 1;
                }
                self.publish_message(mqtt::Message::for_config(
                    self.config.mqtt().namespace(),
                    config,
                )?)?;
            }
        }

        self.publish_message(mqtt::Message::for_status(
            self.config.mqtt().namespace(),
            &status,
        )?)?;

        Ok(())
    }

    /// An operator command always supersedes whatever was issued
    /// before: append the new config, swap it into memory, push it to
    /// the device and tell the observers.
    pub async fn process_command(&self, request: ConfigRequest) -> Result<()> {
        info!("received command: {:?}", request);

        let (dev_id, channel) = {
            let (dev_id, channel) = self.directory.battery_to_device(&request.battery)?;
            (dev_id.to_string(), channel)
        };

        let entry = self.store.entry(&request.battery)?;
        let mut entry = entry.lock().await;

        let cal = self.calibrations.for_battery(&request.battery);
        let mut config = Config::from_request(request, &cal, Utc::now());

        let id = self.insert_config(&config).await?;
        config.id = Some(id);

        let frame = packet::encode_config(
            config.manual_timeout,
            &config.pump,
            config.target_flow,
            &config.target_level_raw,
            &config.min_level_raw,
            &config.max_level_raw,
        );

        entry.config = Some(config.clone());

        self.publish_message(mqtt::Message::for_downlink(
            self.config.mqtt().app_id(),
            &dev_id,
            channel,
            &frame,
        )?)?;
        self.publish_message(mqtt::Message::for_config(
            self.config.mqtt().namespace(),
            &config,
        )?)?;

        if let Ok(mut stats) = self.stats.lock() {
            stats.configs_issued += 1;
        }

        Ok(())
    }

    /// Re-issue a stored config with its timeout rewritten to what the
    /// device should currently report, and raw levels recomputed with
    /// the calibration in effect now.
    fn send_downlink(
        &self,
        config: &Config,
        manual_timeout: u16,
        cal: &[Coefficients; crate::calibration::CHANNELS],
    ) -> Result<()> {
        let frame = packet::encode_config(
            manual_timeout,
            &config.pump,
            config.target_flow,
            &crate::calibration::cm_to_raw_triple(&config.target_level, cal),
            &crate::calibration::cm_to_raw_triple(&config.min_level, cal),
            &crate::calibration::cm_to_raw_triple(&config.max_level, cal),
        );

        let (dev_id, channel) = self.directory.battery_to_device(&config.battery)?;

        self.publish_message(mqtt::Message::for_downlink(
            self.config.mqtt().app_id(),
            dev_id,
            channel,
            &frame,
        )?)
    }

    /// Append a config row and wait for its surrogate id.
    async fn insert_config(&self, config: &Config) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(Some(tx)));

        let channel_data = database::ChannelData::ConfigRow(Box::new(config.clone()), reply);
        if self.channels.to_database.send(channel_data).is_err() {
            bail!("send(to_database) failed - channel closed?");
        }

        rx.await
            .map_err(|_| anyhow!("database did not report a config row id"))
    }

    fn send_to_database(&self, channel_data: database::ChannelData) -> Result<()> {
        if self.channels.to_database.send(channel_data).is_err() {
            bail!("send(to_database) failed - channel closed?");
        }
        Ok(())
    }

    fn publish_message(&self, message: mqtt::Message) -> Result<()> {
        let channel_data = mqtt::ChannelData::Message(message);
        if self.channels.to_mqtt.send(channel_data).is_err() {
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }
}
