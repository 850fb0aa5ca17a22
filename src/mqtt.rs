use crate::prelude::*;
use crate::coordinator::Stats;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::sync::Mutex;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

/// What an incoming publish turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Telemetry from the network server.
    Uplink { dev_id: String, uplink: ttn::Uplink },
    /// An operator config request from the command topic.
    Command(ConfigRequest),
}

impl Message {
    /// Sort an incoming publish into an uplink or a command based on
    /// its topic. Topics outside both families yield `None`.
    pub fn classify(&self, app_id: &str, namespace: &str) -> Result<Option<Inbound>> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        match parts[..] {
            [app, "devices", dev_id, "up"] if app == app_id => {
                let uplink = ttn::Uplink::from_json(&self.payload)?;
                // the envelope usually repeats the device id; the topic
                // is authoritative when it doesn't
                let dev_id = uplink
                    .dev_id
                    .clone()
                    .unwrap_or_else(|| dev_id.to_string());
                Ok(Some(Inbound::Uplink { dev_id, uplink }))
            }
            [ns, "cmd", battery, "config"] if ns == namespace => {
                let mut request: ConfigRequest = serde_json::from_str(&self.payload)
                    .map_err(|err| anyhow!("error parsing config request: {}", err))?;
                request.battery = battery.to_string();
                Ok(Some(Inbound::Command(request)))
            }
            _ => Ok(None),
        }
    }

    /// Observer fan-out: the latest status of one battery.
    pub fn for_status(namespace: &str, status: &Status) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/battery/{}/status", namespace, status.battery),
            retain: false,
            payload: serde_json::to_string(status)?,
        })
    }

    /// Observer fan-out: the current (possibly just-acked) config of
    /// one battery. Retained so late joiners see the desired state.
    pub fn for_config(namespace: &str, config: &Config) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/battery/{}/config", namespace, config.battery),
            retain: true,
            payload: serde_json::to_string(config)?,
        })
    }

    /// A command frame for a device, wrapped in the downlink envelope.
    /// Channel N of a device listens on application port N+1.
    pub fn for_downlink(
        app_id: &str,
        dev_id: &str,
        channel: u8,
        frame: &[u8],
    ) -> Result<Message> {
        let downlink = ttn::Downlink::new(channel + 1, frame);
        Ok(Message {
            topic: ttn::downlink_topic(app_id, dev_id),
            retain: false,
            payload: downlink.to_payload()?,
        })
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: Arc<config::Config>,
    channels: Channels,
    stats: Arc<Mutex<Stats>>,
}

impl Mqtt {
    pub fn new(config: Arc<config::Config>, channels: Channels, stats: Arc<Mutex<Stats>>) -> Self {
        Self {
            config,
            channels,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        let mut options = MqttOptions::new("battery-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        // uplinks from the network server
        client
            .subscribe(
                format!("{}/devices/+/up", self.config.mqtt().app_id()),
                QoS::AtMostOnce,
            )
            .await?;

        // operator commands
        client
            .subscribe(
                format!("{}/cmd/+/config", self.config.mqtt().namespace()),
                QoS::AtMostOnce,
            )
            .await?;

        Ok(())
    }

    // mqtt -> coordinator
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.handle_message(publish)?;
                }
                Err(e) => {
                    error!("{}", e);
                    info!("reconnecting in 5s");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
                _ => {} // keepalives etc
            }
        }
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        let message = Message {
            topic: publish.topic.clone(),
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);

        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await? {
                Shutdown => {
                    let _ = client.disconnect().await;
                    break;
                }
                Message(message) => {
                    debug!("TX: {} = {}", message.topic, message.payload);

                    // in-memory state is already updated by the time a
                    // message lands here; a failed publish is logged
                    // and repaired by the next reconciliation pass
                    let publish = client.publish(
                        &message.topic,
                        QoS::AtLeastOnce,
                        message.retain,
                        message.payload.as_bytes(),
                    );
                    match tokio::time::timeout(std::time::Duration::from_secs(10), publish).await {
                        Ok(Ok(())) => {
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.mqtt_messages_sent += 1;
                            }
                        }
                        Ok(Err(err)) => {
                            error!("publish to {} failed: {}", message.topic, err);
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.mqtt_errors += 1;
                            }
                        }
                        Err(_) => {
                            error!("publish to {} timed out", message.topic);
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.mqtt_errors += 1;
                            }
                        }
                    }
                }
            }
        }

        info!("mqtt sender loop exiting");
        Ok(())
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.to_string(),
            retain: false,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn classifies_uplinks_by_topic() {
        let m = message(
            "tanks/devices/node-01/up",
            r#"{"dev_id":"node-01","port":1,"payload_raw":"AAA="}"#,
        );

        match m.classify("tanks", "battery-bridge").unwrap() {
            Some(Inbound::Uplink { dev_id, uplink }) => {
                assert_eq!(dev_id, "node-01");
                assert_eq!(uplink.port, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classifies_commands_and_forces_topic_battery() {
        let m = message(
            "battery-bridge/cmd/b1/config",
            r#"{"battery":"spoofed","manual_timeout":10,"pump":[true,false,false,true],
                "target_flow":40,"target_level":[30,45,60],"min_level":[0,0,0],
                "max_level":[80,130,180],"username":"sjoerd"}"#,
        );

        match m.classify("tanks", "battery-bridge").unwrap() {
            Some(Inbound::Command(request)) => {
                assert_eq!(request.battery, "b1");
                assert_eq!(request.manual_timeout, 10);
                assert_eq!(request.username, "sjoerd");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let m = message("other-app/devices/node-01/up", "{}");
        assert_eq!(m.classify("tanks", "battery-bridge").unwrap(), None);

        let m = message("battery-bridge/battery/b1/status", "{}");
        assert_eq!(m.classify("tanks", "battery-bridge").unwrap(), None);
    }

    #[test]
    fn garbage_uplink_payload_is_an_error() {
        let m = message("tanks/devices/node-01/up", "not json");
        assert!(m.classify("tanks", "battery-bridge").is_err());
    }
}
