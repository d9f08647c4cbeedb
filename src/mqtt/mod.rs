use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::MqttConfig;

/// One meter's decoded measurements for one scan cycle. Only built when
/// every measurement group of the device decoded successfully.
#[derive(Debug, Serialize, Deserialize)]
pub struct MeterReading {
    pub meter_id: String,
    pub metered_at: DateTime<Utc>,
    pub values: serde_json::Map<String, Value>,
}

impl MeterReading {
    pub fn new(meter_id: String) -> Self {
        return MeterReading {
            meter_id,
            metered_at: Utc::now(),
            values: serde_json::Map::new(),
        };
    }

    /// The wire contract with downstream consumers: a flat object with the
    /// meter id under "ID" and one short channel code per decoded value.
    pub fn wire_payload(&self) -> Result<String, serde_json::Error> {
        let mut message = serde_json::Map::new();
        message.insert("ID".to_string(), Value::String(self.meter_id.clone()));
        for (code, value) in self.values.iter() {
            message.insert(code.clone(), value.clone());
        }
        return serde_json::to_string(&Value::Object(message));
    }
}

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub enum Transmission {
    Publish(PublishData),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("unable to serialize reading: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink queue is full, dropping reading")]
    SinkBusy,
    #[error("sink channel is closed")]
    SinkClosed,
}

/// Hands readings over to the MQTT manager task. Fire and forget as far as
/// the poll loop is concerned: a full queue drops the reading instead of
/// stalling the bus scan, delivery errors are logged on the manager side.
pub struct Publisher {
    sender: Sender<Transmission>,
}

impl Publisher {
    pub fn new(sender: Sender<Transmission>) -> Self {
        return Publisher { sender };
    }

    pub fn publish(&self, reading: MeterReading) -> Result<(), PublishError> {
        let data = PublishData {
            topic: reading.meter_id.clone(),
            payload: reading.wire_payload()?,
            qos: 1,
            retain: false,
        };

        return self.sender.try_send(Transmission::Publish(data)).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => PublishError::SinkBusy,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => PublishError::SinkClosed,
        });
    }
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

impl MqttManager {
    /// Set up the broker client and its event loop. The connection itself is
    /// established lazily by the event loop, an unreachable broker at startup
    /// does not hold up the rest of the program.
    pub fn new(config: &MqttConfig, device_topics: Vec<String>) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        let subscribe_client = client.clone();
        tokio::spawn(async move {
            info!("MQTT event loop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker, subscribing device topics");
                        for topic in device_topics.iter() {
                            if let Err(e) = subscribe_client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                error!("Subscribing {topic} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        /* TODO: act on inbound control messages, for now they are only logged */
                        debug!("Received message on {}: {} bytes", p.topic, p.payload.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (
            MqttManager {
                rx: mrx,
                exit_thread: false,
                client,
            },
            mtx,
        );
    }

    /// Drain the publish channel until every sender is gone.
    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let option = self.rx.recv().await;

            if option.is_none() {
                debug!("Publish channel closed, we exit now");
                self.exit_thread = true;
                continue;
            }

            match option.unwrap() {
                Transmission::Publish(data) => {
                    let qos = match data.qos {
                        0 => QoS::AtMostOnce,
                        1 => QoS::AtLeastOnce,
                        2 => QoS::ExactlyOnce,
                        _ => QoS::AtMostOnce,
                    };

                    match self.client.publish(data.topic, qos, data.retain, data.payload).await {
                        Err(e) => { error!("Error publishing: {}", e); }
                        Ok(_) => { debug!("Published successfully"); }
                    }
                }
            }
        }

        info!("MQTT manager exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_118() -> MeterReading {
        let mut reading = MeterReading::new("118".to_string());
        for (code, value) in [
            ("NCH1", 50.25),
            ("NCH2", 398.75),
            ("NCH3", 398.5),
            ("NCH4", 1250.25),
            ("NCH5", 3.5),
            ("NCH6", 1253.75),
            ("NCH7", 0.5),
        ] {
            reading.values.insert(code.to_string(), Value::from(value));
        }
        return reading;
    }

    #[test]
    fn test_wire_payload_format() {
        let payload = reading_118().wire_payload().unwrap();
        assert_eq!(
            payload,
            r#"{"ID":"118","NCH1":50.25,"NCH2":398.75,"NCH3":398.5,"NCH4":1250.25,"NCH5":3.5,"NCH6":1253.75,"NCH7":0.5}"#
        );
    }

    #[test]
    fn test_wire_payload_has_no_timestamp() {
        // The timestamp stays internal, the wire object is id + channels only
        let payload = reading_118().wire_payload().unwrap();
        assert!(!payload.contains("metered_at"));
    }

    #[test]
    fn test_publisher_targets_device_topic() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let publisher = Publisher::new(tx);

        publisher.publish(reading_118()).unwrap();

        let Transmission::Publish(data) = rx.try_recv().unwrap();
        assert_eq!(data.topic, "118");
        assert_eq!(data.qos, 1);
        assert!(!data.retain);
        assert!(data.payload.contains("\"NCH1\":50.25"));
    }

    #[test]
    fn test_publisher_reports_closed_sink() {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        drop(rx);
        let publisher = Publisher::new(tx);

        let result = publisher.publish(reading_118());
        assert!(matches!(result, Err(PublishError::SinkClosed)));
    }

    #[test]
    fn test_publisher_drops_reading_when_queue_is_full() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let publisher = Publisher::new(tx);

        publisher.publish(reading_118()).unwrap();
        let result = publisher.publish(reading_118());
        assert!(matches!(result, Err(PublishError::SinkBusy)));
    }
}
