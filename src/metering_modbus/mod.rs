use std::collections::HashMap;
use std::time::Duration;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::{MeterDeviceConfig, ModbusConfig};
use crate::metering_modbus::decode::{decode_group, DecodeError};
use crate::metering_modbus::registers::{load_register_map, RegisterMap, RegisterMapError};
use crate::metering_modbus::transport::{Transport, TransportError};
use crate::mqtt::{MeterReading, Publisher};

pub mod decode;
pub mod registers;
pub mod transport;

#[derive(Debug, Error)]
pub enum ReadFailure {
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error("decode: {0}")]
    Decode(DecodeError),
}

/// One diagnostic per failed device read: which meter, which measurement
/// group aborted the read, and why.
#[derive(Debug, Error)]
#[error("device {device}: reading group {group} failed: {cause}")]
pub struct DeviceReadError {
    pub device: String,
    pub group: String,
    pub cause: ReadFailure,
}

impl DeviceReadError {
    fn new(device: &MeterDeviceConfig, group: &str, cause: ReadFailure) -> Self {
        return DeviceReadError {
            device: device.id.clone(),
            group: group.to_string(),
            cause,
        };
    }
}

#[derive(Clone)]
pub struct PollTiming {
    pub read_timeout: Duration,
    pub group_delay: Duration,
    pub cycle_delay: Duration,
}

impl PollTiming {
    pub fn from_config(config: &ModbusConfig) -> Self {
        return PollTiming {
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            group_delay: Duration::from_millis(config.group_delay_ms),
            cycle_delay: Duration::from_millis(config.cycle_delay_ms),
        };
    }
}

/// Read every measurement group of one meter. All or nothing: any group
/// that cannot be read or decoded aborts the device for this cycle and no
/// partial reading leaves this function. Raw words are decoded group by
/// group, so at most one group's block is held at a time.
pub async fn read_device<T: Transport>(
    transport: &mut T,
    device: &MeterDeviceConfig,
    map: &RegisterMap,
    timing: &PollTiming,
) -> Result<MeterReading, DeviceReadError> {
    let mut reading = MeterReading::new(device.id.clone());

    for group in map.groups.iter() {
        debug!("Device {} group {} start reading", device.id, group.name);

        let words = transport
            .read_registers(device.unit_id, group.start, group.count, timing.read_timeout)
            .await
            .map_err(|e| DeviceReadError::new(device, &group.name, ReadFailure::Transport(e)))?;

        if words.len() != group.count as usize {
            let cause = DecodeError::MalformedInput { expected: group.count as usize, got: words.len() };
            return Err(DeviceReadError::new(device, &group.name, ReadFailure::Decode(cause)));
        }

        let values = decode_group(&words, &group.decode)
            .map_err(|e| DeviceReadError::new(device, &group.name, ReadFailure::Decode(e)))?;

        for channel in group.channels.iter() {
            let value = values.get(channel.index).copied().ok_or_else(|| {
                let cause = DecodeError::ChannelOutOfRange { index: channel.index, values: values.len() };
                DeviceReadError::new(device, &group.name, ReadFailure::Decode(cause))
            })?;
            reading.values.insert(channel.code.clone(), Value::from(value));
        }

        /* Pace the bus between group reads */
        sleep(timing.group_delay).await;
    }

    return Ok(reading);
}

/// Drives the endless scan over the configured meters. Devices are read in
/// configuration order, one failing meter never stops the rest of the fleet.
pub struct PollScheduler {
    devices: Vec<MeterDeviceConfig>,
    maps: HashMap<String, RegisterMap>,
    timing: PollTiming,
}

impl PollScheduler {
    /// Load the register map of every configured model up front. A model
    /// without a definition is a startup failure, polling a meter we cannot
    /// decode is pointless.
    pub fn new(config: &ModbusConfig) -> Result<Self, RegisterMapError> {
        let mut maps: HashMap<String, RegisterMap> = HashMap::new();
        for device in config.devices.iter() {
            if !maps.contains_key(&device.model) {
                maps.insert(device.model.clone(), load_register_map(&device.model)?);
            }
        }

        return Ok(Self::from_parts(config.devices.clone(), maps, PollTiming::from_config(config)));
    }

    /// Build a scheduler from already loaded maps.
    pub fn from_parts(
        devices: Vec<MeterDeviceConfig>,
        maps: HashMap<String, RegisterMap>,
        timing: PollTiming,
    ) -> Self {
        return PollScheduler { devices, maps, timing };
    }

    pub async fn run<T: Transport>(
        &self,
        transport: &mut T,
        publisher: &Publisher,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Polling {} meters", self.devices.len());

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle(transport, publisher, &shutdown).await;

            tokio::select! {
                _ = sleep(self.timing.cycle_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Poll loop exiting on shutdown signal");
    }

    /// One full pass over the device list. The error boundary per device is
    /// absolute: read failures are logged and the scan moves on.
    pub async fn run_cycle<T: Transport>(
        &self,
        transport: &mut T,
        publisher: &Publisher,
        shutdown: &watch::Receiver<bool>,
    ) {
        debug!("Scan cycle starting");

        for device in self.devices.iter() {
            if *shutdown.borrow() {
                return;
            }

            let map = match self.maps.get(&device.model) {
                Some(map) => map,
                None => {
                    error!("No register map loaded for model {} of device {}", device.model, device.id);
                    continue;
                }
            };

            match read_device(transport, device, map, &self.timing).await {
                Ok(reading) => {
                    debug!("Device {} read complete", device.id);
                    if let Err(e) = publisher.publish(reading) {
                        error!("Publishing reading of meter {} failed: {e}", device.id);
                    }
                }
                Err(e) => {
                    /* Decode trouble points at a broken register map, that is
                     * worth more noise than a flaky bus */
                    match &e.cause {
                        ReadFailure::Transport(_) => warn!("{e}"),
                        ReadFailure::Decode(_) => error!("{e}"),
                    }

                    if !transport.is_connected() {
                        reconnect_with_retry(transport, shutdown).await;
                    }
                }
            }

            /* Pace the bus between devices as well */
            sleep(self.timing.group_delay).await;
        }

        debug!("Scan cycle done");
    }
}

/// Bring the shared bus connection back after it dropped. Bounded, the next
/// cycle retries anyway if the endpoint stays away.
async fn reconnect_with_retry<T: Transport>(transport: &mut T, shutdown: &watch::Receiver<bool>) {
    const MAX_RETRIES: u32 = 3;

    for attempt in 1..=MAX_RETRIES {
        if *shutdown.borrow() {
            return;
        }

        match transport.connect().await {
            Ok(()) => {
                info!("Transport reconnected");
                return;
            }
            Err(e) => {
                warn!("Transport reconnect failed ({}/{}): {}", attempt, MAX_RETRIES, e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    error!("Transport still down after {} reconnect attempts", MAX_RETRIES);
}
