use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;
use thiserror::Error;

fn mqtt_client_name_default() -> String { return "meter2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub enum ModbusProtoConfig {
    TCP,
    RTUoverTCP
}

/// One physical meter on the bus: the external id used as the MQTT topic,
/// the unit/station address answering on the bus, and the register map model.
#[derive(Deserialize, Serialize, Clone)]
pub struct MeterDeviceConfig {
    pub id: String,
    pub unit_id: u8,
    pub model: String,
}

fn modbus_proto_default() -> ModbusProtoConfig { return ModbusProtoConfig::TCP }
fn read_timeout_default() -> u64 { return 500 }
fn group_delay_default() -> u64 { return 1 }
fn cycle_delay_default() -> u64 { return 100 }
fn modbus_devices_default() -> Vec<MeterDeviceConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    #[serde(default="modbus_proto_default")]
    pub proto: ModbusProtoConfig,
    /* All timing knobs are milliseconds */
    #[serde(default="read_timeout_default")]
    pub read_timeout_ms: u64,
    #[serde(default="group_delay_default")]
    pub group_delay_ms: u64,
    #[serde(default="cycle_delay_default")]
    pub cycle_delay_ms: u64,
    #[serde(default="modbus_devices_default")]
    pub devices: Vec<MeterDeviceConfig>,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub modbus: ModbusConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file at config/m2m.yaml or m2m.yaml")]
    NotFound,
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

impl Config {
    /// Load the configuration, checking the two usual locations.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match File::open("config/m2m.yaml") {
            Ok(f) => f,
            Err(_) => File::open("m2m.yaml").map_err(|_| ConfigError::NotFound)?,
        };
        return Self::parse_file(file);
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        return Self::parse_file(File::open(path)?);
    }

    fn parse_file(mut file: File) -> Result<Self, ConfigError> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        return Ok(serde_yml::from_str(&contents)?);
    }
}
