//! Poll a fleet of Modbus energy meters and export their readings to MQTT.
//!
//! The crate runs a continuous poll-decode-publish pipeline: every scan
//! cycle reads each configured meter's register groups over the shared bus,
//! decodes the raw words into physical measurements, and forwards one JSON
//! message per meter to the broker. Register layouts are per-model
//! configuration, a failing meter never stops the rest of the fleet.

pub mod config;
pub mod metering_modbus;
pub mod mqtt;
pub mod pipeline;

// Re-export common types for easier access
pub use config::Config;
pub use metering_modbus::transport::TcpTransport;
pub use metering_modbus::PollScheduler;
pub use mqtt::{MeterReading, MqttManager, Publisher};
pub use pipeline::PipelineRunner;
