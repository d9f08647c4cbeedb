use log::info;
use tokio::sync::watch;

use crate::metering_modbus::transport::{Transport, TransportError};
use crate::metering_modbus::PollScheduler;
use crate::mqtt::Publisher;

/// Owns the poll-decode-publish pipeline for the process lifetime: the bus
/// transport, the scheduler, and the handle into the MQTT manager task.
pub struct PipelineRunner<T: Transport> {
    transport: T,
    scheduler: PollScheduler,
    publisher: Publisher,
}

impl<T: Transport> PipelineRunner<T> {
    pub fn new(transport: T, scheduler: PollScheduler, publisher: Publisher) -> Self {
        return PipelineRunner { transport, scheduler, publisher };
    }

    /// Connect the bus and poll until the shutdown flag flips. A bus that
    /// cannot be reached at startup is a hard failure, polling without it is
    /// meaningless. The broker side reconnects on its own and never gates
    /// the poll loop.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        self.transport.connect().await?;
        info!("Transport connected, starting the poll loop");

        self.scheduler.run(&mut self.transport, &self.publisher, shutdown).await;

        self.transport.close().await;
        info!("Poll loop stopped, transport released");
        return Ok(());
    }
}
