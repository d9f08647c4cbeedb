use meter2mqtt::{Config, MqttManager, PipelineRunner, PollScheduler, Publisher, TcpTransport};
use log::{error, info};
use std::io::{Error, ErrorKind};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Err(Error::new(ErrorKind::InvalidInput, e.to_string()));
        }
    };

    /* Resolve every model's register map before touching the bus, a meter
     * we cannot decode is a configuration problem, not a runtime one */
    let scheduler = match PollScheduler::new(&config.modbus) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("{e}");
            return Err(Error::new(ErrorKind::InvalidInput, e.to_string()));
        }
    };

    // The broker side lives in its own tasks and reconnects on its own
    let device_topics: Vec<String> = config.modbus.devices.iter().map(|d| d.id.clone()).collect();
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt, device_topics);
    let mqtt_task = tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, stopping after the current read");
        let _ = shutdown_tx.send(true);
    });

    let transport = TcpTransport::new(&config.modbus);
    let runner = PipelineRunner::new(transport, scheduler, Publisher::new(tx));

    if let Err(e) = runner.run(shutdown_rx).await {
        error!("Pipeline failed: {e}");
        return Err(Error::other(e.to_string()));
    }

    /* The runner dropped the last publisher, the manager drains and exits */
    let _ = mqtt_task.await;
    info!("Clean shutdown");
    Ok(())
}
