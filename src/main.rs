// Main entry point - Dependency injection and poller setup
use std::sync::Arc;

use machine_telemetry::infrastructure::config::{load_config, TransportMode};
use machine_telemetry::infrastructure::http_transport::HttpTransport;
use machine_telemetry::infrastructure::static_transport::StaticTransport;
use machine_telemetry::{Aggregator, BusEvent, MachineTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = load_config()?;

    // Create transport (infrastructure layer)
    let transport: Arc<dyn MachineTransport> = match config.transport.mode {
        TransportMode::Http => {
            let base_url = config
                .transport
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("transport.base_url is required in http mode"))?;
            Arc::new(HttpTransport::new(base_url))
        }
        TransportMode::Static => {
            let dataset = config
                .transport
                .dataset
                .clone()
                .ok_or_else(|| anyhow::anyhow!("transport.dataset is required in static mode"))?;
            Arc::new(StaticTransport::from_file(dataset)?)
        }
    };

    // Create the aggregator (application layer) with injected transport
    let aggregator = Aggregator::new(transport, &config.aggregator)?;

    aggregator.subscribe(|event| match event {
        BusEvent::Update { timestamp } => {
            tracing::debug!(timestamp = %timestamp, "cache refreshed");
        }
        BusEvent::Error { machine_id, cause } => {
            tracing::error!(machine_id = %machine_id, cause = %cause, "machine refresh failing");
        }
    });

    aggregator.start().await;
    tracing::info!("machine-telemetry aggregator running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    aggregator.stop().await;

    Ok(())
}
