use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use receiver_core::config::load_config;
use receiver_core::sink::channel::ChannelEventSource;
use receiver_core::source::mqtt::MqttConnector;
use receiver_core::telemetry::init_tracing;
use receiver_core::{LifecycleComponent, Receiver, TracingProgressMonitor};
use tracing::{info, warn};

const START_RETRY_DELAY: Duration = Duration::from_secs(5);

/// This is the entry point for running a long-lived MQTT receiver on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the file given as first argument, or from RECEIVER_CONFIG.
///     Start the receiver, retrying while the broker is unreachable.
///     Drain forwarded payloads until a shutdown signal is received.
///     Stop the receiver and log the final metrics.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load receiver configuration")?;

    let (event_source, mut events) =
        ChannelEventSource::new(config.source_id.clone(), config.channel_capacity);
    let mut receiver = Receiver::new(config.receiver.clone(), MqttConnector)
        .with_event_source(Arc::new(event_source));
    let monitor = TracingProgressMonitor;

    loop {
        match receiver.start(&monitor).await {
            Ok(()) => break,
            Err(e) if e.is_retryable() => {
                warn!("Receiver failed to start, will retry: {:?}", e);
                tokio::time::sleep(START_RETRY_DELAY).await;
            }
            Err(e) => {
                let name = receiver.display_name();
                return Err(e).with_context(|| format!("Unable to start receiver {}", name));
            }
        }
    }
    info!("Receiver {} running", receiver.display_name());

    // stands in for the decoding stage
    let drain = tokio::spawn(async move {
        let mut drained = 0u64;
        while let Some(event) = events.recv().await {
            drained += 1;
            info!(
                "Encoded event from {} ({} bytes, metadata: {:?})",
                event.receiver,
                event.payload.len(),
                event.metadata
            );
        }
        drained
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    receiver.stop(&monitor).await;
    let metrics = receiver.metrics();
    drop(receiver);

    let drained = drain.await.context("Event drain task failed")?;
    info!(
        "Drained {} event(s). Final metrics: {}",
        drained,
        serde_json::to_string(&metrics)?
    );
    Ok(())
}
