//! Subscribe to a few Pulse Radar topics and log what arrives.
//!
//! ```text
//! PULSE_WS_HOST=localhost:8080 cargo run --example pulse_radar -- http://localhost:3000
//! ```

use pulse_ws::{Endpoint, InboundMessage, TopicManager, TopicManagerConfig};
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let origin = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost".to_string());

    let config = TopicManagerConfig::builder()
        .endpoint(Endpoint::from_env(&origin)?)
        .build()?;

    let manager = TopicManager::new(config);

    let metrics = manager.subscribe(["metrics"], |msg: &InboundMessage| {
        info!("metrics seq={:?} data={:?}", msg.seq, msg.data);
    });
    let (_analysis, mut analysis_rx) = manager.subscribe_channel(["analysis", "proposals"]);

    let mut status = manager.watch_status();
    let mut report = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                info!(
                    "status: {:?} (connection {:?}, attempt {})",
                    current.state, current.connection_id, current.reconnect_attempt
                );
            }
            Some(msg) = analysis_rx.recv() => {
                info!("{:?} {:?}: {:?}", msg.topic, msg.kind, msg.data);
            }
            _ = report.tick() => {
                info!("{:?}", manager.metrics().snapshot());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.unsubscribe(&metrics);
    manager.shutdown().await;
    Ok(())
}
