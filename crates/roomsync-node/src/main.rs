//! Roomsync node binary
//!
//! Runs a simulated room and prints the run summary as JSON.

use roomsync_node::{NodeConfig, RoomNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomsync_node=info,roomsync_protocols=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(?config, "Starting roomsync node");

    let mut node = RoomNode::new(config)?;
    let summary = node.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
