//! # busbridge agent binary
//!
//! Runs the Modbus-MQTT and CAN-MQTT bridges against one broker session.
//! Configuration comes from `BUSBRIDGE_*` environment variables, logging is
//! controlled by `RUST_LOG`.

use anyhow::Result;
use busbridge_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting busbridge agent"
    );

    let config = AgentConfig::from_env()?;
    tracing::info!(
        broker = %config.broker.url,
        store = %config.persistence.store_type,
        "Configuration loaded"
    );

    let agent = Agent::new(&config)?;
    agent.run().await?;

    Ok(())
}
