//! BreathSync console
//!
//! Runs a breathing session from the terminal: microphone detection when a
//! device is available, `press`/`release` otherwise.

use breath_sync::{console, Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,breath_sync=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("BreathSync starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Check the values in your .env file");
            std::process::exit(1);
        }
    };

    info!(
        "Configuration loaded: {} (max {} participants, {} input)",
        config.display_name,
        config.max_participants,
        config.sampler.device_class.as_str()
    );

    if let Err(e) = console::run(config).await {
        error!("Console error: {}", e);
        std::process::exit(1);
    }
}
