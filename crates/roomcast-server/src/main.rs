//! # roomcast server
//!
//! Real-time chat rooms over HTTP and server-sent events.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Run with a specific config file only
//! roomcast --config /path/to/roomcast.toml
//!
//! # Override settings from the environment
//! ROOMCAST_PORT=8080 ROOMCAST_AUTH__SECRET=change-me roomcast
//!
//! # Share rooms between processes through Redis
//! ROOMCAST_TRANSPORT__KIND=redis roomcast
//! ```

mod config;
mod credentials;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match config_path() {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    if config.auth.secret == config::DEV_SECRET {
        tracing::warn!("Using the built-in development session secret; set ROOMCAST_AUTH__SECRET");
    }

    tracing::info!(
        transport = ?config.transport.kind,
        "Starting roomcast on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}
