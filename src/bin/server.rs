//! echomux-server: framed echo server.
//!
//! Accepts many simultaneous connections on a single-threaded,
//! readiness-based event loop and echoes every complete frame back to
//! its originating connection.

use echomux::config::ServerConfig;
use echomux::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("echomux-server: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        "Starting echomux server"
    );

    runtime::run(config)?;
    Ok(())
}
