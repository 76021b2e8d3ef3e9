//! echomux-client: RTT benchmark client.
//!
//! Exchanges framed messages with a running echomux server and reports
//! per-exchange and mean round-trip times.

use echomux::bench;
use echomux::config::ClientConfig;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("echomux-client: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    bench::run(&config)?;
    Ok(())
}
