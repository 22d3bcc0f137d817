//! trickle: paced delivery of a compressed payload over TCP
//!
//! The server accepts any number of line-oriented TCP clients. A client that
//! sends the trigger line (`start` by default) receives the compressed
//! payload as a raw byte stream, cut into fixed-size packets sent one per
//! tick.
//!
//! Features:
//! - gzip, bzip2 and xz payload compression
//! - Configurable packet size, pacing and trigger line
//! - Completeness accounting for every transfer
//! - `fetch` subcommand that requests and decompresses the payload
//! - Configuration via CLI arguments or TOML file

mod client;
mod compress;
mod config;
mod payload;
mod runtime;
mod scheduler;

use config::{Config, FetchConfig, Invocation};
use payload::Payload;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let invocation = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(invocation.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match invocation {
        Invocation::Serve(config) => serve(config),
        Invocation::Fetch(config) => fetch(config),
    }
}

fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        input = %config.input.display(),
        codec = ?config.codec,
        packet_size = config.packet_size,
        pacing_ms = config.pacing.as_millis() as u64,
        trigger = %config.trigger,
        retrigger = ?config.retrigger,
        "Starting trickle server"
    );

    let compressor = config.codec.compressor(config.level);
    let payload = Payload::load(&config.input, compressor.as_ref())?;
    info!(bytes = payload.expected_size(), "Data size");

    runtime::run(config, payload)?;
    Ok(())
}

fn fetch(config: FetchConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(client::fetch(&config))?;
    info!(
        received = report.received,
        decompressed = report.decompressed,
        output = %config.output.display(),
        "Payload fetched"
    );
    Ok(())
}
