//! Networking runtime.
//!
//! - `Connection`: one socket, a background line reader and awaited writes
//! - `ConnectionRegistry`: the live set, fed by the accept loop over a channel
//! - `listener`: socket setup and the accept loop
//!
//! Accept and read loops run as tokio tasks. The transfer scheduler runs as
//! its own timer-driven loop and is the sole owner of the registry.

mod connection;
mod listener;
mod registry;

pub(crate) use connection::{Connection, ConnectionOptions};
pub(crate) use listener::AcceptOptions;
pub(crate) use registry::ConnectionRegistry;

use crate::config::Config;
use crate::payload::Payload;
use crate::scheduler::{TransferScheduler, TransferSettings};
use std::io;
use std::net::SocketAddr;
use tracing::info;

impl From<&Config> for AcceptOptions {
    fn from(config: &Config) -> Self {
        Self {
            nodelay: config.nodelay,
            connection: ConnectionOptions {
                close_on_write_error: config.close_on_write_error,
            },
        }
    }
}

/// Build the tokio runtime and serve `payload` until interrupted.
pub fn run(config: Config, payload: Payload) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("trickle-io")
        .enable_all()
        .build()?;

    runtime.block_on(serve(config, payload))
}

/// Bind, start accepting, and drive the scheduler until Ctrl-C.
pub async fn serve(config: Config, payload: Payload) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = listener::bind(addr)?;
    info!(address = %listener.local_addr()?, "Server listening");

    let (registry, admissions) = ConnectionRegistry::new(config.max_connections);
    tokio::spawn(listener::accept_loop(
        listener,
        admissions,
        AcceptOptions::from(&config),
    ));

    let scheduler = TransferScheduler::new(registry, payload, TransferSettings::from(&config));

    tokio::select! {
        _ = scheduler.run(config.pacing) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }

    Ok(())
}

/// Start an accept loop and scheduler on an ephemeral loopback port.
#[cfg(test)]
pub(crate) async fn spawn_test_server(payload: Payload, pacing: std::time::Duration) -> SocketAddr {
    let listener = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let (registry, admissions) = ConnectionRegistry::new(16);
    tokio::spawn(listener::accept_loop(
        listener,
        admissions,
        AcceptOptions::default(),
    ));
    let scheduler = TransferScheduler::new(registry, payload, TransferSettings::default());
    tokio::spawn(scheduler.run(pacing));
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Codec;
    use crate::scheduler::RetriggerPolicy;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn config(listen: &str) -> Config {
        Config {
            listen: listen.to_string(),
            workers: 1,
            max_connections: 16,
            nodelay: true,
            close_on_write_error: false,
            input: "unused".into(),
            codec: Codec::Gzip,
            level: 6,
            packet_size: 750,
            pacing: Duration::from_millis(100),
            trigger: "start".to_string(),
            retrigger: RetriggerPolicy::Ignore,
            announce: None,
            log_level: "info".to_string(),
        }
    }

    #[tokio::test]
    async fn test_two_clients_only_requester_is_served() {
        let raw: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
        let addr = spawn_test_server(Payload::new(raw.clone()), Duration::from_millis(10)).await;

        let mut chatty = TcpStream::connect(addr).await.unwrap();
        let mut requester = TcpStream::connect(addr).await.unwrap();
        chatty.write_all(b"hello\n").await.unwrap();
        requester.write_all(b"start\n").await.unwrap();

        let mut received = vec![0u8; raw.len()];
        tokio::time::timeout(Duration::from_secs(5), requester.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, raw);

        let mut buf = [0u8; 16];
        let idle = tokio::time::timeout(Duration::from_millis(200), chatty.read(&mut buf)).await;
        assert!(idle.is_err(), "non-requesting client received data");
    }

    #[tokio::test]
    async fn test_serve_rejects_bad_address() {
        let err = serve(config("not an address"), Payload::new(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_accept_options_from_config() {
        let mut config = config("127.0.0.1:0");
        config.nodelay = false;
        config.close_on_write_error = true;

        let options = AcceptOptions::from(&config);
        assert!(!options.nodelay);
        assert!(options.connection.close_on_write_error);
    }
}
