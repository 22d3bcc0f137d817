//! Listening socket setup and the accept loop.

use crate::runtime::connection::{Connection, ConnectionOptions};
use crate::runtime::registry::Admissions;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

/// Pending connection backlog handed to listen(2).
const BACKLOG: i32 = 1024;

/// Settings applied to every accepted socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptOptions {
    pub nodelay: bool,
    pub connection: ConnectionOptions,
}

/// Bind a non-blocking listener with SO_REUSEADDR.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections forever, handing each to the registry.
///
/// A failed accept is logged and the loop continues. Returns only once the
/// registry side of the channel is gone.
pub async fn accept_loop(listener: TcpListener, admissions: Admissions, options: AcceptOptions) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if options.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                }

                debug!(peer = %peer, "Accepted connection");
                let conn = Connection::spawn(stream, peer, options.connection);
                if admissions.send(conn).is_err() {
                    debug!("Registry dropped, stopping accept loop");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::ConnectionRegistry;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_accepted_connections_reach_registry() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut registry, admissions) = ConnectionRegistry::new(16);
        tokio::spawn(accept_loop(listener, admissions, AcceptOptions::default()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.admit(), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0.as_deref(), Some("hello\n"));

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_accept_loop_stops_without_registry() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (registry, admissions) = ConnectionRegistry::new(16);
        drop(registry);
        let task = tokio::spawn(accept_loop(listener, admissions, AcceptOptions::default()));

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
