//! A single client connection.
//!
//! Reading happens on a background task that keeps only the most recent
//! complete line; writes are awaited in place by whoever calls
//! [`Connection::send`]. The connection is shared through `Arc` between the
//! registry, its read task, and any transfer it is a target of.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Longest partial line held before the stream is considered malformed.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const DELIMITER: u8 = b'\n';

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-connection behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptions {
    /// Mark the connection closed when a write fails.
    pub close_on_write_error: bool,
}

/// Single-slot mailbox between the read task and the scheduler.
///
/// A newer line replaces an unread older one.
#[derive(Debug, Default)]
pub struct LineSlot {
    line: Mutex<Option<String>>,
}

impl LineSlot {
    /// Store `line`, replacing any unread one.
    pub fn put(&self, line: String) {
        *self.line.lock().unwrap_or_else(PoisonError::into_inner) = Some(line);
    }

    /// Take the pending line, leaving the slot empty.
    pub fn take(&self) -> Option<String> {
        self.line
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Why a read loop stopped.
#[derive(Debug)]
enum ReadEnd {
    Eof,
    Cancelled,
    Error(io::Error),
}

/// A client socket shared between its read task and the scheduler.
pub struct Connection {
    peer: SocketAddr,
    last_line: LineSlot,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    open: AtomicBool,
    closed: Notify,
    options: ConnectionOptions,
}

impl Connection {
    /// Create an open connection around a write half.
    ///
    /// Nothing is read until [`Connection::start_reading`] is called.
    pub fn new(
        peer: SocketAddr,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            last_line: LineSlot::default(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            open: AtomicBool::new(true),
            closed: Notify::new(),
            options,
        })
    }

    /// Wrap an accepted socket and start reading from it.
    pub fn spawn(stream: TcpStream, peer: SocketAddr, options: ConnectionOptions) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let conn = Self::new(peer, writer, options);
        conn.start_reading(reader);
        conn
    }

    /// Run the read loop on its own task.
    pub fn start_reading<R>(self: &Arc<Self>, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.read_loop(reader).await })
    }

    /// Read delimiter-terminated lines until EOF, error, or [`Connection::close`].
    ///
    /// Every complete line overwrites the mailbox; a trailing partial line is
    /// only ever held in the local buffer. Any exit is terminal: the
    /// connection is marked closed and its write half shut down.
    pub async fn read_loop<R: AsyncRead + Unpin>(&self, mut reader: R) {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        // bytes before this offset are known to hold no delimiter
        let mut scanned = 0;

        let end = loop {
            while let Some(pos) = buffer[scanned..].iter().position(|&b| b == DELIMITER) {
                let line = buffer.split_to(scanned + pos + 1);
                scanned = 0;
                let line = String::from_utf8_lossy(&line).into_owned();
                debug!(peer = %self.peer, line = line.trim_end(), "Received");
                self.last_line.put(line);
            }
            scanned = buffer.len();

            if buffer.len() > MAX_LINE_LENGTH {
                break ReadEnd::Error(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds maximum length",
                ));
            }

            if !self.is_open() {
                break ReadEnd::Cancelled;
            }

            let result = tokio::select! {
                result = reader.read_buf(&mut buffer) => result,
                _ = self.closed.notified() => break ReadEnd::Cancelled,
            };

            match result {
                Ok(0) => break ReadEnd::Eof,
                Ok(n) => trace!(peer = %self.peer, bytes = n, "Read"),
                Err(e) => break ReadEnd::Error(e),
            }
        };

        match end {
            ReadEnd::Eof => debug!(peer = %self.peer, "Connection closed by peer"),
            ReadEnd::Cancelled => debug!(peer = %self.peer, "Read loop cancelled"),
            ReadEnd::Error(e) => warn!(peer = %self.peer, error = %e, "Error reading from socket"),
        }

        self.shutdown().await;
    }

    /// Return the latest complete line, at most once.
    pub fn consume_line(&self) -> Option<String> {
        self.last_line.take()
    }

    /// Write all of `bytes`, returning how many were written.
    ///
    /// Returns 0 without writing when the connection is closed, and 0 after
    /// logging when the write fails. A failed write only closes the
    /// connection when `close_on_write_error` is set.
    pub async fn send(&self, bytes: &[u8]) -> usize {
        if !self.is_open() {
            return 0;
        }

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return 0;
        };

        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;

        match result {
            Ok(()) => bytes.len(),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Error writing to socket");
                if self.options.close_on_write_error {
                    self.open.store(false, Ordering::SeqCst);
                    writer.take();
                    self.closed.notify_one();
                }
                0
            }
        }
    }

    /// Ask the read loop to stop; the connection reports closed immediately.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.notify_one();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(peer = %self.peer, error = %e, "Shutdown after close");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
