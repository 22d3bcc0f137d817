//! `trickle fetch`: request the payload and decompress it.
//!
//! Packets carry no framing, so every read is fed straight into the codec's
//! incremental decoder. The codec's own end-of-stream marker is what tells
//! the client the transfer is done.

use crate::config::FetchConfig;
use bytes::BytesMut;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Level is irrelevant when decoding.
const DECODE_LEVEL: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Compressed bytes received.
    pub received: usize,
    /// Bytes written to the output file.
    pub decompressed: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended after {received} bytes without a complete payload")]
    Incomplete { received: usize },
    #[error("payload stream is corrupt: {0}")]
    Decode(#[source] std::io::Error),
    #[error("failed to write '{}': {}", .0.display(), .1)]
    Write(PathBuf, #[source] std::io::Error),
}

/// Send the trigger, collect the stream, and write the decoded payload.
pub async fn fetch(config: &FetchConfig) -> Result<FetchReport, FetchError> {
    let mut stream = TcpStream::connect(&config.server)
        .await
        .map_err(|e| FetchError::Connect(config.server.clone(), e))?;
    info!(server = %config.server, "Connected");

    stream
        .write_all(format!("{}\n", config.trigger).as_bytes())
        .await?;

    let mut decoder = config
        .codec
        .compressor(DECODE_LEVEL)
        .decoder()
        .map_err(FetchError::Decode)?;
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut received = 0;

    loop {
        buffer.clear();
        let n = match tokio::time::timeout(config.idle_timeout, stream.read_buf(&mut buffer)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Incomplete { received }),
        };
        if n == 0 {
            // peer closed before the end-of-stream marker
            return Err(FetchError::Incomplete { received });
        }

        received += n;
        debug!(bytes = n, total = received, "Received packet");
        if decoder.feed(&buffer).map_err(FetchError::Decode)? {
            break;
        }
    }

    let raw = decoder.into_output();
    tokio::fs::write(&config.output, &raw)
        .await
        .map_err(|e| FetchError::Write(config.output.clone(), e))?;

    Ok(FetchReport {
        received,
        decompressed: raw.len(),
    })
}
