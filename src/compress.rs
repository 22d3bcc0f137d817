//! Payload codecs.
//!
//! Each supported format implements [`Compressor`]; [`Codec`] picks one from
//! configuration. Compression runs once at startup on the whole input.
//! Decoding happens as packets arrive, through a [`StreamDecoder`].

use bytes::{Buf, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use std::io::{self, BufRead, Read, Write};
use std::ops::RangeInclusive;

/// Output reserved per decode step.
const DECODE_STEP: usize = 32 * 1024;

/// A pure transform between raw and compressed bytes.
pub trait Compressor: Send + Sync {
    /// Compress `raw` into a complete, self-terminating stream.
    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>>;

    /// Start an incremental decode of one stream.
    fn decoder(&self) -> io::Result<Box<dyn StreamDecoder>>;

    /// Decode a complete stream. Truncated input is an error.
    #[cfg(test)]
    fn decompress(&self, compressed: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = self.decoder()?;
        if !decoder.feed(compressed)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "compressed stream is truncated",
            ));
        }
        Ok(decoder.into_output())
    }
}

/// Incremental decoder fed with consecutive pieces of one compressed stream.
pub trait StreamDecoder: Send {
    /// Decode `chunk`; returns `true` once the end-of-stream marker is reached.
    ///
    /// Bytes past the end of the stream are ignored.
    fn feed(&mut self, chunk: &[u8]) -> io::Result<bool>;

    /// Everything decoded so far.
    fn into_output(self: Box<Self>) -> Vec<u8>;
}

/// Input queue for the `bufread` decoders.
///
/// An empty queue reports `WouldBlock`, which the decoders pass up without
/// losing their state, so decoding resumes when more bytes are pushed.
#[derive(Debug, Default)]
struct PendingInput {
    buf: BytesMut,
}

impl PendingInput {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }
}

impl Read for PendingInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.fill_buf()?.len().min(out.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }
}

impl BufRead for PendingInput {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(&self.buf)
    }

    fn consume(&mut self, amt: usize) {
        self.buf.advance(amt);
    }
}

/// A single-member `bufread` decoder over [`PendingInput`].
///
/// These decoders return `Ok(0)` once their member ends, whatever follows.
struct BufferedStream<D> {
    decoder: D,
    input: fn(&mut D) -> &mut PendingInput,
    out: Vec<u8>,
    done: bool,
}

impl<D: Read> BufferedStream<D> {
    fn new(decoder: D, input: fn(&mut D) -> &mut PendingInput) -> Self {
        Self {
            decoder,
            input,
            out: Vec::new(),
            done: false,
        }
    }

    /// Read until the decoder reports the end of its stream or runs dry.
    fn drain(&mut self) -> io::Result<bool> {
        let mut step = vec![0u8; DECODE_STEP];
        loop {
            match self.decoder.read(&mut step) {
                Ok(0) => return Ok(true),
                Ok(n) => self.out.extend_from_slice(&step[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<D: Read + Send> StreamDecoder for BufferedStream<D> {
    fn feed(&mut self, chunk: &[u8]) -> io::Result<bool> {
        if !self.done {
            (self.input)(&mut self.decoder).push(chunk);
            self.done = self.drain()?;
        }
        Ok(self.done)
    }

    fn into_output(self: Box<Self>) -> Vec<u8> {
        self.out
    }
}

/// Compression format selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Gzip,
    Bzip2,
    Lzma,
}

impl Codec {
    /// Levels accepted by this codec.
    pub fn levels(self) -> RangeInclusive<u32> {
        match self {
            Codec::Gzip => 0..=9,
            Codec::Bzip2 => 1..=9,
            Codec::Lzma => 0..=9,
        }
    }

    /// Build the compressor for this codec at `level`.
    ///
    /// The level is clamped into [`Codec::levels`].
    pub fn compressor(self, level: u32) -> Box<dyn Compressor> {
        let levels = self.levels();
        let level = level.clamp(*levels.start(), *levels.end());
        match self {
            Codec::Gzip => Box::new(Gzip::new(level)),
            Codec::Bzip2 => Box::new(Bzip2::new(level)),
            Codec::Lzma => Box::new(Lzma::new(level)),
        }
    }
}

/// gzip container around deflate.
pub struct Gzip {
    level: flate2::Compression,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level),
        }
    }
}

impl Compressor for Gzip {
    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decoder(&self) -> io::Result<Box<dyn StreamDecoder>> {
        Ok(Box::new(BufferedStream::new(
            flate2::bufread::GzDecoder::new(PendingInput::default()),
            flate2::bufread::GzDecoder::get_mut,
        )))
    }
}

pub struct Bzip2 {
    level: bzip2::Compression,
}

impl Bzip2 {
    pub fn new(level: u32) -> Self {
        Self {
            level: bzip2::Compression::new(level),
        }
    }
}

impl Compressor for Bzip2 {
    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), self.level);
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decoder(&self) -> io::Result<Box<dyn StreamDecoder>> {
        Ok(Box::new(BufferedStream::new(
            bzip2::bufread::BzDecoder::new(PendingInput::default()),
            bzip2::bufread::BzDecoder::get_mut,
        )))
    }
}

/// LZMA2 in the xz container.
pub struct Lzma {
    level: u32,
}

impl Lzma {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Compressor for Lzma {
    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), self.level);
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decoder(&self) -> io::Result<Box<dyn StreamDecoder>> {
        Ok(Box::new(LzmaStream {
            stream: xz2::stream::Stream::new_stream_decoder(u64::MAX, 0)?,
            out: Vec::new(),
            done: false,
        }))
    }
}

/// Drives the raw xz stream directly: the `bufread` wrapper asks for more
/// input after the end marker instead of reporting it.
struct LzmaStream {
    stream: xz2::stream::Stream,
    out: Vec<u8>,
    done: bool,
}

impl StreamDecoder for LzmaStream {
    fn feed(&mut self, chunk: &[u8]) -> io::Result<bool> {
        let mut input = chunk;
        while !self.done {
            self.out.reserve(DECODE_STEP);
            let before = self.stream.total_in();
            let status = self
                .stream
                .process_vec(input, &mut self.out, xz2::stream::Action::Run)?;
            input = &input[(self.stream.total_in() - before) as usize..];

            if status == xz2::stream::Status::StreamEnd {
                self.done = true;
            } else if input.is_empty() && self.out.len() < self.out.capacity() {
                break;
            }
        }
        Ok(self.done)
    }

    fn into_output(self: Box<Self>) -> Vec<u8> {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..20_000u32)
            .flat_map(|i| format!("{i},{},{}\n", i * 3, i % 17).into_bytes())
            .collect()
    }

    #[test]
    fn test_each_codec_restores_input() {
        let raw = sample();
        for codec in [Codec::Gzip, Codec::Bzip2, Codec::Lzma] {
            let compressor = codec.compressor(6);
            let packed = compressor.compress(&raw).unwrap();
            assert!(packed.len() < raw.len(), "{codec:?} did not shrink input");
            assert_eq!(compressor.decompress(&packed).unwrap(), raw);
        }
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let raw = sample();
        for codec in [Codec::Gzip, Codec::Bzip2, Codec::Lzma] {
            let compressor = codec.compressor(6);
            let packed = compressor.compress(&raw).unwrap();
            let cut = &packed[..packed.len() / 2];
            assert!(
                compressor.decompress(cut).is_err(),
                "{codec:?} accepted a truncated stream"
            );
        }
    }

    #[test]
    fn test_stream_decoder_finishes_on_last_packet() {
        let raw = sample();
        for codec in [Codec::Gzip, Codec::Bzip2, Codec::Lzma] {
            let compressor = codec.compressor(6);
            let packed = compressor.compress(&raw).unwrap();
            let packets: Vec<&[u8]> = packed.chunks(750).collect();
            let (last, head) = packets.split_last().unwrap();

            let mut decoder = compressor.decoder().unwrap();
            for packet in head {
                assert!(!decoder.feed(packet).unwrap(), "{codec:?} finished early");
            }
            assert!(decoder.feed(last).unwrap(), "{codec:?} missed the end");
            assert_eq!(decoder.into_output(), raw, "{codec:?}");
        }
    }

    #[test]
    fn test_stream_decoder_ignores_trailing_bytes() {
        let compressor = Codec::Gzip.compressor(6);
        let mut packed = compressor.compress(b"t,x\n0,1\n").unwrap();
        packed.extend_from_slice(b"2026-10-17T00:00:00+00:00\n");

        let mut decoder = compressor.decoder().unwrap();
        assert!(decoder.feed(&packed).unwrap());
        assert!(decoder.feed(b"more").unwrap());
        assert_eq!(decoder.into_output(), b"t,x\n0,1\n");
    }

    #[test]
    fn test_stream_decoder_waits_on_truncated_input() {
        let raw = sample();
        for codec in [Codec::Gzip, Codec::Bzip2, Codec::Lzma] {
            let compressor = codec.compressor(6);
            let packed = compressor.compress(&raw).unwrap();

            let mut decoder = compressor.decoder().unwrap();
            assert!(!decoder.feed(&packed[..packed.len() - 1]).unwrap(), "{codec:?}");
        }
    }

    #[test]
    fn test_stream_decoder_rejects_garbage() {
        let mut decoder = Codec::Bzip2.compressor(6).decoder().unwrap();
        assert!(decoder.feed(b"this is not a bzip2 stream").is_err());
    }

    #[test]
    fn test_empty_input_produces_a_stream() {
        let compressor = Codec::Gzip.compressor(6);
        let packed = compressor.compress(&[]).unwrap();
        assert!(!packed.is_empty());
        assert!(compressor.decompress(&packed).unwrap().is_empty());
    }

    #[test]
    fn test_level_is_clamped() {
        // bzip2 rejects level 0; the clamp keeps construction infallible
        let compressor = Codec::Bzip2.compressor(0);
        let packed = compressor.compress(b"abc").unwrap();
        assert_eq!(compressor.decompress(&packed).unwrap(), b"abc");
    }
}
