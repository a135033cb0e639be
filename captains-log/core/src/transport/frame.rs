//! Frame Protocol
//!
//! Wire format for every message between a producer and a viewer:
//! length-prefixed JSON over a raw byte stream.
//!
//! # Frame Format
//!
//! ```text
//! +--------------------------------+------------------------------------------+
//! | Length (8)                     | JSON Payload (variable)                  |
//! | big-endian u64                 | LogViewer, ApplicationRun, LastItemId,   |
//! |                                | LogItem                                  |
//! +--------------------------------+------------------------------------------+
//! ```
//!
//! The Length field contains the size of the JSON payload only.
//!
//! # Security
//!
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - Length field is validated before the payload is buffered

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::TransportError;

/// Maximum frame payload size (16 MB)
///
/// Captured request bodies are the largest payloads; anything beyond this is
/// treated as a corrupted or hostile stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 8 bytes length
pub const HEADER_SIZE: usize = 8;

/// Bytes requested from the stream per read
const READ_CHUNK: usize = 8192;

/// Encode a message to a length-prefixed frame
///
/// # Errors
///
/// Returns `TransportError::SerializationError` if JSON serialization fails,
/// or `TransportError::FrameTooLarge` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: json.len() as u64,
            max: MAX_FRAME_SIZE,
        });
    }

    let len = json.len() as u64;
    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the frame is oversized or its payload is not valid
    ///
    /// A payload that fails to deserialize is still consumed, so the decoder
    /// stays aligned on frame boundaries.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; HEADER_SIZE];
        len_bytes.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + HEADER_SIZE]);
        let announced = u64::from_be_bytes(len_bytes);

        if announced > MAX_FRAME_SIZE as u64 {
            return Err(TransportError::FrameTooLarge {
                size: announced,
                max: MAX_FRAME_SIZE,
            });
        }
        let len = announced as usize;

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let result = serde_json::from_slice::<T>(&self.buffer[payload_start..payload_end]);

        self.read_pos = payload_end;

        result
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}

async fn read_frame<R, T>(io: &mut R, decoder: &mut FrameDecoder) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(msg) = decoder.decode()? {
            return Ok(msg);
        }

        let n = io.read(&mut chunk).await?;
        if n == 0 {
            if decoder.available() > 0 {
                tracing::debug!(
                    buffered = decoder.available(),
                    "Stream ended inside a frame"
                );
            }
            return Err(TransportError::ConnectionClosed);
        }
        decoder.push(&chunk[..n]);
    }
}

async fn write_frame<W>(io: &mut W, written: &mut usize, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if *written > frame.len() {
        return Err(TransportError::InvalidState(format!(
            "resumed write of a {} byte frame after {} bytes were already sent",
            frame.len(),
            written
        )));
    }

    while *written < frame.len() {
        let n = io.write(&frame[*written..]).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        *written += n;
    }
    io.flush().await?;
    *written = 0;
    Ok(())
}

/// Read half of a framed stream
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(),
        }
    }

    /// Wait for and decode the next message
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        read_frame(&mut self.io, &mut self.decoder).await
    }
}

/// Write half of a framed stream
///
/// Tracks how much of the current frame reached the stream, so a write that
/// failed or was cancelled part-way can be resumed with the same frame
/// without corrupting the framing.
#[derive(Debug)]
pub struct FrameWriter<W> {
    io: W,
    written: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io, written: 0 }
    }

    /// Encode and write one message
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let frame = encode(msg)?;
        self.send_frame(&frame).await
    }

    /// Write an already encoded frame
    ///
    /// After an error, the next call must pass the same frame again.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.io, &mut self.written, frame).await
    }

    /// True while a frame has been partially written
    #[must_use]
    pub fn is_mid_frame(&self) -> bool {
        self.written > 0
    }

    /// Shut down the write direction of the stream
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Bidirectional framed stream used for the handshake
///
/// After the handshake it is split into a [`FrameReader`] and a
/// [`FrameWriter`] owned by separate tasks.
#[derive(Debug)]
pub struct FramedStream<S> {
    io: S,
    decoder: FrameDecoder,
    written: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(),
            written: 0,
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let frame = encode(msg)?;
        write_frame(&mut self.io, &mut self.written, &frame).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        read_frame(&mut self.io, &mut self.decoder).await
    }

    /// Split into independently owned halves, keeping any buffered input
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(self.io);
        (
            FrameReader {
                io: read_half,
                decoder: self.decoder,
            },
            FrameWriter {
                io: write_half,
                written: self.written,
            },
        )
    }
}
