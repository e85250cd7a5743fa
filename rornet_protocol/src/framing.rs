// RoRnet frame codec over TCP.
//
// Wire format: a 16-byte header of four little-endian 32-bit fields
// (command:u32, source:i32, stream_id:i32, length:u32) followed by exactly
// `length` payload bytes. Zero-length payloads are legal.
//
// Writing is a single `write_all` of header+payload so that concurrent
// writers serialized by a lock can never interleave partial frames.
//
// Reading goes through `FrameReader`, which owns a reassembly buffer. Each
// socket read (of whatever size the transport delivers) is appended to the
// buffer and complete frames are sliced off the front. That handles both
// directions of the chunking problem: a frame split across many 1-byte
// reads, and several frames arriving in one read. A read that times out
// returns `ReadOutcome::Timeout` and leaves the partial bytes buffered for
// the next call, so a read timeout never tears a frame. A 0-byte read is the
// peer closing the connection.
//
// `MAX_MESSAGE_LENGTH` (32 KB, header included) protects against unbounded
// allocation from a corrupt length field. Stream registrations (8144 bytes)
// and server settings (4373 bytes) are the largest fixed payloads.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{ProtocolError, Result};
use crate::message::{Frame, MessageType};
use crate::types::{StreamId, UserId};

pub const HEADER_SIZE: usize = 16;

/// Maximum size of one frame on the wire, header included.
pub const MAX_MESSAGE_LENGTH: usize = 32768;

pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_LENGTH - HEADER_SIZE;

const READ_CHUNK: usize = 4096;

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub command: MessageType,
    pub source: UserId,
    pub stream_id: StreamId,
    pub length: u32,
}

impl Header {
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let field = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        Self {
            command: MessageType::from_wire(u32::from_le_bytes(field(0))),
            source: UserId(i32::from_le_bytes(field(4))),
            stream_id: StreamId(i32::from_le_bytes(field(8))),
            length: u32::from_le_bytes(field(12)),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.command.to_wire().to_le_bytes());
        out[4..8].copy_from_slice(&self.source.0.to_le_bytes());
        out[8..12].copy_from_slice(&self.stream_id.0.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Encode a frame into header + payload bytes.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let len = frame.payload.len();
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let header = Header {
        command: frame.command,
        source: frame.source,
        stream_id: frame.stream_id,
        length: u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        })?,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + len);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Encode and write one frame, then flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = encode(frame)?;
    write_encoded(writer, &bytes)
}

/// Write bytes produced by `encode`. Used by fan-out, which encodes once.
pub fn write_encoded<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

/// Decode one frame from the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, or the frame and the number
/// of bytes it occupied.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some(header_bytes) = bytes.first_chunk::<HEADER_SIZE>() else {
        return Ok(None);
    };
    let header = Header::from_bytes(header_bytes);
    let len = header.length as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let total = HEADER_SIZE + len;
    if bytes.len() < total {
        return Ok(None);
    }
    let frame = Frame::new(
        header.command,
        header.source,
        header.stream_id,
        bytes[HEADER_SIZE..total].to_vec(),
    );
    Ok(Some((frame, total)))
}

/// Result of one attempt to read a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The transport's read timeout elapsed. Partial bytes stay buffered.
    Timeout,
    /// The peer closed the connection.
    Closed,
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    chunk: Box<[u8]>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Return the next complete frame, reading from the transport only when
    /// the buffer does not already hold one.
    pub fn next_frame(&mut self) -> Result<ReadOutcome> {
        loop {
            if let Some((mut frame, used)) = decode_frame(&self.buffer)? {
                self.buffer.drain(..used);
                frame.received_at = Some(Instant::now());
                return Ok(ReadOutcome::Frame(frame));
            }
            match self.inner.read(&mut self.chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.buffer.extend_from_slice(&self.chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(ReadOutcome::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Keep reading through transport timeouts until a frame arrives, the
    /// peer closes, or `timeout` has elapsed.
    pub fn next_frame_timeout(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame()? {
                ReadOutcome::Timeout if Instant::now() < deadline => {}
                outcome => return Ok(outcome),
            }
        }
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
