//! Wire framing for the agent protocol.
//!
//! ```text
//! offset 0..1  magic (2 bytes)
//! offset 2..4  body length, 3 bytes big-endian
//! offset 5..   zlib-deflated UTF-8 JSON body, exactly `length` bytes
//! [trailer]    optional fixed-width checksum, never validated
//! ```

use arrayvec::ArrayVec;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use static_assertions::const_assert_eq;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CodecConfig, MAX_WIRE_BODY_LEN};

pub const MAGIC_LEN: usize = 2;
pub const LENGTH_FIELD_LEN: usize = 3;
pub const HEADER_LEN: usize = MAGIC_LEN + LENGTH_FIELD_LEN;
/// Bytes that must be buffered before a header is inspected.
pub const MIN_PROBE_LEN: usize = HEADER_LEN + 1;
pub const MAX_TRAILER_LEN: usize = 8;

const_assert_eq!(HEADER_LEN, 5);
const_assert_eq!(MAX_WIRE_BODY_LEN, (1 << (8 * LENGTH_FIELD_LEN)) - 1);

pub type FrameHeader = ArrayVec<u8, HEADER_LEN>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to compress body: {0}")]
    Compress(std::io::Error),
    #[error("compressed body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: usize, max: usize },
    #[error("failed to inflate body: {0}")]
    Inflate(std::io::Error),
    #[error("inflated body exceeds limit of {max} bytes")]
    InflatedTooLarge { max: usize },
    #[error("malformed JSON body: {0}")]
    Json(serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct FrameEncoder {
    magic: [u8; MAGIC_LEN],
    trailer_len: usize,
    max_body_len: usize,
    level: Compression,
}

impl FrameEncoder {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            magic: config.magic,
            trailer_len: config.trailer_len.min(MAX_TRAILER_LEN),
            max_body_len: config.max_body_len.min(MAX_WIRE_BODY_LEN),
            level: Compression::new(config.compression_level),
        }
    }

    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(message).map_err(CodecError::Serialize)?;
        self.encode_json(&json)
    }

    /// Frame an already serialized JSON document.
    pub fn encode_json(&self, json: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2 + 16), self.level);
        encoder.write_all(json).map_err(CodecError::Compress)?;
        let body = encoder.finish().map_err(CodecError::Compress)?;

        if body.len() > self.max_body_len {
            return Err(CodecError::BodyTooLarge {
                len: body.len(),
                max: self.max_body_len,
            });
        }

        let header = self.header(body.len());
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + self.trailer_len);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&body);
        if self.trailer_len > 0 {
            frame.extend_from_slice(&checksum(&body, self.trailer_len));
        }
        Ok(frame)
    }

    fn header(&self, body_len: usize) -> FrameHeader {
        let mut header = FrameHeader::new();
        header.extend(self.magic);
        let len_bytes = (body_len as u32).to_be_bytes();
        header.extend(len_bytes[1..].iter().copied());
        header
    }
}

/// Big-endian wrapping byte sum of the body, truncated to `width` bytes.
pub fn checksum(body: &[u8], width: usize) -> ArrayVec<u8, MAX_TRAILER_LEN> {
    let sum = body
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b)));
    let bytes = sum.to_be_bytes();
    let width = width.min(MAX_TRAILER_LEN);
    bytes[MAX_TRAILER_LEN - width..].iter().copied().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub bytes_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub headers_rejected: u64,
    pub bytes_discarded: u64,
}

/// Incremental decoder owning one link's receive buffer.
///
/// `expected_len == 0` means a header is awaited. Once a header is accepted the
/// length is trusted until that many body bytes (plus trailer) have arrived.
#[derive(Debug)]
pub struct FrameDecoder {
    magic: [u8; MAGIC_LEN],
    trailer_len: usize,
    max_body_len: usize,
    max_inflated_len: usize,
    buffer: Vec<u8>,
    expected_len: usize,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            magic: config.magic,
            trailer_len: config.trailer_len.min(MAX_TRAILER_LEN),
            max_body_len: config.max_body_len.min(MAX_WIRE_BODY_LEN),
            max_inflated_len: config.max_inflated_len,
            buffer: Vec::new(),
            expected_len: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Append a chunk and decode every frame it completes, in arrival order.
    ///
    /// A failed body yields an `Err` entry for that frame only; decoding carries
    /// on with the next header.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Value, CodecError>> {
        self.stats.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.expected_len == 0 && !self.lock_header() {
                break;
            }

            let needed = self.expected_len + self.trailer_len;
            if self.buffer.len() < needed {
                break;
            }

            let result = decode_body(&self.buffer[..self.expected_len], self.max_inflated_len);
            self.buffer.drain(..needed);
            self.expected_len = 0;

            match &result {
                Ok(_) => self.stats.frames_decoded += 1,
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    debug!(error = %e, "frame body rejected");
                }
            }
            frames.push(result);
        }
        frames
    }

    /// Try to accept a header at the front of the buffer, resynchronising past
    /// anything that is not one.
    fn lock_header(&mut self) -> bool {
        loop {
            if self.buffer.len() < MIN_PROBE_LEN {
                return false;
            }

            if self.buffer[..MAGIC_LEN] != self.magic {
                let skip = self.next_magic_offset();
                warn!(skipped = skip, "unrecognized frame header, resynchronising");
                self.discard(skip);
                continue;
            }

            let len = read_length(&self.buffer[MAGIC_LEN..HEADER_LEN]);
            if len == 0 || len > self.max_body_len {
                warn!(length = len, max = self.max_body_len, "frame length rejected");
                self.stats.headers_rejected += 1;
                self.discard(MAGIC_LEN);
                continue;
            }

            self.buffer.drain(..HEADER_LEN);
            self.expected_len = len;
            return true;
        }
    }

    fn next_magic_offset(&self) -> usize {
        self.buffer[1..]
            .iter()
            .position(|&b| b == self.magic[0])
            .map_or(self.buffer.len(), |pos| pos + 1)
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.stats.bytes_discarded += count as u64;
    }

    /// Forget any partial frame, e.g. after the transport reconnects.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

fn read_length(field: &[u8]) -> usize {
    field
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
}

fn decode_body(body: &[u8], max_inflated_len: usize) -> Result<Value, CodecError> {
    let mut json = Vec::with_capacity(body.len().saturating_mul(4).min(max_inflated_len));
    let limit = u64::try_from(max_inflated_len).unwrap_or(u64::MAX).saturating_add(1);
    ZlibDecoder::new(body)
        .take(limit)
        .read_to_end(&mut json)
        .map_err(CodecError::Inflate)?;
    if json.len() > max_inflated_len {
        return Err(CodecError::InflatedTooLarge {
            max: max_inflated_len,
        });
    }
    serde_json::from_slice(&json).map_err(CodecError::Json)
}
