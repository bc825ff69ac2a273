//! Codec for encoding and decoding roomcast records.
//!
//! Topic payloads use MessagePack behind a small versioned header. Client
//! streams use JSON.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::records::Record;

/// Major version written into every topic payload. Payloads with another
/// major version are rejected.
pub const PROTOCOL_MAJOR: u8 = 1;

/// Maximum encoded record size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Header size in bytes: version byte plus length prefix.
pub const HEADER_SIZE: usize = 5;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a record.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// Payload was produced by an incompatible protocol version.
    #[error("Unsupported protocol major version {0}")]
    UnsupportedVersion(u8),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a record for a topic.
///
/// The encoded format is:
/// - 1 byte: protocol major version
/// - 4 bytes: big-endian length prefix
/// - N bytes: MessagePack-encoded record
///
/// # Errors
///
/// Returns an error if the record is too large or encoding fails.
pub fn encode(record: &Record) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(record)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(PROTOCOL_MAJOR);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a record from a topic payload.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, from an
/// incompatible version, or invalid.
pub fn decode(data: &[u8]) -> Result<Record, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    if data[0] != PROTOCOL_MAJOR {
        return Err(ProtocolError::UnsupportedVersion(data[0]));
    }

    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = HEADER_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let record = rmp_serde::from_slice(&data[HEADER_SIZE..total_size])?;
    Ok(record)
}

/// Encode a record as JSON for a client stream.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_json(record: &Record) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(record)?)
}
