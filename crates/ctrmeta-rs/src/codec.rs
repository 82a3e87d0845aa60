//! Decoders for the value encodings found inside metadata buckets.
//!
//! containerd writes a handful of primitive encodings into bucket values:
//!
//! - timestamps as Go `time.Time.MarshalBinary` output (15 or 16 bytes)
//! - sizes as Go signed varints (zig-zag LEB128)
//! - snapshot sequence IDs as fixed-width big-endian integers or unsigned
//!   varints, depending on the writer
//! - opaque typed payloads as a protobuf `google.protobuf.Any`
//!
//! None of these decoders allocate beyond the returned value, and none of
//! them panic on malformed input.

use chrono::{DateTime, Utc};
use prost::Message;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const GO_UNIX_TO_INTERNAL: i64 = 62_135_596_800;

const TIME_BINARY_V1: u8 = 1;
const TIME_BINARY_V2: u8 = 2;
const TIME_BINARY_V1_LEN: usize = 15;
const TIME_BINARY_V2_LEN: usize = 16;

const MAX_VARINT_LEN64: usize = 10;

/// Width of an encoded snapshot sequence ID.
pub const SEQUENCE_ID_LEN: usize = 8;

/// Errors from decoding a single value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The value is shorter or longer than its fixed width.
    #[error("truncated value: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Unknown time encoding version byte.
    #[error("unsupported time encoding version {0}")]
    UnsupportedTimeVersion(u8),

    /// Timestamp outside the representable range.
    #[error("timestamp out of range")]
    TimeOutOfRange,

    /// Varint is empty, unterminated or overflows 64 bits.
    #[error("malformed varint")]
    Varint,

    /// Protobuf envelope could not be decoded.
    #[error("malformed protobuf payload: {0}")]
    Protobuf(String),
}

/// Decode a Go binary-marshalled timestamp.
///
/// Returns `Ok(None)` for Go's zero time, which containerd never writes
/// on purpose.
pub fn decode_time(raw: &[u8]) -> Result<Option<DateTime<Utc>>, CodecError> {
    let expected = match raw.first() {
        Some(&TIME_BINARY_V1) => TIME_BINARY_V1_LEN,
        Some(&TIME_BINARY_V2) => TIME_BINARY_V2_LEN,
        Some(&v) => return Err(CodecError::UnsupportedTimeVersion(v)),
        None => {
            return Err(CodecError::Truncated {
                expected: TIME_BINARY_V1_LEN,
                actual: 0,
            })
        }
    };
    if raw.len() != expected {
        return Err(CodecError::Truncated {
            expected,
            actual: raw.len(),
        });
    }

    let sec = i64::from_be_bytes(fixed::<8>(&raw[1..9])?);
    let nsec = i32::from_be_bytes(fixed::<4>(&raw[9..13])?);
    // Bytes 13.. carry the zone offset, which does not change the instant.
    if sec == 0 && nsec == 0 {
        return Ok(None);
    }
    let nsec = u32::try_from(nsec).map_err(|_| CodecError::TimeOutOfRange)?;
    let unix = sec
        .checked_sub(GO_UNIX_TO_INTERNAL)
        .ok_or(CodecError::TimeOutOfRange)?;
    DateTime::from_timestamp(unix, nsec)
        .map(Some)
        .ok_or(CodecError::TimeOutOfRange)
}

/// Decode an unsigned LEB128 varint occupying the whole slice.
pub fn decode_uvarint(raw: &[u8]) -> Result<u64, CodecError> {
    let (value, used) = read_uvarint(raw)?;
    if used != raw.len() {
        return Err(CodecError::Varint);
    }
    Ok(value)
}

/// Decode a Go signed (zig-zag) varint occupying the whole slice.
pub fn decode_varint(raw: &[u8]) -> Result<i64, CodecError> {
    let ux = decode_uvarint(raw)?;
    let x = (ux >> 1) as i64;
    Ok(if ux & 1 != 0 { !x } else { x })
}

/// Decode a fixed-width 8-byte big-endian unsigned integer.
pub fn decode_u64_be(raw: &[u8]) -> Result<u64, CodecError> {
    Ok(u64::from_be_bytes(fixed::<SEQUENCE_ID_LEN>(raw)?))
}

/// Decode a protobuf `Any` envelope.
pub fn decode_any(raw: &[u8]) -> Result<prost_types::Any, CodecError> {
    prost_types::Any::decode(raw).map_err(|e| CodecError::Protobuf(e.to_string()))
}

fn read_uvarint(raw: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in raw.iter().enumerate() {
        if i == MAX_VARINT_LEN64 {
            return Err(CodecError::Varint);
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                return Err(CodecError::Varint);
            }
            return Ok((value | u64::from(b) << shift, i + 1));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(CodecError::Varint)
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N], CodecError> {
    raw.try_into().map_err(|_| CodecError::Truncated {
        expected: N,
        actual: raw.len(),
    })
}
