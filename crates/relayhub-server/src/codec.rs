//! Length-prefixed message framing for the QUIC transport.
//!
//! Layout on the wire: `[length: u32 big endian] + [payload: length bytes]`.
//!
//! Payloads are opaque to the hub; this module only delimits them on a byte
//! stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Default upper bound on a single message payload (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Payload exceeds the configured maximum.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Encode one message into `dst`.
///
/// # Errors
///
/// - `CodecError::MessageTooLarge` if `payload` exceeds `max` or cannot be
///   described by a `u32` prefix
pub fn encode(payload: &[u8], max: usize, dst: &mut impl BufMut) -> Result<(), CodecError> {
    let too_large = CodecError::MessageTooLarge { size: payload.len(), max };
    if payload.len() > max {
        return Err(too_large);
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large)?;

    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Encode one message into a fresh buffer.
///
/// # Errors
///
/// Same as [`encode`].
pub fn encode_to_bytes(payload: &[u8], max: usize) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode(payload, max, &mut buf)?;
    Ok(buf.freeze())
}

/// Read the payload length from a prefix.
///
/// # Errors
///
/// - `CodecError::MessageTooLarge` if the claimed length exceeds `max`. This
///   is checked before anything is allocated for the payload.
pub fn payload_len(header: [u8; HEADER_SIZE], max: usize) -> Result<usize, CodecError> {
    let size = u32::from_be_bytes(header) as usize;
    if size > max {
        return Err(CodecError::MessageTooLarge { size, max });
    }
    Ok(size)
}
