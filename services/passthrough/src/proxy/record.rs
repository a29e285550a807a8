//! TLS record header reader.
//!
//! Reads the first TLS record of a connection so the ClientHello can be
//! inspected and later forwarded verbatim.
//!
//! Record layout:
//! - byte 0: content type
//! - bytes 1-2: legacy protocol version
//! - bytes 3-4: record length (big-endian)
//! - bytes 5+: fragment
//!
//! A ClientHello must fit in a single record, and a record fragment may not
//! exceed 2^14 bytes (RFC 8446 section 5.1), so the buffer is capped at
//! `RECORD_HEADER_LEN + MAX_RECORD_LEN` no matter what the length field says.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;

/// Length of the TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Maximum TLS record fragment length.
pub const MAX_RECORD_LEN: usize = 16384;

/// Content type of a handshake record.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Parsed TLS record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    /// Length as claimed on the wire, before clamping.
    pub length: u16,
}

impl RecordHeader {
    pub fn parse(bytes: [u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            content_type: bytes[0],
            version: u16::from_be_bytes([bytes[1], bytes[2]]),
            length: u16::from_be_bytes([bytes[3], bytes[4]]),
        }
    }

    /// Number of body bytes that will actually be read.
    pub fn body_len(&self) -> usize {
        (self.length as usize).min(MAX_RECORD_LEN)
    }

    /// Whether the length field claimed more than the record ceiling.
    pub fn is_clamped(&self) -> bool {
        self.length as usize > MAX_RECORD_LEN
    }
}

/// The first record of a connection, header and body, exactly as received.
#[derive(Debug, Clone)]
pub struct InitialRecord {
    pub header: RecordHeader,
    bytes: Vec<u8>,
}

impl InitialRecord {
    /// Header plus body bytes, to be forwarded unmodified.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read the record header and its bounded body.
///
/// A single attempt; there are no retries.
pub async fn read_initial_record<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<InitialRecord, ConnectionError> {
    let mut header_bytes = [0u8; RECORD_HEADER_LEN];
    stream
        .read_exact(&mut header_bytes)
        .await
        .map_err(ConnectionError::IncompleteHeader)?;

    let header = RecordHeader::parse(header_bytes);
    if header.is_clamped() {
        debug!(
            claimed = header.length,
            ceiling = MAX_RECORD_LEN,
            "Record length exceeds ceiling, clamping"
        );
    }

    let body_len = header.body_len();
    let mut bytes = vec![0u8; RECORD_HEADER_LEN + body_len];
    bytes[..RECORD_HEADER_LEN].copy_from_slice(&header_bytes);

    stream
        .read_exact(&mut bytes[RECORD_HEADER_LEN..])
        .await
        .map_err(|source| ConnectionError::IncompleteBody {
            expected: body_len,
            source,
        })?;

    Ok(InitialRecord { header, bytes })
}

/// Same as [`read_initial_record`], bounded by a deadline covering both
/// the header and the body.
pub async fn read_initial_record_with_timeout<R: AsyncRead + Unpin>(
    stream: &mut R,
    deadline: Duration,
) -> Result<InitialRecord, ConnectionError> {
    match timeout(deadline, read_initial_record(stream)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::HandshakeTimeout(deadline)),
    }
}
