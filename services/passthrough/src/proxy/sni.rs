//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! Parses the buffered first record of a connection (header included) and
//! returns the host_name from the server_name extension. Every field access
//! goes through [`Cursor`], which checks the remaining length first, so the
//! parser is total over arbitrary input.
//!
//! ClientHello layout after the 5-byte record header:
//! - byte 0: handshake type
//! - bytes 1-3: handshake length
//! - bytes 4-5: client version
//! - bytes 6-37: random (32 bytes)
//! - 1 byte: session ID length, then session ID
//! - 2 bytes: cipher suites length, then cipher suites
//! - 1 byte: compression methods length, then compression methods
//! - 2 bytes: extensions length, then extensions
//!
//! Reference: RFC 8446 section 4.1.2, RFC 6066 section 3.

use crate::error::SniError;

use super::record::{CONTENT_TYPE_HANDSHAKE, RECORD_HEADER_LEN};

/// Handshake type (1) + length (3) + client version (2) + random (32).
const HANDSHAKE_PREAMBLE_LEN: usize = 38;

/// Extension type for server_name.
const EXT_SERVER_NAME: u16 = 0x0000;

/// Server name type for host_name.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Bounds-checked reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], SniError> {
        if n > self.buf.len() {
            return Err(SniError::Truncated(field));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize, field: &'static str) -> Result<(), SniError> {
        self.take(n, field).map(|_| ())
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, SniError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u8 length prefix and return that many bytes.
    fn read_vec8(&mut self, field: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.read_u8(field)? as usize;
        self.take(len, field)
    }

    /// Read a u16 length prefix and return that many bytes.
    fn read_vec16(&mut self, field: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.read_u16(field)? as usize;
        self.take(len, field)
    }
}

/// Extract the SNI hostname from a buffered TLS record (header + body).
///
/// The hostname is returned exactly as sent; no case folding or trailing
/// dot trimming is applied.
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(record);

    let content_type = cursor.read_u8("record header")?;
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotAHandshake(content_type));
    }
    cursor.skip(RECORD_HEADER_LEN - 1, "record header")?;
    cursor.skip(HANDSHAKE_PREAMBLE_LEN, "handshake preamble")?;

    cursor.read_vec8("session id")?;
    cursor.read_vec16("cipher suites")?;
    cursor.read_vec8("compression methods")?;

    if cursor.is_empty() {
        return Err(SniError::NoExtensions);
    }

    let mut extensions = Cursor::new(cursor.read_vec16("extensions")?);
    while !extensions.is_empty() {
        let ext_type = extensions.read_u16("extension type")?;
        let ext_data = extensions.read_vec16("extension data")?;

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_extension(ext_data);
        }
    }

    Err(SniError::NoServerNameExtension)
}

/// Parse the server_name extension value.
///
/// - 2 bytes: server name list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name_extension(data: &[u8]) -> Result<String, SniError> {
    let mut ext = Cursor::new(data);
    let mut list = Cursor::new(ext.read_vec16("server name list")?);

    while !list.is_empty() {
        let name_type = list.read_u8("server name type")?;
        let name = list.read_vec16("server name")?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(str::to_string)
                .map_err(|_| SniError::InvalidHostname);
        }
    }

    Err(SniError::NoServerNameExtension)
}
