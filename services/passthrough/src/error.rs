//! Error types for the passthrough data path.
//!
//! Every error here is connection-local: it is logged and resolved by
//! closing the affected connection, never by answering the client.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure to extract an SNI hostname from a buffered ClientHello record.
///
/// None of these are fatal to the connection; the orchestrator treats them
/// as "no hostname" and falls through to the default backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SniError {
    /// Record content type is not handshake (0x16).
    #[error("not a TLS handshake record (content type 0x{0:02x})")]
    NotAHandshake(u8),

    /// ClientHello ends right after the compression methods.
    #[error("ClientHello carries no extensions")]
    NoExtensions,

    /// Extension block has no server_name entry with a host_name.
    #[error("ClientHello has no server_name extension")]
    NoServerNameExtension,

    /// A length field points past the end of the buffered record.
    #[error("ClientHello truncated while reading {0}")]
    Truncated(&'static str),

    /// The host_name bytes are not valid UTF-8.
    #[error("server name is not valid UTF-8")]
    InvalidHostname,
}

/// Malformed inbound PROXY protocol header.
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("PROXY v1 header is not terminated by CRLF within {0} bytes")]
    Unterminated(usize),

    #[error("malformed PROXY v1 header: {0}")]
    MalformedV1(String),

    #[error("malformed PROXY v2 header: {0}")]
    MalformedV2(&'static str),

    #[error("timed out after {0:?} waiting for PROXY header")]
    Timeout(Duration),

    #[error("I/O error reading PROXY header: {0}")]
    Io(#[from] io::Error),
}

/// Terminal failure while handling one passthrough connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Fewer than 5 bytes arrived before the stream closed or errored.
    #[error("incomplete TLS record header: {0}")]
    IncompleteHeader(#[source] io::Error),

    /// The stream ended before the (clamped) record body was read.
    #[error("incomplete TLS record body, expected {expected} bytes: {source}")]
    IncompleteBody {
        expected: usize,
        #[source]
        source: io::Error,
    },

    /// Header and body did not arrive within the handshake deadline.
    #[error("timed out after {0:?} waiting for ClientHello")]
    HandshakeTimeout(Duration),

    /// No target matched and no default backend is configured.
    #[error("no backend for hostname {hostname:?}")]
    NoBackend { hostname: Option<String> },

    /// Dialing the backend failed.
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing the backend did not finish within the dial deadline.
    #[error("timed out after {timeout:?} connecting to backend {addr}")]
    DialTimeout { addr: String, timeout: Duration },

    /// Writing the PROXY header or the buffered handshake failed.
    #[error("failed to write {stage} to backend: {source}")]
    Write {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    /// Inbound PROXY header from the upstream load balancer was invalid.
    #[error(transparent)]
    ProxyHeader(#[from] ProxyHeaderError),
}
