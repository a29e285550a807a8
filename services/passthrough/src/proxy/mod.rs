//! L4 TLS passthrough proxy.
//!
//! This module provides:
//! - TCP listener management
//! - Initial TLS record capture
//! - SNI extraction from the ClientHello
//! - Hostname routing with a default fallback
//! - PROXY protocol v1 injection and inbound v1/v2 decoding
//! - Bidirectional relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Record Reader -> SNI Extractor -> Router -> Backend
//!                                                                    |
//!                                                PROXY v1 header (if enabled)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, Passthrough, PassthroughConfig, SharedRoutingTable};
//!
//! let table = Arc::new(SharedRoutingTable::default());
//! let passthrough = Arc::new(Passthrough::new(table, PassthroughConfig::default()));
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, passthrough).await?);
//! listener.run().await?;
//! ```

mod handler;
mod listener;
mod proxy_protocol;
mod record;
mod relay;
mod router;
mod sni;

pub use handler::{
    Passthrough, PassthroughConfig, PassthroughStats, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_PROXY_HEADER_TIMEOUT,
};
pub use proxy_protocol::{
    read_inbound_header, read_inbound_header_with_timeout, InboundAddrs, ProxyFamily,
    ProxyHeaderV1, V1_MAX_LEN,
};
pub use record::{
    read_initial_record, read_initial_record_with_timeout, InitialRecord, RecordHeader,
    CONTENT_TYPE_HANDSHAKE, MAX_RECORD_LEN, RECORD_HEADER_LEN,
};
pub use relay::{relay, Finished, RelayStats};
pub use router::{BackendTarget, RouteMatch, RoutingTable, SharedRoutingTable};
pub use sni::extract_sni;
