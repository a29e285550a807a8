//! SNI-routed TLS passthrough proxy.
//!
//! Reads the first TLS record of each connection, extracts the SNI hostname
//! from the ClientHello without terminating TLS, and relays the encrypted
//! stream to the backend registered for that hostname.

pub mod config;
pub mod error;
pub mod proxy;
pub mod reload;
pub mod routes_file;

pub use config::Config;
pub use error::{ConnectionError, ProxyHeaderError, SniError};
pub use proxy::{
    extract_sni, BackendTarget, Listener, ListenerConfig, Passthrough, PassthroughConfig,
    ProxyHeaderV1, RouteMatch, RoutingTable, SharedRoutingTable,
};
pub use reload::{run_reload_loop, ReloadOutcome, RoutesWatcher};
pub use routes_file::RoutesFile;
