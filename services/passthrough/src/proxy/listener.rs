//! TCP listener and accept loop.
//!
//! Accepts connections on the passthrough port and hands each one to
//! [`Passthrough::handle`] on its own task. When the listener sits behind a
//! load balancer that speaks PROXY protocol, the inbound header is decoded
//! first so routing logs and the outbound PROXY header carry the real
//! client address.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::ConnectionError;

use super::handler::Passthrough;
use super::proxy_protocol::read_inbound_header_with_timeout;
use super::relay::RelayStats;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default deadline for an inbound PROXY header.
pub const DEFAULT_PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Decode a PROXY header sent by an upstream load balancer.
    pub accept_proxy_protocol: bool,
    /// Deadline for that header.
    pub proxy_header_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            accept_proxy_protocol: false,
            proxy_header_timeout: DEFAULT_PROXY_HEADER_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections closed because of a bad inbound PROXY header.
    pub proxy_header_failed: AtomicU64,
}

/// A TCP listener for TLS passthrough.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Bound address, used when a socket cannot report its own.
    local_addr: SocketAddr,
    /// Connection orchestrator.
    passthrough: Arc<Passthrough>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, passthrough: Arc<Passthrough>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            accept_proxy_protocol = config.accept_proxy_protocol,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            local_addr,
            config,
            passthrough,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(bind_addr = %self.local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<RelayStats, ConnectionError> {
        let local_addr = stream.local_addr().unwrap_or(self.local_addr);
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Handling TCP connection");

        if !self.config.accept_proxy_protocol {
            return self.passthrough.handle(stream, peer_addr, local_addr).await;
        }

        let mut reader = BufReader::new(stream);
        let (peer_addr, local_addr) =
            match read_inbound_header_with_timeout(&mut reader, self.config.proxy_header_timeout)
                .await
            {
                Ok(Some(addrs)) => {
                    debug!(
                        src_addr = %addrs.src_addr,
                        dst_addr = %addrs.dst_addr,
                        "Decoded inbound PROXY header"
                    );
                    (addrs.src_addr, addrs.dst_addr)
                }
                Ok(None) => (peer_addr, local_addr),
                Err(e) => {
                    self.stats
                        .proxy_header_failed
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Invalid inbound PROXY header");
                    return Err(e.into());
                }
            };

        self.passthrough.handle(reader, peer_addr, local_addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:443".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!config.accept_proxy_protocol);
        assert_eq!(config.proxy_header_timeout, DEFAULT_PROXY_HEADER_TIMEOUT);
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }
}
