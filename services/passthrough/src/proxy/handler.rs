//! Per-connection passthrough orchestration.
//!
//! Reads the first TLS record, extracts SNI, resolves a backend, dials it,
//! optionally writes a PROXY v1 header, forwards the buffered ClientHello
//! verbatim and then relays both directions until either side finishes.
//!
//! Every failure is terminal for its connection. Nothing is ever written
//! back to the client: once bytes have been consumed from an encrypted
//! stream there is no channel to report an error on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ConnectionError;

use super::proxy_protocol::ProxyHeaderV1;
use super::record::{read_initial_record_with_timeout, InitialRecord};
use super::relay::{relay, RelayStats};
use super::router::{RouteMatch, SharedRoutingTable};
use super::sni::extract_sni;

/// Default deadline for reading the ClientHello record.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadlines for the handshake phase. The relay phase is unbounded.
#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Counters for the passthrough data path.
#[derive(Debug, Default)]
pub struct PassthroughStats {
    /// SNI extraction successes.
    pub sni_found: AtomicU64,
    /// SNI extraction failures (not TLS, no extension, truncated).
    pub sni_failed: AtomicU64,
    /// Connections sent to the default target.
    pub default_routed: AtomicU64,
    /// Connections dropped because nothing matched and no default exists.
    pub no_backend: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed to backends, ClientHello included.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Connection orchestrator for TLS passthrough.
pub struct Passthrough {
    table: Arc<SharedRoutingTable>,
    config: PassthroughConfig,
    stats: Arc<PassthroughStats>,
}

impl Passthrough {
    pub fn new(table: Arc<SharedRoutingTable>, config: PassthroughConfig) -> Self {
        Self {
            table,
            config,
            stats: Arc::new(PassthroughStats::default()),
        }
    }

    pub fn stats(&self) -> &PassthroughStats {
        &self.stats
    }

    /// Handle one accepted connection to completion.
    ///
    /// `peer_addr` and `local_addr` are the client and listener addresses
    /// used for the PROXY header. The client is shut down before returning,
    /// whatever the outcome.
    pub async fn handle<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<RelayStats, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.proxy(&mut client, peer_addr, local_addr).await;
        // Already-closed streams just report an error here.
        let _ = client.shutdown().await;
        result
    }

    async fn proxy<S>(
        &self,
        client: &mut S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<RelayStats, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let record = read_initial_record_with_timeout(client, self.config.handshake_timeout).await?;

        let hostname = match extract_sni(record.as_bytes()) {
            Ok(hostname) => {
                self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, "TLS ClientHello");
                Some(hostname)
            }
            Err(e) => {
                self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "No SNI, falling back to default backend");
                None
            }
        };

        let (target, matched) = match self.table.resolve_match(hostname.as_deref().unwrap_or(""))
        {
            Some(resolved) => resolved,
            None => {
                self.stats.no_backend.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = ?hostname, "No passthrough backend configured");
                return Err(ConnectionError::NoBackend { hostname });
            }
        };

        if matched == RouteMatch::Default {
            self.stats.default_routed.fetch_add(1, Ordering::Relaxed);
        }

        let backend_addr = target.dial_addr();
        debug!(backend_addr = %backend_addr, "Passing to backend");

        let mut backend = match timeout(
            self.config.dial_timeout,
            TcpStream::connect(backend_addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Ok(Err(source)) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend_addr = %backend_addr,
                    hostname = %target.hostname,
                    error = %source,
                    "Backend connection failed"
                );
                return Err(ConnectionError::Dial {
                    addr: backend_addr,
                    source,
                });
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend_addr = %backend_addr,
                    hostname = %target.hostname,
                    "Backend connection timed out"
                );
                return Err(ConnectionError::DialTimeout {
                    addr: backend_addr,
                    timeout: self.config.dial_timeout,
                });
            }
        };

        let header = target
            .use_proxy_protocol
            .then(|| ProxyHeaderV1::new(peer_addr, local_addr));
        if let Err(e) = forward_preamble(&mut backend, header.as_ref(), &record).await {
            let _ = backend.shutdown().await;
            return Err(e);
        }

        let stats = relay(client, &mut backend).await;
        let _ = backend.shutdown().await;

        self.stats
            .bytes_to_backend
            .fetch_add(record.len() as u64 + stats.a_to_b, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(stats.b_to_a, Ordering::Relaxed);

        debug!(
            bytes_to_backend = stats.a_to_b,
            bytes_from_backend = stats.b_to_a,
            finished = ?stats.finished,
            "Connection closed"
        );

        Ok(stats)
    }
}

/// Write the optional PROXY header, then the buffered record.
async fn forward_preamble<W>(
    backend: &mut W,
    header: Option<&ProxyHeaderV1>,
    record: &InitialRecord,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(header) = header {
        let line = header.encode();
        debug!(header = %line.trim_end(), "Writing PROXY header");
        if let Err(source) = backend.write_all(line.as_bytes()).await {
            warn!(error = %source, "Failed to write PROXY header");
            return Err(ConnectionError::Write {
                stage: "PROXY header",
                source,
            });
        }
    }

    if let Err(source) = backend.write_all(record.as_bytes()).await {
        warn!(
            bytes = record.len(),
            error = %source,
            "Failed to forward ClientHello"
        );
        return Err(ConnectionError::Write {
            stage: "ClientHello",
            source,
        });
    }

    Ok(())
}
