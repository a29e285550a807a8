//! Passthrough configuration.
//!
//! Everything comes from `PASSTHROUGH_*` environment variables so the
//! service can run unmodified under a process supervisor or in a container.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{
    BackendTarget, ListenerConfig, PassthroughConfig, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_PROXY_HEADER_TIMEOUT,
};

/// Passthrough configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Routes file to load at startup and watch.
    pub routes_file: Option<PathBuf>,

    /// How often the routes file is checked for changes.
    pub reload_interval: Duration,

    /// Default target used when the routes file does not name one.
    pub default_backend: Option<BackendTarget>,

    /// Deadline for reading the ClientHello record.
    pub handshake_timeout: Duration,

    /// Deadline for dialing a backend.
    pub dial_timeout: Duration,

    /// Concurrent connection cap.
    pub max_connections: usize,

    /// Expect a PROXY header from an upstream load balancer.
    pub accept_proxy_protocol: bool,

    /// Deadline for that header.
    pub proxy_header_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("PASSTHROUGH_LISTEN_ADDR")
            .unwrap_or_else(|| "[::]:443".to_string())
            .parse()
            .context("PASSTHROUGH_LISTEN_ADDR must be a socket address (example: [::]:443).")?;

        let routes_file = lookup("PASSTHROUGH_ROUTES_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let reload_interval_ms = parse_u64(&lookup, "PASSTHROUGH_RELOAD_INTERVAL_MS")?
            .unwrap_or(1000);
        let reload_interval = Duration::from_millis(reload_interval_ms.max(50));

        let default_proxy_protocol =
            parse_bool(&lookup, "PASSTHROUGH_DEFAULT_PROXY_PROTOCOL")?.unwrap_or(true);
        let default_backend = lookup("PASSTHROUGH_DEFAULT_BACKEND")
            .filter(|v| !v.is_empty())
            .map(|v| parse_backend(&v))
            .transpose()
            .context("PASSTHROUGH_DEFAULT_BACKEND must be host:port.")?
            .map(|target| target.with_proxy_protocol(default_proxy_protocol));

        let handshake_timeout = parse_millis(&lookup, "PASSTHROUGH_HANDSHAKE_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let dial_timeout =
            parse_millis(&lookup, "PASSTHROUGH_DIAL_TIMEOUT_MS")?.unwrap_or(DEFAULT_DIAL_TIMEOUT);
        let proxy_header_timeout = parse_millis(&lookup, "PASSTHROUGH_PROXY_HEADER_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_PROXY_HEADER_TIMEOUT);

        let max_connections = parse_u64(&lookup, "PASSTHROUGH_MAX_CONNECTIONS")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            bail!("PASSTHROUGH_MAX_CONNECTIONS must be at least 1.");
        }

        let accept_proxy_protocol =
            parse_bool(&lookup, "PASSTHROUGH_ACCEPT_PROXY_PROTOCOL")?.unwrap_or(false);

        let log_level = lookup("PASSTHROUGH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_file,
            reload_interval,
            default_backend,
            handshake_timeout,
            dial_timeout,
            max_connections,
            accept_proxy_protocol,
            proxy_header_timeout,
            log_level,
        })
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen_addr,
            max_connections: self.max_connections,
            accept_proxy_protocol: self.accept_proxy_protocol,
            proxy_header_timeout: self.proxy_header_timeout,
        }
    }

    pub fn passthrough_config(&self) -> PassthroughConfig {
        PassthroughConfig {
            handshake_timeout: self.handshake_timeout,
            dial_timeout: self.dial_timeout,
        }
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer."))
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_u64(lookup, key)?.map(Duration::from_millis))
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => bail!("{key} must be true or false (got {v:?})."),
        },
    }
}

/// Parse `host:port` or `[v6]:port` into a default target.
fn parse_backend(raw: &str) -> Result<BackendTarget> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("missing port in {raw:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("missing host in {raw:?}");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {raw:?}"))?;
    if port == 0 {
        bail!("port must be non-zero in {raw:?}");
    }
    Ok(BackendTarget::new("", host, port))
}
