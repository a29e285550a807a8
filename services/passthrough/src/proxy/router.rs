//! Routing table and backend resolution.
//!
//! The table is produced by the external reconciler and never mutated after
//! construction. Reconfiguration builds a fresh table and swaps it into
//! [`SharedRoutingTable`] in a single pointer store, so a lookup sees either
//! the old table or the new one in full.
//!
//! Matching rules:
//! - Exact hostname match only (no wildcards or regex)
//! - Case-sensitive, no trailing dot trimming
//! - First target wins when a hostname is listed twice
//! - Empty hostname or no match falls back to the default target

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One passthrough destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTarget {
    /// Routing key, compared exactly against the SNI hostname. Unused for
    /// the default target.
    #[serde(default)]
    pub hostname: String,
    /// Backend host or IP.
    pub address: String,
    /// Backend TCP port.
    pub port: u16,
    /// Send a PROXY v1 header before any relayed bytes.
    #[serde(default)]
    pub use_proxy_protocol: bool,
}

impl BackendTarget {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            port,
            use_proxy_protocol: false,
        }
    }

    /// Enable or disable PROXY protocol for this target.
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.use_proxy_protocol = enabled;
        self
    }

    /// `host:port` suitable for dialing; IPv6 literals are bracketed.
    pub fn dial_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.hostname, self.dial_addr())
    }
}

/// How a hostname was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    /// A target's hostname matched exactly.
    Exact,
    /// Nothing matched; the default target was used.
    Default,
}

/// Immutable snapshot of passthrough routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    targets: Vec<BackendTarget>,
    default: Option<BackendTarget>,
}

impl RoutingTable {
    pub fn new(targets: Vec<BackendTarget>, default: Option<BackendTarget>) -> Self {
        Self { targets, default }
    }

    /// A table that drops every connection.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> &[BackendTarget] {
        &self.targets
    }

    pub fn default_target(&self) -> Option<&BackendTarget> {
        self.default.as_ref()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve a hostname to a backend.
    ///
    /// An empty hostname means extraction failed. Returns `None` only when
    /// nothing matched and no default is configured, which means the
    /// connection is dropped.
    pub fn resolve(&self, hostname: &str) -> Option<&BackendTarget> {
        self.resolve_match(hostname).map(|(target, _)| target)
    }

    /// Like [`RoutingTable::resolve`], also reporting whether the default
    /// target was used.
    pub fn resolve_match(&self, hostname: &str) -> Option<(&BackendTarget, RouteMatch)> {
        if !hostname.is_empty() {
            if let Some(target) = self.targets.iter().find(|t| t.hostname == hostname) {
                return Some((target, RouteMatch::Exact));
            }
        }
        self.default
            .as_ref()
            .map(|target| (target, RouteMatch::Default))
    }
}

/// Shared, atomically swappable routing table.
///
/// Readers never block; the old snapshot is dropped once its last reader
/// finishes.
pub struct SharedRoutingTable {
    snapshot: ArcSwap<RoutingTable>,
}

impl SharedRoutingTable {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(table),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.snapshot.load_full()
    }

    /// Replace the whole table in a single pointer swap.
    pub fn store(&self, table: RoutingTable) {
        let target_count = table.len();
        let has_default = table.default.is_some();
        self.snapshot.store(Arc::new(table));
        info!(
            target_count = target_count,
            has_default = has_default,
            "Routing table updated atomically"
        );
    }

    /// Resolve against the current snapshot, cloning the target out so the
    /// snapshot is released as soon as the lookup is done.
    pub fn resolve(&self, hostname: &str) -> Option<BackendTarget> {
        self.resolve_match(hostname).map(|(target, _)| target)
    }

    /// Resolve against the current snapshot, reporting how it matched.
    pub fn resolve_match(&self, hostname: &str) -> Option<(BackendTarget, RouteMatch)> {
        let snapshot = self.snapshot.load();
        let resolved = snapshot
            .resolve_match(hostname)
            .map(|(target, matched)| (target.clone(), matched));
        debug!(
            hostname = %hostname,
            target = ?resolved.as_ref().map(|(t, _)| t.dial_addr()),
            matched = ?resolved.as_ref().map(|(_, m)| *m),
            "Resolved passthrough target"
        );
        resolved
    }
}

impl Default for SharedRoutingTable {
    fn default() -> Self {
        Self::new(RoutingTable::empty())
    }
}
