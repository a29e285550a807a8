//! Routes file persistence.
//!
//! The reconciler publishes the passthrough routes as a JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "targets": [
//!     { "hostname": "a.test", "address": "10.0.0.1", "port": 443, "use_proxy_protocol": false }
//!   ],
//!   "default": { "address": "127.0.0.1", "port": 442, "use_proxy_protocol": true }
//! }
//! ```
//!
//! Saving goes through write-to-temp + rename, so the reload loop never
//! reads a half-written file.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proxy::{BackendTarget, RoutingTable};

/// Routes file format version.
pub const ROUTES_FILE_VERSION: u32 = 1;

/// On-disk routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutesFile {
    /// Format version.
    pub version: u32,
    /// Hostname targets, in priority order.
    #[serde(default)]
    pub targets: Vec<BackendTarget>,
    /// Target for unmatched or unparseable connections.
    #[serde(default)]
    pub default: Option<BackendTarget>,
}

impl Default for RoutesFile {
    fn default() -> Self {
        Self {
            version: ROUTES_FILE_VERSION,
            targets: Vec::new(),
            default: None,
        }
    }
}

impl RoutesFile {
    /// Snapshot a routing table into its file form.
    pub fn from_table(table: &RoutingTable) -> Self {
        Self {
            version: ROUTES_FILE_VERSION,
            targets: table.targets().to_vec(),
            default: table.default_target().cloned(),
        }
    }

    /// Parse and validate a routes document.
    pub fn parse(content: &str) -> Result<Self> {
        let file: RoutesFile =
            serde_json::from_str(content).context("Failed to parse routes file")?;
        file.validate()?;
        Ok(file)
    }

    /// Check the document before it is turned into a table.
    ///
    /// Duplicate hostnames are allowed; only the first one is ever matched.
    pub fn validate(&self) -> Result<()> {
        if self.version != ROUTES_FILE_VERSION {
            bail!(
                "Unsupported routes file version {} (expected {})",
                self.version,
                ROUTES_FILE_VERSION
            );
        }

        let mut seen = HashSet::new();
        for (index, target) in self.targets.iter().enumerate() {
            if target.hostname.is_empty() {
                bail!("Target {index} has an empty hostname");
            }
            check_destination(target)
                .with_context(|| format!("Invalid target {index} ({})", target.hostname))?;
            if !seen.insert(target.hostname.as_str()) {
                warn!(
                    hostname = %target.hostname,
                    index,
                    "Duplicate hostname in routes file, first entry wins"
                );
            }
        }

        if let Some(default) = &self.default {
            check_destination(default).context("Invalid default target")?;
        }

        Ok(())
    }

    /// Load and validate a routes file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read routes file: {}", path.display()))?;

        let file = Self::parse(&content)
            .with_context(|| format!("Invalid routes file: {}", path.display()))?;

        info!(
            path = %path.display(),
            target_count = file.targets.len(),
            has_default = file.default.is_some(),
            "Loaded routes file"
        );

        Ok(file)
    }

    /// Save the routes file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize routes file")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        debug!(
            path = %path.display(),
            target_count = self.targets.len(),
            "Saved routes file"
        );

        Ok(())
    }

    pub fn into_table(self) -> RoutingTable {
        RoutingTable::new(self.targets, self.default)
    }
}

fn check_destination(target: &BackendTarget) -> Result<()> {
    if target.address.is_empty() {
        bail!("empty address");
    }
    if target.port == 0 {
        bail!("port must be non-zero");
    }
    Ok(())
}
