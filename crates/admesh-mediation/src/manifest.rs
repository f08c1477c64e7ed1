//! Trusted certified-adapter manifest.
//!
//! Certification is resolved against this manifest when an adapter is
//! registered, never from adapter self-report. The default set is compiled
//! in; a bundled JSON manifest can replace it at load time.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{MediationError, MediationResult};

/// Network identifiers certified by default.
const CERTIFIED_NETWORKS: &[&str] = &[
    "admob",
    "applovin",
    "facebook_audience_network",
    "ironsource",
    "unity_ads",
    "vungle",
];

/// Bundled manifest file format: `{"version": 1, "networks": [...]}`.
#[derive(Debug, Deserialize)]
struct ManifestFile {
    version: u8,
    networks: Vec<String>,
}

/// The set of certified network identifiers.
#[derive(Debug, Clone)]
pub struct CertifiedManifest {
    networks: BTreeSet<String>,
}

impl Default for CertifiedManifest {
    fn default() -> Self {
        Self::bundled()
    }
}

impl CertifiedManifest {
    /// The compiled-in certified set.
    pub fn bundled() -> Self {
        Self {
            networks: CERTIFIED_NETWORKS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// An empty manifest: nothing is certified.
    pub fn empty() -> Self {
        Self {
            networks: BTreeSet::new(),
        }
    }

    /// Build a manifest from explicit identifiers.
    pub fn from_networks<I, S>(networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            networks: networks.into_iter().map(Into::into).collect(),
        }
    }

    /// Load a bundled JSON manifest file.
    pub fn from_json_file(path: &Path) -> MediationResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| MediationError::Manifest {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let file: ManifestFile =
            serde_json::from_str(&raw).map_err(|e| MediationError::Manifest {
                message: format!("failed to parse {}: {}", path.display(), e),
            })?;
        info!(
            version = file.version,
            networks = file.networks.len(),
            path = %path.display(),
            "loaded certified adapter manifest"
        );
        Ok(Self {
            networks: file.networks.into_iter().collect(),
        })
    }

    /// Whether `network_id` is certified.
    pub fn is_certified(&self, network_id: &str) -> bool {
        self.networks.contains(network_id)
    }

    /// All certified identifiers.
    pub fn networks(&self) -> &BTreeSet<String> {
        &self.networks
    }
}
