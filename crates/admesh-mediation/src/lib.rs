//! Ad-network mediation control plane for the admesh SDK.
//!
//! This crate owns the registry of pluggable ad-network adapters:
//!
//! - [`AdapterRegistry`] — network identifier → adapter descriptor,
//!   certification, at-most-once initialization under concurrent ad
//!   requests
//! - [`CertifiedManifest`] — the trusted certified-network set
//! - [`resolve_parameters`] — server/override parameter resolution
//!
//! # Quick start
//!
//! ```
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use admesh_mediation::{AdapterInitError, AdapterRegistry, NetworkAdapter};
//!
//! struct Stub;
//!
//! #[async_trait::async_trait]
//! impl NetworkAdapter for Stub {
//!     fn sdk_version(&self) -> &str {
//!         "1.0.0"
//!     }
//!
//!     async fn initialize(
//!         &self,
//!         _parameters: &BTreeMap<String, String>,
//!     ) -> Result<(), AdapterInitError> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = AdapterRegistry::new();
//! registry.register("unity_ads", Arc::new(Stub));
//! let state = registry.initialize_adapter("unity_ads").await.unwrap();
//! assert!(state.is_terminal());
//! # }
//! ```

pub mod adapter;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod resolver;

pub use adapter::{AdapterInitError, InitializationState, NetworkAdapter};
pub use error::{MediationError, MediationResult};
pub use manifest::CertifiedManifest;
pub use registry::{AdapterRegistry, MediationConfig};
pub use resolver::resolve_parameters;
