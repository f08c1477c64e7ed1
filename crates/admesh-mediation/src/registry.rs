//! The ad-network adapter registry.
//!
//! Owns the mapping from network identifier to adapter descriptor. The map
//! mutex is held only for in-memory bookkeeping; adapter initialization
//! hooks run on a detached task outside every lock. `initialize_adapter`
//! is memoized per identifier: the caller that flips the descriptor to
//! Initializing starts the attempt, and every caller — including that one —
//! awaits the outcome over a watch channel instead of re-invoking the hook.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::adapter::{InitializationState, NetworkAdapter};
use crate::error::{MediationError, MediationResult};
use crate::manifest::CertifiedManifest;
use crate::resolver::resolve_parameters;

/// Mediation configuration.
#[derive(Debug, Clone)]
pub struct MediationConfig {
    /// Allow initialization of networks absent from the certified
    /// manifest.
    ///
    /// Certification gates trust-labeling, not functionality, so this
    /// defaults to true.
    pub allow_uncertified: bool,
}

impl Default for MediationConfig {
    fn default() -> Self {
        Self {
            allow_uncertified: true,
        }
    }
}

impl MediationConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `ADMESH_ALLOW_UNCERTIFIED` | Allow uncertified networks (default true) |
    pub fn from_env() -> Self {
        Self {
            allow_uncertified: std::env::var("ADMESH_ALLOW_UNCERTIFIED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        }
    }

    /// Forbid initialization of uncertified networks.
    pub fn certified_only(mut self) -> Self {
        self.allow_uncertified = false;
        self
    }
}

struct AdapterDescriptor {
    adapter: Arc<dyn NetworkAdapter>,
    certified: bool,
    state: Arc<watch::Sender<InitializationState>>,
    // Shared with the detached initialization task; replaced together with
    // the state channel when the descriptor is replaced, so a stale attempt
    // cannot pollute its successor.
    last_error: Arc<Mutex<Option<String>>>,
    server_parameters: BTreeMap<String, String>,
    local_overrides: BTreeMap<String, String>,
}

impl AdapterDescriptor {
    fn new(adapter: Arc<dyn NetworkAdapter>, certified: bool) -> Self {
        Self {
            adapter,
            certified,
            state: new_state_channel(),
            last_error: Arc::new(Mutex::new(None)),
            server_parameters: BTreeMap::new(),
            local_overrides: BTreeMap::new(),
        }
    }
}

fn new_state_channel() -> Arc<watch::Sender<InitializationState>> {
    let (tx, _rx) = watch::channel(InitializationState::NotInitialized);
    Arc::new(tx)
}

/// Registry of pluggable ad-network adapters.
///
/// Cheap to share behind an `Arc`; all entry points take `&self`.
pub struct AdapterRegistry {
    adapters: Mutex<BTreeMap<String, AdapterDescriptor>>,
    manifest: CertifiedManifest,
    config: MediationConfig,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry with the bundled manifest and default configuration.
    pub fn new() -> Self {
        Self::with_manifest(CertifiedManifest::bundled(), MediationConfig::default())
    }

    /// Registry over an explicit manifest and configuration.
    pub fn with_manifest(manifest: CertifiedManifest, config: MediationConfig) -> Self {
        Self {
            adapters: Mutex::new(BTreeMap::new()),
            manifest,
            config,
        }
    }

    /// Register `adapter` under `network_id`.
    ///
    /// Idempotent: re-registering the same handle is a no-op. A different
    /// handle replaces the descriptor and resets initialization state to
    /// NotInitialized. Certification is resolved against the manifest here,
    /// never from the adapter itself.
    pub fn register(&self, network_id: &str, adapter: Arc<dyn NetworkAdapter>) {
        let certified = self.manifest.is_certified(network_id);
        let mut adapters = self.adapters.lock().unwrap();

        if let Some(existing) = adapters.get_mut(network_id) {
            if Arc::ptr_eq(&existing.adapter, &adapter) {
                debug!(network = network_id, "adapter already registered, ignoring");
                return;
            }
            info!(
                network = network_id,
                "replacing registered adapter, initialization state reset"
            );
            *existing = AdapterDescriptor::new(adapter, certified);
            return;
        }

        if !certified {
            warn!(
                network = network_id,
                "registering network absent from certified manifest"
            );
        }
        debug!(network = network_id, certified, "adapter registered");
        adapters.insert(
            network_id.to_string(),
            AdapterDescriptor::new(adapter, certified),
        );
    }

    /// Identifiers of registered networks present in the trusted manifest.
    ///
    /// Pure lookup: no side effects, deterministic order.
    pub fn certified_adapter_classes(&self) -> BTreeSet<String> {
        let adapters = self.adapters.lock().unwrap();
        adapters
            .iter()
            .filter(|(_, descriptor)| descriptor.certified)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether the network is in the trusted manifest.
    pub fn is_certified(&self, network_id: &str) -> MediationResult<bool> {
        let adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor(&adapters, network_id)?;
        Ok(descriptor.certified)
    }

    /// Record server-provided parameters for a network.
    pub fn update_server_parameters(
        &self,
        network_id: &str,
        parameters: BTreeMap<String, String>,
    ) -> MediationResult<()> {
        let mut adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor_mut(&mut adapters, network_id)?;
        descriptor.server_parameters = parameters;
        Ok(())
    }

    /// Record host-application overrides for a network.
    pub fn set_local_overrides(
        &self,
        network_id: &str,
        overrides: BTreeMap<String, String>,
    ) -> MediationResult<()> {
        let mut adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor_mut(&mut adapters, network_id)?;
        descriptor.local_overrides = overrides;
        Ok(())
    }

    /// Merged parameters exactly as the initialization hook receives them.
    pub fn resolved_parameters(
        &self,
        network_id: &str,
    ) -> MediationResult<BTreeMap<String, String>> {
        let adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor(&adapters, network_id)?;
        Ok(resolve_parameters(
            &descriptor.server_parameters,
            &descriptor.local_overrides,
        ))
    }

    /// Initialization state for the ad-request path.
    pub fn initialization_state(&self, network_id: &str) -> MediationResult<InitializationState> {
        let adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor(&adapters, network_id)?;
        let state = *descriptor.state.borrow();
        Ok(state)
    }

    /// Message recorded by the most recent failed initialization.
    pub fn initialization_error(&self, network_id: &str) -> MediationResult<Option<String>> {
        let adapters = self.adapters.lock().unwrap();
        let descriptor = get_descriptor(&adapters, network_id)?;
        let last_error = descriptor.last_error.lock().unwrap().clone();
        Ok(last_error)
    }

    /// Initialize a network's adapter at most once.
    ///
    /// The first caller starts the initialization; concurrent callers for
    /// the same identifier await that outcome without re-invoking the hook.
    /// A Failed outcome is sticky: it is what the awaiting callers observe,
    /// and only a later explicit call re-enters initialization. The hook
    /// runs on a detached task, so once started it runs to completion or
    /// failure even if every caller abandons waiting.
    pub async fn initialize_adapter(
        &self,
        network_id: &str,
    ) -> MediationResult<InitializationState> {
        let mut rx = {
            let mut adapters = self.adapters.lock().unwrap();
            let descriptor = get_descriptor_mut(&mut adapters, network_id)?;

            if !descriptor.certified && !self.config.allow_uncertified {
                return Err(MediationError::Uncertified {
                    network_id: network_id.to_string(),
                });
            }

            // Copy the state out: a watch borrow must not be held across
            // send_replace on the same channel.
            let current = *descriptor.state.borrow();
            match current {
                InitializationState::Initialized => return Ok(InitializationState::Initialized),
                InitializationState::Initializing => {
                    debug!(network = network_id, "initialization in flight, awaiting outcome");
                    descriptor.state.subscribe()
                }
                InitializationState::NotInitialized | InitializationState::Failed => {
                    descriptor.state.send_replace(InitializationState::Initializing);
                    *descriptor.last_error.lock().unwrap() = None;
                    let rx = descriptor.state.subscribe();
                    spawn_initialization(
                        network_id.to_string(),
                        Arc::clone(&descriptor.adapter),
                        resolve_parameters(
                            &descriptor.server_parameters,
                            &descriptor.local_overrides,
                        ),
                        Arc::clone(&descriptor.state),
                        Arc::clone(&descriptor.last_error),
                    );
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state)
            .map_err(|_| MediationError::InitializationInterrupted {
                network_id: network_id.to_string(),
            })?;
        Ok(outcome)
    }

    /// Tear a network down and return it to NotInitialized.
    ///
    /// Ignored while an initialization attempt is in flight.
    pub fn teardown(&self, network_id: &str) -> MediationResult<()> {
        let (adapter, state) = {
            let mut adapters = self.adapters.lock().unwrap();
            let descriptor = get_descriptor_mut(&mut adapters, network_id)?;
            let current = *descriptor.state.borrow();
            if current == InitializationState::Initializing {
                warn!(network = network_id, "teardown ignored while initializing");
                return Ok(());
            }
            *descriptor.last_error.lock().unwrap() = None;
            (
                Arc::clone(&descriptor.adapter),
                Arc::clone(&descriptor.state),
            )
        };

        adapter.teardown();
        state.send_replace(InitializationState::NotInitialized);
        info!(network = network_id, "adapter torn down");
        Ok(())
    }
}

/// Run one initialization attempt on a detached task.
///
/// The task settles the watch channel exactly once. A panicking hook is
/// contained by the inner task and recorded as a failure, so waiters are
/// never stranded in Initializing.
fn spawn_initialization(
    network_id: String,
    adapter: Arc<dyn NetworkAdapter>,
    parameters: BTreeMap<String, String>,
    state: Arc<watch::Sender<InitializationState>>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    info!(
        network = %network_id,
        parameters = parameters.len(),
        sdk_version = adapter.sdk_version(),
        "initializing adapter"
    );
    tokio::spawn(async move {
        let attempt =
            tokio::spawn(async move { adapter.initialize(&parameters).await }).await;
        let settled = match attempt {
            Ok(Ok(())) => {
                info!(network = %network_id, "adapter initialized");
                InitializationState::Initialized
            }
            Ok(Err(e)) => {
                warn!(network = %network_id, error = %e, "adapter initialization failed");
                *last_error.lock().unwrap() = Some(e.to_string());
                InitializationState::Failed
            }
            Err(e) => {
                warn!(network = %network_id, error = %e, "adapter initialization panicked");
                *last_error.lock().unwrap() = Some(e.to_string());
                InitializationState::Failed
            }
        };
        state.send_replace(settled);
    });
}

fn get_descriptor<'a>(
    adapters: &'a BTreeMap<String, AdapterDescriptor>,
    network_id: &str,
) -> MediationResult<&'a AdapterDescriptor> {
    adapters
        .get(network_id)
        .ok_or_else(|| MediationError::UnknownNetwork {
            network_id: network_id.to_string(),
        })
}

fn get_descriptor_mut<'a>(
    adapters: &'a mut BTreeMap<String, AdapterDescriptor>,
    network_id: &str,
) -> MediationResult<&'a mut AdapterDescriptor> {
    adapters
        .get_mut(network_id)
        .ok_or_else(|| MediationError::UnknownNetwork {
            network_id: network_id.to_string(),
        })
}
