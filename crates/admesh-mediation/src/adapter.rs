//! The ad-network adapter capability.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;

/// Error returned by an adapter's initialization hook.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct AdapterInitError {
    /// Vendor-specific failure description.
    pub message: String,
}

impl AdapterInitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Initialization lifecycle of a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitializationState {
    /// Initialization has not been attempted.
    #[default]
    NotInitialized,

    /// An initialization attempt is in flight.
    Initializing,

    /// The vendor SDK is up.
    Initialized,

    /// The most recent attempt failed; sticky until an explicit re-attempt.
    Failed,
}

impl InitializationState {
    /// Whether the state is a settled outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Initialized | Self::Failed)
    }
}

impl Display for InitializationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotInitialized => "not_initialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Failed => "failed",
        })
    }
}

/// A third-party ad-network integration.
///
/// Implementations wrap a vendor SDK. `initialize` receives the resolved
/// parameters (server values merged with local overrides) and is invoked at
/// most once per process lifetime unless a previous attempt failed;
/// `teardown` releases vendor resources when the network is shut down or
/// replaced.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Vendor SDK version advertised to the ad server.
    fn sdk_version(&self) -> &str;

    /// Bring the vendor SDK up with the resolved parameters.
    ///
    /// Runs to completion or failure once started; the registry never
    /// cancels it mid-flight.
    async fn initialize(
        &self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), AdapterInitError>;

    /// Release vendor resources. Default: nothing to release.
    fn teardown(&self) {}
}
