//! Error types for the mediation control plane.

/// Mediation errors.
///
/// Adapter initialization failures are not errors at this level: they are
/// recorded per identifier and surfaced through the state query, never
/// thrown at unrelated callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MediationError {
    /// No adapter is registered under the identifier.
    #[error("unknown ad network: {network_id}")]
    UnknownNetwork { network_id: String },

    /// The network is absent from the certified manifest and configuration
    /// forbids uncertified networks.
    #[error("uncertified ad network rejected by configuration: {network_id}")]
    Uncertified { network_id: String },

    /// The initialization outcome channel closed before reaching a
    /// terminal state (the descriptor was replaced mid-flight).
    #[error("initialization interrupted for {network_id}")]
    InitializationInterrupted { network_id: String },

    /// The certified manifest could not be read.
    #[error("certified manifest unreadable: {message}")]
    Manifest { message: String },
}

/// Result type for mediation operations.
pub type MediationResult<T> = Result<T, MediationError>;
