//! Error types for the consent control plane.

use crate::status::{ConsentStatus, GdprApplicability};

/// Consent errors.
///
/// All variants are handled locally by the owning component; none are
/// process-fatal.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConsentError {
    /// Requested status change violates a transition rule.
    #[error("invalid consent transition: {from} -> {to}")]
    InvalidTransition {
        from: ConsentStatus,
        to: ConsentStatus,
    },

    /// GDPR applicability cannot return to unknown once determined.
    #[error("gdpr applicability downgrade rejected: {current} -> unknown")]
    GdprDowngrade { current: GdprApplicability },

    /// Store read/write did not complete.
    #[error("consent persistence failed: {message}")]
    Persistence { message: String },
}

impl ConsentError {
    /// Whether the in-memory record remains authoritative after this error.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<rusqlite::Error> for ConsentError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

/// Result type for consent operations.
pub type ConsentResult<T> = Result<T, ConsentError>;
