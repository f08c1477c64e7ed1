//! Consent status and GDPR applicability.

use std::fmt::{Display, Formatter};

/// A user's data-processing consent status.
///
/// Exactly one value is authoritative at any instant; the persisted value
/// and the in-memory value converge after every mutating call on the
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsentStatus {
    /// No consent decision has been recorded yet.
    #[default]
    Unknown,

    /// The user explicitly denied consent.
    Denied,

    /// The user explicitly granted consent.
    Granted,

    /// The publisher is whitelisted to collect consent on the user's
    /// behalf, pending an explicit answer.
    PotentialWhitelist,

    /// The device-level limit-ad-tracking setting is on.
    DoNotTrack,
}

impl ConsentStatus {
    /// Stable token used for persistence and consent-URL substitution.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Denied => "denied",
            Self::Granted => "granted",
            Self::PotentialWhitelist => "potential_whitelist",
            Self::DoNotTrack => "do_not_track",
        }
    }

    /// Parse a stored or server-supplied token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "unknown" => Some(Self::Unknown),
            "denied" => Some(Self::Denied),
            "granted" => Some(Self::Granted),
            "potential_whitelist" => Some(Self::PotentialWhitelist),
            "do_not_track" => Some(Self::DoNotTrack),
            _ => None,
        }
    }
}

impl Display for ConsentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether EU consent-law obligations apply to the current user/session.
///
/// Tri-state because applicability may not have been determined yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GdprApplicability {
    /// Not yet determined.
    #[default]
    Unknown,

    /// GDPR applies.
    Applicable,

    /// GDPR does not apply.
    NotApplicable,
}

impl GdprApplicability {
    /// Stable token used for persistence and consent-URL substitution.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Applicable => "yes",
            Self::NotApplicable => "no",
        }
    }

    /// Parse a stored token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "unknown" => Some(Self::Unknown),
            "yes" => Some(Self::Applicable),
            "no" => Some(Self::NotApplicable),
            _ => None,
        }
    }

    /// Whether applicability has been determined.
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl Display for GdprApplicability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
