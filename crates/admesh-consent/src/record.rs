//! The authoritative consent record.

use chrono::{DateTime, Utc};

use crate::status::{ConsentStatus, GdprApplicability};

/// All consent state for one device/user.
///
/// Created with defaults on first SDK initialization and mutated only
/// through the manager's transition entry points; never deleted, only reset
/// to defaults by the explicit reset operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsentRecord {
    /// Current consent status.
    pub status: ConsentStatus,

    /// Whether GDPR obligations apply.
    pub gdpr_applicability: GdprApplicability,

    /// Privacy policy version in effect when the user last consented.
    pub consented_privacy_policy_version: Option<String>,

    /// Vendor list version in effect when the user last consented.
    pub consented_vendor_list_version: Option<String>,

    /// Advertising identifier latched while consent is granted.
    pub ifa_for_consent: Option<String>,

    /// Why the record last changed.
    pub last_changed_reason: Option<String>,

    /// When the record last changed.
    pub last_changed_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// Whether the ad-request path may request personalized content.
    pub fn can_collect_personal_info(&self) -> bool {
        self.status == ConsentStatus::Granted
    }
}

#[cfg(test)]
mod tests {
    use super::ConsentRecord;
    use crate::status::{ConsentStatus, GdprApplicability};

    #[test]
    fn default_record_is_fully_unknown() {
        let record = ConsentRecord::default();
        assert_eq!(record.status, ConsentStatus::Unknown);
        assert_eq!(record.gdpr_applicability, GdprApplicability::Unknown);
        assert!(record.consented_privacy_policy_version.is_none());
        assert!(record.consented_vendor_list_version.is_none());
        assert!(record.ifa_for_consent.is_none());
        assert!(record.last_changed_reason.is_none());
        assert!(record.last_changed_at.is_none());
    }

    #[test]
    fn personal_info_requires_granted() {
        let mut record = ConsentRecord::default();
        assert!(!record.can_collect_personal_info());

        record.status = ConsentStatus::Granted;
        assert!(record.can_collect_personal_info());

        record.status = ConsentStatus::PotentialWhitelist;
        assert!(!record.can_collect_personal_info());
    }
}
