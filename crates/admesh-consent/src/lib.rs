//! Consent control plane for the admesh SDK.
//!
//! This crate owns the single persisted record of a user's data-processing
//! consent and keeps it consistent across SDK threads:
//!
//! - [`ConsentManager`] — the consent state machine: transition rules,
//!   persistence, change broadcast
//! - [`ConsentStore`] — per-field SQLite persistence
//! - [`build_consent_url`] — consent-dialog URL construction
//!
//! # Quick start
//!
//! ```
//! use admesh_consent::{ConsentManager, ConsentStatus, ConsentStore, GdprApplicability};
//!
//! let manager = ConsentManager::new(ConsentStore::memory().unwrap());
//! manager
//!     .set_is_gdpr_applicable(GdprApplicability::Applicable)
//!     .unwrap();
//! assert!(manager.set_status(ConsentStatus::Granted, "user accepted", true));
//! assert!(manager.can_collect_personal_info());
//! ```

pub mod dialog;
pub mod error;
pub mod manager;
pub mod record;
pub mod status;
pub mod store;

pub use dialog::build_consent_url;
pub use error::{ConsentError, ConsentResult};
pub use manager::{ConsentChange, ConsentManager, ConsentSyncPayload, ObserverId};
pub use record::ConsentRecord;
pub use status::{ConsentStatus, GdprApplicability};
pub use store::{ConsentStore, IFA_FOR_CONSENT_KEY};
