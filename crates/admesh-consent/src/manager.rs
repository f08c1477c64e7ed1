//! The consent state machine.
//!
//! Owns the authoritative in-memory [`ConsentRecord`], enforces transition
//! rules, persists through the [`ConsentStore`], and fans out change
//! notifications to registered observers.
//!
//! Lock discipline: the record mutex is held only for the in-memory
//! mutation. Persistence and broadcast happen after the lock is released,
//! and persistence of a transition always completes before that
//! transition's broadcast, so an observer that re-reads the store after
//! being notified sees at least the notified transition.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::dialog::build_consent_url;
use crate::error::{ConsentError, ConsentResult};
use crate::record::ConsentRecord;
use crate::status::{ConsentStatus, GdprApplicability};
use crate::store::ConsentStore;

/// A consent change delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentChange {
    /// Status before the transition.
    pub old_status: ConsentStatus,

    /// Status after the transition.
    pub new_status: ConsentStatus,

    /// Why the transition happened.
    pub reason: Option<String>,

    /// Personalized-ad eligibility after the transition.
    pub can_collect_personal_info: bool,
}

/// Handle returned by [`ConsentManager::observe`]; pass to
/// [`ConsentManager::unobserve`] to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ConsentObserver = Box<dyn Fn(&ConsentChange) + Send + Sync>;

/// Server-pushed partial consent state.
///
/// Every field is optional; absent fields leave the record untouched.
/// Values are strings because the ad server delivers a flat key-value
/// payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsentSyncPayload {
    /// New consent status token, if the server changed it.
    #[serde(default)]
    pub status: Option<String>,

    /// "1"/"true" when the request originated from a GDPR region.
    #[serde(default)]
    pub is_gdpr_region: Option<String>,

    /// Current privacy policy version.
    #[serde(default)]
    pub privacy_policy_version: Option<String>,

    /// Current vendor list version.
    #[serde(default)]
    pub vendor_list_version: Option<String>,

    /// Server-supplied reason for the change.
    #[serde(default)]
    pub consent_change_reason: Option<String>,
}

impl ConsentSyncPayload {
    /// Parse a raw server payload.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// The consent state machine.
///
/// Cheap to share behind an `Arc`; all entry points take `&self`.
pub struct ConsentManager {
    record: Mutex<ConsentRecord>,
    store: ConsentStore,
    observers: Mutex<Vec<(ObserverId, ConsentObserver)>>,
    next_observer_id: AtomicU64,
    device_ifa: Mutex<Option<String>>,
}

impl ConsentManager {
    /// Create a manager over `store`, seeding the in-memory record from the
    /// persisted one.
    pub fn new(store: ConsentStore) -> Self {
        let record = store.load();
        Self {
            record: Mutex::new(record),
            store,
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            device_ifa: Mutex::new(None),
        }
    }

    // === Read-only queries ===

    /// Current authoritative consent status.
    pub fn current_status(&self) -> ConsentStatus {
        self.record.lock().unwrap().status
    }

    /// Whether GDPR obligations apply.
    pub fn is_gdpr_applicable(&self) -> GdprApplicability {
        self.record.lock().unwrap().gdpr_applicability
    }

    /// Whether the ad-request path may request personalized content.
    pub fn can_collect_personal_info(&self) -> bool {
        self.record.lock().unwrap().can_collect_personal_info()
    }

    /// The advertising identifier latched at consent time, if any.
    pub fn ifa_for_consent(&self) -> Option<String> {
        self.record.lock().unwrap().ifa_for_consent.clone()
    }

    /// Snapshot of the full record.
    pub fn record(&self) -> ConsentRecord {
        self.record.lock().unwrap().clone()
    }

    /// Build the consent-dialog URL for the current state.
    ///
    /// Returns `None` for a malformed template or language code, never a
    /// partially substituted URL.
    pub fn consent_url(&self, format: &str, iso_language: &str) -> Option<Url> {
        let (status, gdpr) = {
            let record = self.record.lock().unwrap();
            (record.status, record.gdpr_applicability)
        };
        build_consent_url(format, iso_language, status, gdpr)
    }

    // === Mutations ===

    /// Supply the device advertising identifier.
    ///
    /// The identifier is latched into the record when consent transitions
    /// into Granted and cleared when consent leaves Granted.
    pub fn set_device_ifa(&self, ifa: Option<&str>) {
        *self.device_ifa.lock().unwrap() = ifa.map(str::to_string);
    }

    /// Request a consent status transition.
    ///
    /// Returns false, with no mutation, persistence, or broadcast, when the
    /// requested status equals the current one or the transition is
    /// illegal. On success the record is persisted before observers are
    /// notified.
    pub fn set_status(
        &self,
        new_status: ConsentStatus,
        reason: &str,
        should_broadcast: bool,
    ) -> bool {
        let device_ifa = self.device_ifa.lock().unwrap().clone();
        let change = {
            let mut record = self.record.lock().unwrap();
            if record.status == new_status {
                debug!(status = %new_status, "consent status unchanged, ignoring");
                return false;
            }
            if let Err(e) = validate_transition(&record, new_status) {
                warn!(error = %e, "consent transition rejected");
                return false;
            }
            let old_status = record.status;
            apply_status(&mut record, new_status, device_ifa);
            record.last_changed_reason = Some(reason.to_string());
            record.last_changed_at = Some(Utc::now());
            ConsentChange {
                old_status,
                new_status,
                reason: Some(reason.to_string()),
                can_collect_personal_info: record.can_collect_personal_info(),
            }
        };

        self.persist();
        info!(old = %change.old_status, new = %change.new_status, reason, "consent status changed");
        if should_broadcast {
            self.broadcast(&change);
        }
        true
    }

    /// Record whether GDPR obligations apply.
    ///
    /// Once applicability has been determined, a downgrade back to Unknown
    /// is rejected and the stored value is unchanged.
    pub fn set_is_gdpr_applicable(&self, value: GdprApplicability) -> ConsentResult<()> {
        {
            let mut record = self.record.lock().unwrap();
            if record.gdpr_applicability == value {
                return Ok(());
            }
            if value == GdprApplicability::Unknown && record.gdpr_applicability.is_known() {
                return Err(ConsentError::GdprDowngrade {
                    current: record.gdpr_applicability,
                });
            }
            record.gdpr_applicability = value;
        }
        info!(gdpr = %value, "gdpr applicability recorded");
        self.persist();
        Ok(())
    }

    /// Merge a server-pushed partial consent state.
    ///
    /// Each field is validated independently; invalid fields are skipped
    /// with a warning. The whole merge performs at most one persistence
    /// write and at most one broadcast, and returns whether anything
    /// changed.
    pub fn update_consent_state(&self, payload: &ConsentSyncPayload) -> bool {
        let device_ifa = self.device_ifa.lock().unwrap().clone();
        let (changed, change) = {
            let mut record = self.record.lock().unwrap();
            let mut changed = false;
            let mut change = None;

            if let Some(region) = payload.is_gdpr_region.as_deref() {
                match parse_gdpr_region(region) {
                    Some(value) if value != record.gdpr_applicability => {
                        record.gdpr_applicability = value;
                        changed = true;
                    }
                    Some(_) => {}
                    None => {
                        warn!(value = region, "unrecognized is_gdpr_region value, skipping")
                    }
                }
            }

            if let Some(version) = payload.privacy_policy_version.as_deref() {
                if record.consented_privacy_policy_version.as_deref() != Some(version) {
                    record.consented_privacy_policy_version = Some(version.to_string());
                    changed = true;
                }
            }

            if let Some(version) = payload.vendor_list_version.as_deref() {
                if record.consented_vendor_list_version.as_deref() != Some(version) {
                    record.consented_vendor_list_version = Some(version.to_string());
                    changed = true;
                }
            }

            if let Some(token) = payload.status.as_deref() {
                match ConsentStatus::parse(token) {
                    Some(new_status) if new_status != record.status => {
                        if validate_transition(&record, new_status).is_ok() {
                            let old_status = record.status;
                            apply_status(&mut record, new_status, device_ifa);
                            changed = true;
                            change = Some(ConsentChange {
                                old_status,
                                new_status,
                                reason: payload.consent_change_reason.clone(),
                                can_collect_personal_info: false,
                            });
                        } else {
                            warn!(
                                from = %record.status,
                                to = %new_status,
                                "server-pushed consent transition rejected, skipping"
                            );
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!(token, "unrecognized consent status in server payload, skipping")
                    }
                }
            }

            if changed {
                let reason = payload
                    .consent_change_reason
                    .clone()
                    .unwrap_or_else(|| "server consent sync".to_string());
                record.last_changed_reason = Some(reason);
                record.last_changed_at = Some(Utc::now());
            }
            if let Some(c) = change.as_mut() {
                c.can_collect_personal_info = record.can_collect_personal_info();
            }
            (changed, change)
        };

        if !changed {
            return false;
        }
        self.persist();
        debug!("server consent state merged");
        if let Some(change) = change {
            self.broadcast(&change);
        }
        true
    }

    /// Reset the record to defaults (reinstall / test support).
    ///
    /// The reset is persisted and broadcast like any other transition.
    pub fn reset(&self, reason: &str) {
        let change = {
            let mut record = self.record.lock().unwrap();
            let old_status = record.status;
            *record = ConsentRecord::default();
            record.last_changed_reason = Some(reason.to_string());
            record.last_changed_at = Some(Utc::now());
            ConsentChange {
                old_status,
                new_status: record.status,
                reason: Some(reason.to_string()),
                can_collect_personal_info: false,
            }
        };
        self.persist();
        info!(reason, "consent record reset to defaults");
        self.broadcast(&change);
    }

    // === Observers ===

    /// Register a consent-change observer.
    ///
    /// Observers are notified in registration order. A panicking observer
    /// does not prevent later observers from being notified.
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ConsentChange) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().unwrap().push((id, Box::new(callback)));
        id
    }

    /// Remove a previously registered observer.
    pub fn unobserve(&self, id: ObserverId) {
        self.observers.lock().unwrap().retain(|(oid, _)| *oid != id);
    }

    // === Internal ===

    /// Best-effort persistence; the in-memory record stays authoritative on
    /// failure and the next save rewrites every field.
    fn persist(&self) {
        let snapshot = self.record.lock().unwrap().clone();
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "consent persistence failed, in-memory record remains authoritative");
        }
    }

    fn broadcast(&self, change: &ConsentChange) {
        let observers = self.observers.lock().unwrap();
        for (id, observer) in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(change))).is_err() {
                warn!(observer = id.0, "consent observer panicked during notification");
            }
        }
    }
}

/// Transition rules for consent status changes.
///
/// Granted requires that GDPR applicability is known, unless the record
/// already carries a whitelist exception.
fn validate_transition(record: &ConsentRecord, new_status: ConsentStatus) -> ConsentResult<()> {
    if new_status == ConsentStatus::Granted
        && !record.gdpr_applicability.is_known()
        && record.status != ConsentStatus::PotentialWhitelist
    {
        return Err(ConsentError::InvalidTransition {
            from: record.status,
            to: new_status,
        });
    }
    Ok(())
}

/// Apply a validated status change, latching or clearing the IFA.
fn apply_status(record: &mut ConsentRecord, new_status: ConsentStatus, device_ifa: Option<String>) {
    record.status = new_status;
    record.ifa_for_consent = if new_status == ConsentStatus::Granted {
        device_ifa
    } else {
        None
    };
}

fn parse_gdpr_region(value: &str) -> Option<GdprApplicability> {
    match value {
        "1" => Some(GdprApplicability::Applicable),
        "0" => Some(GdprApplicability::NotApplicable),
        v if v.eq_ignore_ascii_case("true") => Some(GdprApplicability::Applicable),
        v if v.eq_ignore_ascii_case("false") => Some(GdprApplicability::NotApplicable),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn manager() -> (ConsentManager, ConsentStore) {
        let store = ConsentStore::memory().unwrap();
        (ConsentManager::new(store.clone()), store)
    }

    fn counting_observer(manager: &ConsentManager) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        manager.observe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn grantable(manager: &ConsentManager) {
        manager
            .set_is_gdpr_applicable(GdprApplicability::Applicable)
            .unwrap();
    }

    // === A) Transition rules ===

    #[test]
    fn noop_transition_returns_false_and_never_broadcasts() {
        let (manager, _) = manager();
        let broadcasts = counting_observer(&manager);

        assert!(!manager.set_status(ConsentStatus::Unknown, "noop", true));
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn granted_requires_known_gdpr_applicability() {
        let (manager, store) = manager();
        let broadcasts = counting_observer(&manager);

        assert!(!manager.set_status(ConsentStatus::Granted, "too early", true));
        assert_eq!(manager.current_status(), ConsentStatus::Unknown);
        assert_eq!(store.load().status, ConsentStatus::Unknown);
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn whitelist_exception_allows_grant_without_gdpr_determination() {
        let (manager, _) = manager();

        assert!(manager.set_status(ConsentStatus::PotentialWhitelist, "whitelisted", false));
        assert!(manager.set_status(ConsentStatus::Granted, "whitelist grant", false));
        assert_eq!(manager.current_status(), ConsentStatus::Granted);
    }

    #[test]
    fn denied_and_do_not_track_are_always_reachable() {
        let (manager, _) = manager();

        assert!(manager.set_status(ConsentStatus::Denied, "user declined", false));
        assert!(manager.set_status(ConsentStatus::DoNotTrack, "limit ad tracking", false));
    }

    // === B) Persistence convergence ===

    #[test]
    fn persisted_record_matches_in_memory_after_each_call() {
        let (manager, store) = manager();
        grantable(&manager);

        for (status, reason) in [
            (ConsentStatus::Granted, "user accepted"),
            (ConsentStatus::Denied, "user revoked"),
            (ConsentStatus::DoNotTrack, "limit ad tracking"),
        ] {
            assert!(manager.set_status(status, reason, false));
            assert_eq!(store.load(), manager.record());
        }
    }

    #[test]
    fn persistence_precedes_broadcast() {
        let (manager, store) = manager();
        grantable(&manager);

        let persisted_at_notify = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&persisted_at_notify);
        manager.observe(move |change| {
            *slot.lock().unwrap() = Some((store.load().status, change.new_status));
        });

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", true));
        let (persisted, notified) = persisted_at_notify.lock().unwrap().unwrap();
        assert_eq!(persisted, notified);
        assert_eq!(persisted, ConsentStatus::Granted);
    }

    // === C) GDPR applicability ===

    #[test]
    fn gdpr_downgrade_to_unknown_is_rejected() {
        let (manager, _) = manager();
        grantable(&manager);

        let err = manager
            .set_is_gdpr_applicable(GdprApplicability::Unknown)
            .unwrap_err();
        assert!(matches!(err, ConsentError::GdprDowngrade { .. }));
        assert_eq!(
            manager.is_gdpr_applicable(),
            GdprApplicability::Applicable
        );
    }

    #[test]
    fn gdpr_can_flip_between_determined_values() {
        let (manager, _) = manager();
        grantable(&manager);

        manager
            .set_is_gdpr_applicable(GdprApplicability::NotApplicable)
            .unwrap();
        assert_eq!(
            manager.is_gdpr_applicable(),
            GdprApplicability::NotApplicable
        );
    }

    // === D) Observers ===

    #[test]
    fn observers_receive_old_and_new_status_in_registration_order() {
        let (manager, _) = manager();
        grantable(&manager);

        let deliveries = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = Arc::clone(&deliveries);
            manager.observe(move |change: &ConsentChange| {
                log.lock().unwrap().push((tag, change.clone()));
            });
        }

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", true));

        let deliveries = deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].0, "first");
        assert_eq!(deliveries[1].0, "second");
        for (_, change) in deliveries.iter() {
            assert_eq!(change.old_status, ConsentStatus::Unknown);
            assert_eq!(change.new_status, ConsentStatus::Granted);
            assert_eq!(change.reason.as_deref(), Some("user accepted"));
            assert!(change.can_collect_personal_info);
        }
    }

    #[test]
    fn panicking_observer_does_not_skip_later_observers() {
        let (manager, _) = manager();
        grantable(&manager);

        manager.observe(|_| panic!("misbehaving observer"));
        let broadcasts = counting_observer(&manager);

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", true));
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unobserve_stops_delivery() {
        let (manager, _) = manager();
        grantable(&manager);

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = manager.observe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        manager.unobserve(id);

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", true));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn should_broadcast_false_suppresses_notification_but_persists() {
        let (manager, store) = manager();
        grantable(&manager);
        let broadcasts = counting_observer(&manager);

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", false));
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
        assert_eq!(store.load().status, ConsentStatus::Granted);
    }

    // === E) Server sync merge ===

    #[test]
    fn server_merge_broadcasts_at_most_once() {
        let (manager, store) = manager();
        let broadcasts = counting_observer(&manager);

        let payload = ConsentSyncPayload {
            status: Some("denied".to_string()),
            is_gdpr_region: Some("1".to_string()),
            privacy_policy_version: Some("4".to_string()),
            vendor_list_version: Some("9".to_string()),
            consent_change_reason: Some("server push".to_string()),
        };
        assert!(manager.update_consent_state(&payload));

        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        let record = store.load();
        assert_eq!(record.status, ConsentStatus::Denied);
        assert_eq!(record.gdpr_applicability, GdprApplicability::Applicable);
        assert_eq!(record.consented_privacy_policy_version.as_deref(), Some("4"));
        assert_eq!(record.consented_vendor_list_version.as_deref(), Some("9"));
        assert_eq!(record.last_changed_reason.as_deref(), Some("server push"));
    }

    #[test]
    fn server_merge_skips_invalid_fields_independently() {
        let (manager, _) = manager();

        let payload = ConsentSyncPayload {
            status: Some("revoked".to_string()),
            is_gdpr_region: Some("perhaps".to_string()),
            privacy_policy_version: Some("4".to_string()),
            ..Default::default()
        };
        assert!(manager.update_consent_state(&payload));

        let record = manager.record();
        assert_eq!(record.status, ConsentStatus::Unknown);
        assert_eq!(record.gdpr_applicability, GdprApplicability::Unknown);
        assert_eq!(record.consented_privacy_policy_version.as_deref(), Some("4"));
    }

    #[test]
    fn server_merge_with_no_effective_change_returns_false() {
        let (manager, _) = manager();
        let broadcasts = counting_observer(&manager);

        assert!(!manager.update_consent_state(&ConsentSyncPayload::default()));
        assert!(!manager.update_consent_state(&ConsentSyncPayload {
            status: Some("unknown".to_string()),
            ..Default::default()
        }));
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sync_payload_parses_from_server_json() {
        let payload = ConsentSyncPayload::from_json(
            r#"{"status":"granted","is_gdpr_region":"1","unrelated_key":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(payload.status.as_deref(), Some("granted"));
        assert_eq!(payload.is_gdpr_region.as_deref(), Some("1"));
        assert!(payload.privacy_policy_version.is_none());
    }

    // === F) IFA lifecycle ===

    #[test]
    fn ifa_latches_on_grant_and_clears_on_revoke() {
        let (manager, store) = manager();
        grantable(&manager);
        manager.set_device_ifa(Some("device-ifa-1"));

        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", false));
        assert_eq!(manager.ifa_for_consent().as_deref(), Some("device-ifa-1"));
        assert_eq!(store.load_ifa().as_deref(), Some("device-ifa-1"));

        assert!(manager.set_status(ConsentStatus::Denied, "user revoked", false));
        assert!(manager.ifa_for_consent().is_none());
        assert!(store.load_ifa().is_none());
    }

    // === G) Reset ===

    #[test]
    fn reset_returns_record_to_defaults_and_broadcasts() {
        let (manager, store) = manager();
        grantable(&manager);
        assert!(manager.set_status(ConsentStatus::Granted, "user accepted", false));

        let broadcasts = counting_observer(&manager);
        manager.reset("reinstall");

        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        let record = manager.record();
        assert_eq!(record.status, ConsentStatus::Unknown);
        assert_eq!(record.gdpr_applicability, GdprApplicability::Unknown);
        assert_eq!(record.last_changed_reason.as_deref(), Some("reinstall"));
        assert_eq!(store.load().status, ConsentStatus::Unknown);
    }

    // === H) Seeding ===

    #[test]
    fn manager_seeds_from_persisted_record() {
        let store = ConsentStore::memory().unwrap();
        let record = ConsentRecord {
            status: ConsentStatus::Denied,
            gdpr_applicability: GdprApplicability::Applicable,
            ..Default::default()
        };
        store.save(&record).unwrap();

        let manager = ConsentManager::new(store);
        assert_eq!(manager.current_status(), ConsentStatus::Denied);
        assert_eq!(manager.is_gdpr_applicable(), GdprApplicability::Applicable);
    }
}
