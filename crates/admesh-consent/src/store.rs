//! ConsentStore: SQLite-backed persistence for consent fields.
//!
//! Each consent field is its own row so that partial reads (for example the
//! IFA-for-consent identifier on a pre-existing install) do not deserialize
//! the whole record. Writes are best-effort from the caller's point of
//! view: `load` never fails, and `save` rewrites every field so a failed
//! write is reconciled by the next successful one.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::ConsentResult;
use crate::record::ConsentRecord;
use crate::status::{ConsentStatus, GdprApplicability};

/// Storage key for the IFA-for-consent identifier.
///
/// Read and written independently of the rest of the record for
/// compatibility with installs that predate the full consent record.
pub const IFA_FOR_CONSENT_KEY: &str = "ifa_for_consent";

const STATUS_KEY: &str = "status";
const GDPR_KEY: &str = "gdpr_applicability";
const PRIVACY_POLICY_VERSION_KEY: &str = "privacy_policy_version";
const VENDOR_LIST_VERSION_KEY: &str = "vendor_list_version";
const LAST_CHANGED_REASON_KEY: &str = "last_changed_reason";
const LAST_CHANGED_AT_KEY: &str = "last_changed_at";

const CONSENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS consent_fields (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed consent field store.
#[derive(Clone)]
pub struct ConsentStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConsentStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> ConsentResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> ConsentResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> ConsentResult<()> {
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.execute_batch(CONSENT_SCHEMA)?;
        Ok(())
    }

    /// Load the persisted record.
    ///
    /// Never fails the caller: a missing record yields the defaults, and an
    /// unreadable field falls back to its default with a warning.
    pub fn load(&self) -> ConsentRecord {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "consent store unreadable, falling back to defaults");
                ConsentRecord::default()
            }
        }
    }

    fn try_load(&self) -> ConsentResult<ConsentRecord> {
        let conn = self.conn.lock().unwrap();

        let status = match read_field(&conn, STATUS_KEY)? {
            Some(token) => ConsentStatus::parse(&token).unwrap_or_else(|| {
                warn!(token = %token, "unrecognized consent status token, defaulting to unknown");
                ConsentStatus::Unknown
            }),
            None => ConsentStatus::Unknown,
        };

        let gdpr_applicability = match read_field(&conn, GDPR_KEY)? {
            Some(token) => GdprApplicability::parse(&token).unwrap_or_else(|| {
                warn!(token = %token, "unrecognized gdpr token, defaulting to unknown");
                GdprApplicability::Unknown
            }),
            None => GdprApplicability::Unknown,
        };

        let last_changed_at = match read_field(&conn, LAST_CHANGED_AT_KEY)? {
            Some(ts) => match DateTime::parse_from_rfc3339(&ts) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(e) => {
                    warn!(error = %e, "invalid last_changed_at timestamp, dropping");
                    None
                }
            },
            None => None,
        };

        Ok(ConsentRecord {
            status,
            gdpr_applicability,
            consented_privacy_policy_version: read_field(&conn, PRIVACY_POLICY_VERSION_KEY)?,
            consented_vendor_list_version: read_field(&conn, VENDOR_LIST_VERSION_KEY)?,
            ifa_for_consent: read_field(&conn, IFA_FOR_CONSENT_KEY)?,
            last_changed_reason: read_field(&conn, LAST_CHANGED_REASON_KEY)?,
            last_changed_at,
        })
    }

    /// Persist every field of `record` in one transaction.
    ///
    /// Callers treat failure as non-fatal; the in-memory record stays
    /// authoritative and the next save rewrites all fields.
    pub fn save(&self, record: &ConsentRecord) -> ConsentResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = Self::save_inner(&conn, record);
        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }

    fn save_inner(conn: &Connection, record: &ConsentRecord) -> ConsentResult<()> {
        write_field(conn, STATUS_KEY, Some(record.status.as_str()))?;
        write_field(conn, GDPR_KEY, Some(record.gdpr_applicability.as_str()))?;
        write_field(
            conn,
            PRIVACY_POLICY_VERSION_KEY,
            record.consented_privacy_policy_version.as_deref(),
        )?;
        write_field(
            conn,
            VENDOR_LIST_VERSION_KEY,
            record.consented_vendor_list_version.as_deref(),
        )?;
        write_field(
            conn,
            LAST_CHANGED_REASON_KEY,
            record.last_changed_reason.as_deref(),
        )?;
        let last_changed_at = record.last_changed_at.map(|t| t.to_rfc3339());
        write_field(conn, LAST_CHANGED_AT_KEY, last_changed_at.as_deref())?;
        write_field(conn, IFA_FOR_CONSENT_KEY, record.ifa_for_consent.as_deref())?;
        Ok(())
    }

    /// Read the IFA-for-consent identifier without loading the full record.
    pub fn load_ifa(&self) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        match read_field(&conn, IFA_FOR_CONSENT_KEY) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to read ifa_for_consent");
                None
            }
        }
    }

    /// Write the IFA-for-consent identifier independently of the record.
    pub fn save_ifa(&self, ifa: Option<&str>) -> ConsentResult<()> {
        let conn = self.conn.lock().unwrap();
        write_field(&conn, IFA_FOR_CONSENT_KEY, ifa)
    }
}

fn read_field(conn: &Connection, key: &str) -> ConsentResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM consent_fields WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn write_field(conn: &Connection, key: &str, value: Option<&str>) -> ConsentResult<()> {
    match value {
        Some(v) => {
            conn.execute(
                r#"
                INSERT INTO consent_fields (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![key, v],
            )?;
        }
        None => {
            conn.execute("DELETE FROM consent_fields WHERE key = ?1", [key])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_record() -> ConsentRecord {
        ConsentRecord {
            status: ConsentStatus::Granted,
            gdpr_applicability: GdprApplicability::Applicable,
            consented_privacy_policy_version: Some("3".to_string()),
            consented_vendor_list_version: Some("7".to_string()),
            ifa_for_consent: Some("ifa-1234".to_string()),
            last_changed_reason: Some("user accepted".to_string()),
            last_changed_at: Some(Utc::now()),
        }
    }

    // === A) Load defaults ===

    #[test]
    fn load_on_empty_store_returns_defaults() {
        let store = ConsentStore::memory().unwrap();
        assert_eq!(store.load(), ConsentRecord::default());
    }

    #[test]
    fn load_defaults_unrecognized_tokens() {
        let store = ConsentStore::memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            write_field(&conn, STATUS_KEY, Some("revoked")).unwrap();
            write_field(&conn, GDPR_KEY, Some("maybe")).unwrap();
            write_field(&conn, LAST_CHANGED_AT_KEY, Some("not-a-timestamp")).unwrap();
        }

        let record = store.load();
        assert_eq!(record.status, ConsentStatus::Unknown);
        assert_eq!(record.gdpr_applicability, GdprApplicability::Unknown);
        assert!(record.last_changed_at.is_none());
    }

    // === B) Round trips ===

    #[test]
    fn save_then_load_round_trips_every_field() {
        let store = ConsentStore::memory().unwrap();
        let record = test_record();

        store.save(&record).unwrap();
        let loaded = store.load();

        assert_eq!(loaded.status, record.status);
        assert_eq!(loaded.gdpr_applicability, record.gdpr_applicability);
        assert_eq!(
            loaded.consented_privacy_policy_version,
            record.consented_privacy_policy_version
        );
        assert_eq!(
            loaded.consented_vendor_list_version,
            record.consented_vendor_list_version
        );
        assert_eq!(loaded.ifa_for_consent, record.ifa_for_consent);
        assert_eq!(loaded.last_changed_reason, record.last_changed_reason);
        // RFC 3339 keeps sub-second precision, but compare with tolerance anyway
        let diff = (loaded.last_changed_at.unwrap() - record.last_changed_at.unwrap())
            .num_seconds()
            .abs();
        assert!(diff <= 1);
    }

    #[test]
    fn save_clears_fields_that_became_empty() {
        let store = ConsentStore::memory().unwrap();
        store.save(&test_record()).unwrap();

        let mut record = test_record();
        record.ifa_for_consent = None;
        record.consented_privacy_policy_version = None;
        store.save(&record).unwrap();

        let loaded = store.load();
        assert!(loaded.ifa_for_consent.is_none());
        assert!(loaded.consented_privacy_policy_version.is_none());
    }

    // === C) Independent IFA key ===

    #[test]
    fn ifa_is_readable_without_the_rest_of_the_record() {
        let store = ConsentStore::memory().unwrap();
        store.save(&test_record()).unwrap();

        assert_eq!(store.load_ifa().as_deref(), Some("ifa-1234"));
    }

    #[test]
    fn ifa_is_writable_independently() {
        let store = ConsentStore::memory().unwrap();

        store.save_ifa(Some("legacy-ifa")).unwrap();
        assert_eq!(store.load_ifa().as_deref(), Some("legacy-ifa"));
        assert_eq!(store.load().ifa_for_consent.as_deref(), Some("legacy-ifa"));

        store.save_ifa(None).unwrap();
        assert!(store.load_ifa().is_none());
    }

    // === D) File-backed persistence ===

    #[test]
    fn record_survives_reopening_the_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("consent.db");

        {
            let store = ConsentStore::open(&path).unwrap();
            store.save(&test_record()).unwrap();
        }

        let reopened = ConsentStore::open(&path).unwrap();
        let loaded = reopened.load();
        assert_eq!(loaded.status, ConsentStatus::Granted);
        assert_eq!(loaded.ifa_for_consent.as_deref(), Some("ifa-1234"));
    }
}
