//! Consent-dialog URL construction.
//!
//! Templates arrive from the ad server as positional `%@` formats. The
//! builder substitutes language, consent status, and GDPR applicability in
//! that order and refuses to emit a partially substituted URL.

use tracing::debug;
use url::Url;

use crate::status::{ConsentStatus, GdprApplicability};

const PLACEHOLDER: &str = "%@";

/// Build a consent-dialog URL from a server-supplied `%@` template.
///
/// Substitution values are, in order: the ISO 639-1 language code, the
/// consent status token, and the GDPR applicability token. A template may
/// use fewer placeholders than there are values. Returns `None` when the
/// template has more placeholders than values, when the language code is
/// not two ASCII letters, or when the substituted string does not parse as
/// an absolute URL.
pub fn build_consent_url(
    format: &str,
    iso_language: &str,
    status: ConsentStatus,
    gdpr: GdprApplicability,
) -> Option<Url> {
    let language = normalize_language(iso_language)?;
    let values = [language.as_str(), status.as_str(), gdpr.as_str()];

    let mut rendered = String::with_capacity(format.len() + 16);
    let mut remainder = format;
    let mut next_value = 0;
    while let Some(idx) = remainder.find(PLACEHOLDER) {
        let Some(value) = values.get(next_value) else {
            debug!(template = format, "consent url template has too many placeholders");
            return None;
        };
        rendered.push_str(&remainder[..idx]);
        rendered.push_str(value);
        remainder = &remainder[idx + PLACEHOLDER.len()..];
        next_value += 1;
    }
    rendered.push_str(remainder);

    match Url::parse(&rendered) {
        Ok(url) => Some(url),
        Err(e) => {
            debug!(error = %e, "substituted consent url does not parse");
            None
        }
    }
}

fn normalize_language(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_lowercase())
    } else {
        None
    }
}
