//! Adapter configuration resolution.
//!
//! Merge precedence, highest first:
//! 1. Local overrides (host application)
//! 2. Server parameters (ad server)
//!
//! The merge is pure: no defaulting, no key invention, and a deterministic
//! result for identical inputs regardless of input iteration order.

use std::collections::BTreeMap;

/// Merge server parameters with local overrides; overrides win per key.
///
/// Keys absent from both inputs are absent from the result.
pub fn resolve_parameters(
    server_parameters: &BTreeMap<String, String>,
    local_overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut resolved = server_parameters.clone();
    for (key, value) in local_overrides {
        resolved.insert(key.clone(), value.clone());
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::resolve_parameters;
    use std::collections::BTreeMap;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn local_overrides_win_for_shared_keys() {
        let server = map(&[("app_id", "server-app"), ("zone", "z1")]);
        let local = map(&[("app_id", "local-app")]);

        let resolved = resolve_parameters(&server, &local);
        assert_eq!(resolved.get("app_id").unwrap(), "local-app");
        assert_eq!(resolved.get("zone").unwrap(), "z1");
    }

    #[test]
    fn merge_is_pure_and_repeatable() {
        let server = map(&[("a", "1"), ("b", "2")]);
        let local = map(&[("b", "3"), ("c", "4")]);

        let first = resolve_parameters(&server, &local);
        let second = resolve_parameters(&server, &local);
        assert_eq!(first, second);
        assert_eq!(first, map(&[("a", "1"), ("b", "3"), ("c", "4")]));
    }

    #[test]
    fn unspecified_keys_are_omitted() {
        let resolved = resolve_parameters(&BTreeMap::new(), &BTreeMap::new());
        assert!(resolved.is_empty());

        let resolved = resolve_parameters(&map(&[("only", "server")]), &BTreeMap::new());
        assert_eq!(resolved.len(), 1);
    }
}
