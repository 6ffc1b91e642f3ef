//! Operational configuration, persisted in the store's `config` table.
//!
//! Keys are accepted with hyphens or underscores at every boundary; the
//! persisted canonical form uses underscores. Reads fall back to the
//! defaults below when a key was never set.

use crate::error::Result;
use crate::store::Store;

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_DB_PATH: &str = "./data/queuectl.db";

/// Recognized keys and their defaults. Anything else is rejected by
/// `config set`.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("max_retries", "3"),
    ("backoff_base", "2"),
    ("worker_poll_interval", "1"),
    ("db_path", DEFAULT_DB_PATH),
    ("job_timeout", "300"),
    ("backoff_max_delay", "3600"),
    ("lease_slack", "60"),
];

/// Canonical key form: hyphens become underscores.
pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

pub fn is_known(key: &str) -> bool {
    DEFAULTS.iter().any(|(k, _)| *k == key)
}

pub fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

pub fn known_keys() -> Vec<&'static str> {
    DEFAULTS.iter().map(|(k, _)| *k).collect()
}

/// Read a numeric key, falling back to its default when unset or
/// unparsable. Storage failures still propagate.
pub fn get_u64(store: &Store, key: &str) -> Result<u64> {
    if let Some(value) = store.config_get(key)? {
        if let Ok(n) = value.parse() {
            return Ok(n);
        }
        tracing::warn!(key, value, "ignoring unparsable config value");
    }
    Ok(default_for(&normalize_key(key))
        .and_then(|d| d.parse().ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_to_underscores() {
        assert_eq!(normalize_key("max-retries"), "max_retries");
        assert_eq!(normalize_key("max_retries"), "max_retries");
        assert_eq!(normalize_key("backoff-max-delay"), "backoff_max_delay");
    }

    #[test]
    fn defaults_cover_every_known_key() {
        for key in known_keys() {
            assert!(default_for(key).is_some());
        }
        assert!(!is_known("job-timeout"), "lookup expects canonical form");
        assert!(is_known("job_timeout"));
    }
}
