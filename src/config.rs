use std::path::PathBuf;
use std::time::Duration;

use crate::limits::DEFAULT_LOCK_TIMEOUT;

use crate::time::{DEFAULT_CHECK_IN_TIME, parse_flexible_time};

/// Process configuration, read from `INNKEEP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Property name; the WAL lives at `{data_dir}/{property}.wal`.
    pub property: String,
    /// Normalized `HH:MM` used when a check-in time is missing or unreadable.
    pub default_check_in_time: String,
    pub compact_threshold: u64,
    /// How long a write waits for its room locks.
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            property: "default".into(),
            default_check_in_time: DEFAULT_CHECK_IN_TIME.into(),
            compact_threshold: 1000,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            metrics_port: None,
            log_filter: "info".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let property: String = lookup("INNKEEP_PROPERTY")
            .map(|p| {
                p.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                    .collect()
            })
            .filter(|p: &String| !p.is_empty())
            .unwrap_or(defaults.property);
        Self {
            data_dir: lookup("INNKEEP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            property,
            default_check_in_time: lookup("INNKEEP_DEFAULT_CHECK_IN_TIME")
                .map(|t| parse_flexible_time(&t, DEFAULT_CHECK_IN_TIME))
                .unwrap_or(defaults.default_check_in_time),
            compact_threshold: lookup("INNKEEP_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: lookup("INNKEEP_LOCK_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            metrics_port: lookup("INNKEEP_METRICS_PORT").and_then(|s| s.parse().ok()),
            log_filter: lookup("INNKEEP_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.wal", self.property))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/default.wal"));
        assert_eq!(cfg.default_check_in_time, "14:00");
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(10));
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn reads_and_normalizes_values() {
        let cfg = config_from(&[
            ("INNKEEP_DATA_DIR", "/var/lib/innkeep"),
            ("INNKEEP_PROPERTY", "../hotel sol"),
            ("INNKEEP_DEFAULT_CHECK_IN_TIME", "3:00 pm"),
            ("INNKEEP_COMPACT_THRESHOLD", "50"),
            ("INNKEEP_LOCK_TIMEOUT_MS", "2500"),
            ("INNKEEP_METRICS_PORT", "9100"),
        ]);
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/innkeep/hotelsol.wal"));
        assert_eq!(cfg.default_check_in_time, "15:00");
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.lock_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let cfg = config_from(&[
            ("INNKEEP_COMPACT_THRESHOLD", "lots"),
            ("INNKEEP_DEFAULT_CHECK_IN_TIME", "whenever"),
        ]);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.default_check_in_time, "14:00");
    }
}
