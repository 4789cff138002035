//! Provider configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the provisioning engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Directory under which per-instance staging directories are created.
    #[serde(default = "ProviderConfig::default_staging_root")]
    pub staging_root: PathBuf,

    /// Ceiling for restart/terminate waits on a status change, in milliseconds.
    #[serde(default = "ProviderConfig::default_status_wait_timeout")]
    pub status_wait_timeout_ms: u64,

    /// Pause between stopping and starting a worker during restart, in milliseconds.
    #[serde(default = "ProviderConfig::default_restart_settle")]
    pub restart_settle_ms: u64,

    /// Delay before a one-shot instance whose worker stopped on its own is
    /// cleaned up, in milliseconds.
    #[serde(default = "ProviderConfig::default_cleanup_grace")]
    pub cleanup_grace_ms: u64,
}

impl ProviderConfig {
    fn default_staging_root() -> PathBuf {
        std::env::temp_dir()
    }

    const fn default_status_wait_timeout() -> u64 {
        30_000
    }

    const fn default_restart_settle() -> u64 {
        3_000
    }

    const fn default_cleanup_grace() -> u64 {
        1_000
    }

    /// Create a config that stages under the given root, other values default.
    #[must_use]
    pub fn with_staging_root(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `LOCAL_CLOUD_STAGING_ROOT`: directory for staging directories
    /// - `LOCAL_CLOUD_STATUS_TIMEOUT_MS`: status wait ceiling
    /// - `LOCAL_CLOUD_RESTART_SETTLE_MS`: restart settle delay
    /// - `LOCAL_CLOUD_CLEANUP_GRACE_MS`: deferred cleanup delay
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LOCAL_CLOUD_STAGING_ROOT") {
            config.staging_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LOCAL_CLOUD_STATUS_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.status_wait_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("LOCAL_CLOUD_RESTART_SETTLE_MS") {
            if let Ok(n) = val.parse() {
                config.restart_settle_ms = n;
            }
        }
        if let Ok(val) = std::env::var("LOCAL_CLOUD_CLEANUP_GRACE_MS") {
            if let Ok(n) = val.parse() {
                config.cleanup_grace_ms = n;
            }
        }

        config
    }

    /// Get the status wait ceiling as a `Duration`.
    #[must_use]
    pub const fn status_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.status_wait_timeout_ms)
    }

    /// Get the restart settle delay as a `Duration`.
    #[must_use]
    pub const fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// Get the deferred cleanup delay as a `Duration`.
    #[must_use]
    pub const fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            staging_root: Self::default_staging_root(),
            status_wait_timeout_ms: Self::default_status_wait_timeout(),
            restart_settle_ms: Self::default_restart_settle(),
            cleanup_grace_ms: Self::default_cleanup_grace(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ProviderConfig::default();
        assert_eq!(config.status_wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart_settle(), Duration::from_secs(3));
        assert_eq!(config.cleanup_grace(), Duration::from_secs(1));
        assert_eq!(config.staging_root, std::env::temp_dir());
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: ProviderConfig =
            serde_json::from_str(r#"{"staging_root":"/srv/staging","restart_settle_ms":10}"#)
                .unwrap();
        assert_eq!(config.staging_root, PathBuf::from("/srv/staging"));
        assert_eq!(config.restart_settle(), Duration::from_millis(10));
        assert_eq!(config.status_wait_timeout_ms, 30_000);
    }

    #[test]
    fn with_staging_root_keeps_other_defaults() {
        let config = ProviderConfig::with_staging_root("/tmp/x");
        assert_eq!(config.staging_root, PathBuf::from("/tmp/x"));
        assert_eq!(config.cleanup_grace_ms, 1_000);
    }
}
