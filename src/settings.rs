use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Hub settings read from `settings.toml`.
///
/// Every field has a default so a partial or missing file still produces a
/// complete value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    /// Seconds between health monitor cycles
    pub monitor_interval_secs: u64,
    /// Seconds a `fetch` waits for an answer before giving up
    pub request_timeout_secs: u64,
    /// Pause before a crashed worker is relaunched (0 = immediately)
    pub restart_delay_ms: u64,
    /// Seconds between socket heartbeat probes
    pub heartbeat_interval_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 5,
            request_timeout_secs: 10,
            restart_delay_ms: 0,
            heartbeat_interval_secs: 5,
        }
    }
}

impl HubSettings {
    /// Load settings, falling back to defaults on a missing or unreadable file.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Falling back to default settings: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading hub settings");

        if !path.exists() {
            tracing::trace!("Settings file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
