use std::path::PathBuf;

use crate::paths::Paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    BridgehubRoot,
    BridgehubChannelFd,
    BridgehubDev,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::BridgehubRoot => "BRIDGEHUB_ROOT",
            EnvVar::BridgehubChannelFd => "BRIDGEHUB_CHANNEL_FD",
            EnvVar::BridgehubDev => "BRIDGEHUB_DEV",
        }
    }
}

const FALLBACK_DATA_DIR: &str = "~/.local/share";
const APP_SUBDIR: &str = "bridgehub";

/// Fd number the forked channel is handed to the worker on.
pub const CHANNEL_FD: i32 = 3;

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Storage root ($BRIDGEHUB_ROOT or ~/.local/share/bridgehub)
pub fn root_dir() -> PathBuf {
    let dir = env_opt(EnvVar::BridgehubRoot.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(APP_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved storage root");
    dir
}

pub fn paths() -> Paths {
    Paths::new(root_dir())
}

/// Development mode ($BRIDGEHUB_DEV); `dev` bridges are only listed when set.
pub fn dev_mode() -> bool {
    let dev = env_opt(EnvVar::BridgehubDev.as_str())
        .map(|v| is_truthy(&v))
        .unwrap_or(false);
    tracing::trace!(dev, "Development mode");
    dev
}

/// Inherited forked-channel fd ($BRIDGEHUB_CHANNEL_FD), present only in workers the hub spawned.
pub fn channel_fd() -> Option<i32> {
    let fd = env_opt(EnvVar::BridgehubChannelFd.as_str()).and_then(|s| s.parse().ok());
    tracing::trace!(fd = ?fd, "Forked channel fd");
    fd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" Yes "));
        assert!(is_truthy("ON"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("nope"));
    }

    #[test]
    fn env_var_names() {
        assert_eq!(EnvVar::BridgehubRoot.as_str(), "BRIDGEHUB_ROOT");
        assert_eq!(EnvVar::BridgehubChannelFd.as_str(), "BRIDGEHUB_CHANNEL_FD");
    }
}
