use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub autolock: AutoLockPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Override for the agent socket path.  Defaults to
    /// `$XDG_RUNTIME_DIR/keyhold/agent.sock` when unset.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Lifetime applied to keys added without an explicit lifetime
    /// constraint.  `None` means keys live until removed or the daemon exits.
    #[serde(default)]
    pub default_key_lifetime_secs: Option<u64>,

    /// Hard cap on client-requested lifetimes.  Requests above the cap are
    /// clamped, not refused.
    #[serde(default)]
    pub max_key_lifetime_secs: Option<u64>,
}

/// Timer-based eviction policy enforced by the daemon.
///
/// Both timeouts clear the whole store — the agent model has no per-key
/// notion of "relock", only removal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoLockPolicy {
    /// Evict all keys after this many minutes without a sign or list request.
    #[serde(default)]
    pub idle_timeout_minutes: Option<u64>,

    /// Evict all keys this many minutes after the most recent add, regardless
    /// of activity.
    #[serde(default)]
    pub max_unlocked_minutes: Option<u64>,
}

/// Load the config file at `path`, falling back to defaults if it does not
/// exist.
///
/// Warns if the file is readable by group or others — it is not secret
/// itself, but a writable config could redirect the agent socket.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode & 0o777),
                    "config file is accessible by group or others — recommend: chmod 600 {}",
                    path.display()
                );
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.agent.socket_path.is_none());
        assert!(config.agent.default_key_lifetime_secs.is_none());
        assert!(config.autolock.idle_timeout_minutes.is_none());
    }

    #[test]
    fn partial_sections_fill_in() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            default_key_lifetime_secs = 3600

            [autolock]
            max_unlocked_minutes = 480
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.default_key_lifetime_secs, Some(3600));
        assert_eq!(config.agent.max_key_lifetime_secs, None);
        assert_eq!(config.autolock.max_unlocked_minutes, Some(480));
        assert_eq!(config.autolock.idle_timeout_minutes, None);
    }

    #[test]
    fn socket_path_override() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            socket_path = "/tmp/test-agent.sock"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.agent.socket_path.as_deref(),
            Some(Path::new("/tmp/test-agent.sock"))
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("nope.toml")).unwrap();
        assert!(config.agent.socket_path.is_none());
    }

    #[test]
    fn garbage_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent\nbroken").unwrap();
        assert!(load(&path).is_err());
    }
}
