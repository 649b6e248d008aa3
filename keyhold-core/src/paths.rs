//! Path resolution for the agent socket and config file.
//!
//! Both binaries resolve paths through here so `keyhold` and `keyholdd`
//! always agree on where the socket lives.

use std::path::PathBuf;

use crate::{KeyholdError, Result};

/// Name of the environment variable OpenSSH clients use to find the agent.
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Default agent socket: `$XDG_RUNTIME_DIR/keyhold/agent.sock`.
///
/// Errors if `XDG_RUNTIME_DIR` is unset — the runtime dir is the only
/// standard location that is guaranteed per-user and mode 0700, and guessing
/// a world-readable fallback (e.g. `/tmp`) would undermine the socket's
/// access control.
pub fn default_socket_path() -> Result<PathBuf> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").ok_or_else(|| {
        KeyholdError::SocketPath(
            "XDG_RUNTIME_DIR is not set; pass --socket or set agent.socket_path".into(),
        )
    })?;
    Ok(PathBuf::from(runtime_dir).join("keyhold").join("agent.sock"))
}

/// Socket path as a client should resolve it: `$SSH_AUTH_SOCK` first, then
/// the daemon default.
pub fn client_socket_path() -> Result<PathBuf> {
    if let Some(sock) = std::env::var_os(SSH_AUTH_SOCK) {
        return Ok(PathBuf::from(sock));
    }
    default_socket_path()
}

/// Default config file: `$XDG_CONFIG_HOME/keyhold/config.toml`, falling back
/// to `~/.config/keyhold/config.toml`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("keyhold").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_requires_runtime_dir() {
        let _guard = crate::TEST_ENV_MUTEX.lock().unwrap();
        let saved = std::env::var_os("XDG_RUNTIME_DIR");

        unsafe { std::env::remove_var("XDG_RUNTIME_DIR") };
        assert!(default_socket_path().is_err());

        unsafe { std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000") };
        let path = default_socket_path().unwrap();
        assert_eq!(path, PathBuf::from("/run/user/1000/keyhold/agent.sock"));

        match saved {
            Some(v) => unsafe { std::env::set_var("XDG_RUNTIME_DIR", v) },
            None => unsafe { std::env::remove_var("XDG_RUNTIME_DIR") },
        }
    }

    #[test]
    fn client_prefers_ssh_auth_sock() {
        let _guard = crate::TEST_ENV_MUTEX.lock().unwrap();
        let saved = std::env::var_os(SSH_AUTH_SOCK);

        unsafe { std::env::set_var(SSH_AUTH_SOCK, "/tmp/other-agent.sock") };
        assert_eq!(
            client_socket_path().unwrap(),
            PathBuf::from("/tmp/other-agent.sock")
        );

        match saved {
            Some(v) => unsafe { std::env::set_var(SSH_AUTH_SOCK, v) },
            None => unsafe { std::env::remove_var(SSH_AUTH_SOCK) },
        }
    }
}
