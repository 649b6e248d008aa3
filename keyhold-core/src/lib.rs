//! Shared foundation for the keyhold agent: configuration, path resolution,
//! the `authorized_keys` file model, and the crate-wide error type.
//!
//! Key material itself never lives in this crate — the in-memory store and
//! the agent protocol are in `keyhold-agent`.

pub mod authorized_keys;
pub mod config;
pub mod paths;

/// Crate-wide mutex for tests that mutate environment variables.
///
/// The `paths` tests call `env::set_var`; a single process-wide lock
/// prevents races when they run in parallel in the same test binary.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(thiserror::Error, Debug)]
pub enum KeyholdError {
    /// `XDG_RUNTIME_DIR` (or an explicit override) is required to place the
    /// agent socket somewhere private.
    #[error("cannot resolve agent socket path: {0}")]
    SocketPath(String),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("authorized_keys line {line} is not a valid public key: {source}")]
    AuthorizedKeysParse { line: usize, source: ssh_key::Error },

    #[error("not a valid private key: {0}")]
    KeyParse(#[source] ssh_key::Error),

    /// The key file is encrypted and no passphrase was supplied.
    #[error("private key is encrypted; passphrase required")]
    PassphraseRequired,

    #[error("incorrect passphrase")]
    WrongPassphrase,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = KeyholdError> = std::result::Result<T, E>;
