//! `authorized_keys` file handling.
//!
//! Models the server-side half of public-key provisioning: reading an
//! existing `authorized_keys` file, checking membership, and idempotently
//! appending a key with the file modes sshd insists on (0700 directory,
//! 0600 file).
//!
//! Lines that do not parse as public keys are preserved verbatim on
//! rewrite — an operator's hand-edited file must survive a round trip even
//! when it contains option-prefixed entries this crate does not model.

use std::path::Path;

use ssh_key::PublicKey;

use crate::{KeyholdError, Result};

/// One line of an `authorized_keys` file.
#[derive(Debug, Clone)]
pub enum Line {
    Blank,
    /// A `#`-prefixed comment line, stored without the newline.
    Comment(String),
    Key(PublicKey),
    /// A line that did not parse as a bare public key (e.g. one carrying
    /// sshd options like `command="..."`).  Kept verbatim.
    Foreign(String),
}

/// Parsed view of an `authorized_keys` file.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeysFile {
    lines: Vec<Line>,
}

impl AuthorizedKeysFile {
    /// Parse file contents.  Never fails: lines that are not bare public
    /// keys become [`Line::Foreign`] and survive a rewrite unchanged.
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    Line::Blank
                } else if trimmed.starts_with('#') {
                    Line::Comment(raw.to_string())
                } else {
                    match PublicKey::from_openssh(trimmed) {
                        Ok(key) => Line::Key(key),
                        Err(_) => Line::Foreign(raw.to_string()),
                    }
                }
            })
            .collect();
        Self { lines }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Iterate the parsed public keys.
    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.lines.iter().filter_map(|l| match l {
            Line::Key(k) => Some(k),
            _ => None,
        })
    }

    /// Membership by key material — comments and option prefixes are
    /// irrelevant to whether sshd will accept the key.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys().any(|k| k.key_data() == key.key_data())
    }

    /// Number of lines preserved verbatim because they did not parse.
    pub fn foreign_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, Line::Foreign(_)))
            .count()
    }
}

/// Read the first public key from `path` (a `.pub` file).
///
/// Blank lines and `#` comments before the key are skipped; the first
/// remaining line must parse, and its 1-based line number is reported on
/// failure.
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let text = std::fs::read_to_string(path)?;
    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        return PublicKey::from_openssh(trimmed)
            .map_err(|source| KeyholdError::AuthorizedKeysParse { line: idx + 1, source });
    }
    Err(KeyholdError::AuthorizedKeysParse {
        line: 1,
        source: ssh_key::Error::FormatEncoding,
    })
}

/// Idempotently add `key` to `<ssh_dir>/authorized_keys`.
///
/// Creates `ssh_dir` with mode 0700 and the file with mode 0600; existing
/// too-open modes are tightened.  Returns `true` if the key was appended,
/// `false` if it was already present.
pub fn authorize(ssh_dir: &Path, key: &PublicKey) -> Result<bool> {
    use std::io::Write as _;

    ensure_private_dir(ssh_dir)?;

    let path = ssh_dir.join("authorized_keys");
    let file = AuthorizedKeysFile::load(&path)?;
    if file.contains(key) {
        tracing::debug!(
            fingerprint = %key.fingerprint(ssh_key::HashAlg::Sha256),
            "key already authorized"
        );
        tighten_file_mode(&path)?;
        return Ok(false);
    }

    let line = key
        .to_openssh()
        .map_err(|e| anyhow::anyhow!("serialize public key: {e}"))?;

    let mut f = open_append_0600(&path)?;
    writeln!(f, "{line}")?;
    tighten_file_mode(&path)?;

    tracing::info!(
        path = %path.display(),
        fingerprint = %key.fingerprint(ssh_key::HashAlg::Sha256),
        "authorized key appended"
    );
    Ok(true)
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};
        if !dir.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)?;
        } else {
            let meta = std::fs::metadata(dir)?;
            if meta.permissions().mode() & 0o077 != 0 {
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn open_append_0600(path: &Path) -> Result<std::fs::File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(0o600);
    }
    Ok(opts.open(path)?)
}

fn tighten_file_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let meta = std::fs::metadata(path)?;
        if meta.permissions().mode() & 0o077 != 0 {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}
