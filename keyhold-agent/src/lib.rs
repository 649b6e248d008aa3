//! SSH agent core for keyhold.
//!
//! Holds decrypted private keys in memory and answers signing challenges
//! over the standard OpenSSH agent protocol.  Backed by a shared
//! [`KeyStore`] that `keyholdd` drains on expiry and auto-lock.
//!
//! # Architecture
//!
//! ```text
//! keyholdd ────── KeyStore (Arc<RwLock<…>>) ──────► SshAgent (listen)
//!  │                   ▲                                   │
//!  │   expiry reaper,  │                            UnixListener
//!  └── auto-lock ──────┘                                   │
//!                                                   per-connection
//!                                               session (clone of store)
//! ```
//!
//! Keys arrive over the socket (`keyhold add`, `ssh-add`) as decrypted
//! key material; encrypted key files are decrypted client-side in the CLI,
//! exactly as `ssh-add` does.

pub mod keystore;
pub mod pem;
pub mod session;

pub use keystore::{KeyEntry, KeyStore};
pub use session::{LifetimePolicy, SshAgent};
