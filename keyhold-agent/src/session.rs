//! SSH agent session and listener.

use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use signature::Signer as _;
use ssh_agent_lib::agent::{Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Identity, KeyConstraint, RemoveIdentity,
    SignRequest,
};
use ssh_key::{HashAlg, PrivateKey, Signature};
use tracing::{debug, info, warn};

use crate::keystore::{KeyStore, build_entry};

/// Lifetime rules applied to incoming `add` requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifetimePolicy {
    /// Applied when the client supplies no lifetime constraint.
    pub default_lifetime: Option<Duration>,
    /// Client-requested lifetimes above this cap are clamped, not refused.
    pub max_lifetime: Option<Duration>,
}

impl LifetimePolicy {
    /// Resolve the expiry deadline for an add request.
    ///
    /// `requested` is the client's lifetime constraint in seconds; zero is
    /// rejected, matching OpenSSH.
    fn deadline(&self, requested: Option<u32>) -> Result<Option<Instant>, AgentError> {
        let lifetime = match requested {
            Some(0) => return Err(other_err("lifetime constraint of 0 seconds refused")),
            Some(secs) => {
                let mut d = Duration::from_secs(u64::from(secs));
                if let Some(max) = self.max_lifetime {
                    d = d.min(max);
                }
                Some(d)
            }
            None => self.default_lifetime,
        };
        Ok(lifetime.map(|d| Instant::now() + d))
    }
}

/// Top-level SSH agent.  Cloned per incoming connection by `ssh_agent_lib`.
#[derive(Clone, Debug)]
pub struct SshAgent {
    store: Arc<RwLock<KeyStore>>,
    socket_path: PathBuf,
    policy: LifetimePolicy,
}

impl SshAgent {
    pub fn new(store: Arc<RwLock<KeyStore>>, socket_path: PathBuf, policy: LifetimePolicy) -> Self {
        Self { store, socket_path, policy }
    }

    /// Bind the Unix socket and start accepting connections.
    pub async fn listen(self) -> anyhow::Result<()> {
        let listener = tokio::net::UnixListener::bind(&self.socket_path)
            .with_context(|| format!("bind agent socket {:?}", self.socket_path))?;

        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {:?}", self.socket_path))?;

        listen(listener, self).await.context("agent listener")
    }

    /// Insert a parsed private key, applying the lifetime policy.
    fn add_key(
        &self,
        privkey: PrivateKey,
        comment: String,
        requested_lifetime: Option<u32>,
        require_confirm: bool,
    ) -> Result<(), AgentError> {
        let expires_at = self.policy.deadline(requested_lifetime)?;

        let entry = build_entry(privkey, comment, expires_at, require_confirm)
            .ok_or_else(|| other_err("public key serialisation failed"))?;
        let fingerprint = entry.fingerprint.clone();

        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        if store.is_locked() {
            return Err(other_err("agent is locked"));
        }
        let replaced = store.insert(entry);
        info!(fingerprint = %fingerprint, replaced, "identity added");
        Ok(())
    }
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        store.touch();

        // A locked agent answers with an empty list, not a failure.
        if store.is_locked() {
            debug!("request_identities while locked");
            return Ok(Vec::new());
        }

        let identities: Vec<Identity> = store
            .identities()
            .map(|entry| Identity {
                pubkey: entry.private_key.public_key().clone().into(),
                comment: entry.comment.clone(),
            })
            .collect();

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let fingerprint = request.pubkey.fingerprint(HashAlg::Sha256).to_string();

        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        store.touch();

        if store.is_locked() {
            return Err(other_err("agent is locked"));
        }

        let entry = store
            .get(&fingerprint)
            .ok_or_else(|| other_err("key not found"))?;

        if entry.require_confirm {
            warn!(
                fingerprint = %fingerprint,
                comment = %entry.comment,
                "sign request for confirm-constrained key (no prompt UI, allowing)"
            );
        }

        debug!(
            fingerprint = %fingerprint,
            comment = %entry.comment,
            data_len = request.data.len(),
            "sign"
        );

        let signature = entry
            .private_key
            .try_sign(&request.data)
            .map_err(|e| other_err(format!("signing failed: {e}")))?;

        Ok(signature)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        match identity.credential {
            Credential::Key { privkey, comment } => {
                let privkey =
                    PrivateKey::try_from(privkey).map_err(|e| other_err(format!("bad key: {e}")))?;
                self.add_key(privkey, comment, None, false)
            }
            Credential::Cert { .. } => Err(other_err("certificates are not supported")),
        }
    }

    async fn add_identity_constrained(
        &mut self,
        request: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let AddIdentityConstrained { identity, constraints } = request;

        let mut lifetime: Option<u32> = None;
        let mut require_confirm = false;
        for constraint in constraints {
            match constraint {
                KeyConstraint::Lifetime(secs) => lifetime = Some(secs),
                KeyConstraint::Confirm => require_confirm = true,
                // An agent that cannot honour a constraint must refuse the
                // whole add rather than store the key unconstrained.
                other => {
                    return Err(other_err(format!("unsupported key constraint: {other:?}")));
                }
            }
        }

        match identity.credential {
            Credential::Key { privkey, comment } => {
                let privkey =
                    PrivateKey::try_from(privkey).map_err(|e| other_err(format!("bad key: {e}")))?;
                self.add_key(privkey, comment, lifetime, require_confirm)
            }
            Credential::Cert { .. } => Err(other_err("certificates are not supported")),
        }
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let fingerprint = identity.pubkey.fingerprint(HashAlg::Sha256).to_string();

        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        if store.is_locked() {
            return Err(other_err("agent is locked"));
        }
        if store.remove(&fingerprint) {
            info!(fingerprint = %fingerprint, "identity removed");
            Ok(())
        } else {
            Err(other_err("key not found"))
        }
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        if store.is_locked() {
            return Err(other_err("agent is locked"));
        }
        store.remove_all();
        info!("all identities removed");
        Ok(())
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        store
            .lock(key.as_bytes())
            .map_err(|e| other_err(e.to_string()))?;
        info!("agent locked");
        Ok(())
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        store
            .unlock(key.as_bytes())
            .map_err(|e| other_err(e.to_string()))?;
        info!("agent unlocked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_agent_lib::proto::PrivateKeyData;
    use ssh_key::Algorithm;
    use ssh_key::public::KeyData;

    fn agent(policy: LifetimePolicy) -> SshAgent {
        SshAgent::new(KeyStore::new(), PathBuf::from("/nonexistent/test.sock"), policy)
    }

    fn random_key() -> PrivateKey {
        PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap()
    }

    fn add_request(key: &PrivateKey, comment: &str) -> AddIdentity {
        AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment: comment.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn add_list_sign_round_trip() {
        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();
        agent.add_identity(add_request(&key, "alice@laptop")).await.unwrap();

        let identities = agent.request_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].comment, "alice@laptop");

        let pubkey: KeyData = key.public_key().key_data().clone();
        let signature = agent
            .sign(SignRequest {
                pubkey: pubkey.clone(),
                data: b"challenge".to_vec(),
                flags: 0,
            })
            .await
            .unwrap();

        signature::Verifier::verify(key.public_key(), b"challenge", &signature).unwrap();
    }

    #[tokio::test]
    async fn certificate_credential_is_refused() {
        use ssh_key::certificate::{Builder, CertType};

        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();

        let ca = random_key();
        let mut builder = Builder::new_with_random_nonce(
            &mut rand_core::OsRng,
            key.public_key().key_data().clone(),
            0,
            i64::MAX as u64,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal("alice").unwrap();
        let certificate = builder.sign(&ca).unwrap();

        let result = agent
            .add_identity(AddIdentity {
                credential: Credential::Cert {
                    algorithm: certificate.algorithm(),
                    certificate: Box::new(certificate),
                    privkey: PrivateKeyData::Ed25519(
                        key.key_data().ed25519().unwrap().clone(),
                    ),
                    comment: "alice-cert".to_string(),
                },
            })
            .await;
        assert!(result.is_err());
        assert!(agent.request_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sign_unknown_key_fails() {
        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();
        let result = agent
            .sign(SignRequest {
                pubkey: key.public_key().key_data().clone(),
                data: b"challenge".to_vec(),
                flags: 0,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn zero_lifetime_is_refused() {
        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();
        let result = agent
            .add_identity_constrained(AddIdentityConstrained {
                identity: add_request(&key, "zero"),
                constraints: vec![KeyConstraint::Lifetime(0)],
            })
            .await;
        assert!(result.is_err());
        assert!(agent.request_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifetime_is_clamped_to_policy_cap() {
        let mut agent = agent(LifetimePolicy {
            default_lifetime: None,
            max_lifetime: Some(Duration::from_secs(60)),
        });
        let key = random_key();
        agent
            .add_identity_constrained(AddIdentityConstrained {
                identity: add_request(&key, "capped"),
                constraints: vec![KeyConstraint::Lifetime(86_400)],
            })
            .await
            .unwrap();

        let store = agent.store.read().unwrap();
        let entry = store.identities().next().unwrap();
        let deadline = entry.expires_at.unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(61));
    }

    #[tokio::test]
    async fn default_lifetime_applies_when_unconstrained() {
        let mut agent = agent(LifetimePolicy {
            default_lifetime: Some(Duration::from_secs(300)),
            max_lifetime: None,
        });
        agent.add_identity(add_request(&random_key(), "defaulted")).await.unwrap();

        let store = agent.store.read().unwrap();
        assert!(store.identities().next().unwrap().expires_at.is_some());
    }

    #[tokio::test]
    async fn locked_agent_hides_and_refuses() {
        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();
        agent.add_identity(add_request(&key, "hidden")).await.unwrap();

        agent.lock("hunter2".to_string()).await.unwrap();

        // Empty list, not an error.
        assert!(agent.request_identities().await.unwrap().is_empty());

        assert!(
            agent
                .sign(SignRequest {
                    pubkey: key.public_key().key_data().clone(),
                    data: b"challenge".to_vec(),
                    flags: 0,
                })
                .await
                .is_err()
        );
        assert!(agent.add_identity(add_request(&random_key(), "no")).await.is_err());
        assert!(agent.remove_all_identities().await.is_err());
        assert!(agent.unlock("wrong".to_string()).await.is_err());

        agent.unlock("hunter2".to_string()).await.unwrap();
        assert_eq!(agent.request_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_identity_by_pubkey() {
        let mut agent = agent(LifetimePolicy::default());
        let key = random_key();
        agent.add_identity(add_request(&key, "going")).await.unwrap();

        agent
            .remove_identity(RemoveIdentity {
                pubkey: key.public_key().key_data().clone(),
            })
            .await
            .unwrap();
        assert!(agent.request_identities().await.unwrap().is_empty());

        // Second removal of the same key fails.
        assert!(
            agent
                .remove_identity(RemoveIdentity {
                    pubkey: key.public_key().key_data().clone(),
                })
                .await
                .is_err()
        );
    }
}
