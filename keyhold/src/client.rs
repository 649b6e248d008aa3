//! Agent-protocol client.
//!
//! Speaks the OpenSSH agent protocol over the Unix socket: each message is a
//! u32 big-endian length prefix followed by an `ssh-agent-lib` proto message.
//! Only the requests the CLI needs are wrapped in typed helpers.

use std::path::Path;

use anyhow::{Context as _, Result, bail};
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Identity, KeyConstraint, RemoveIdentity,
    Request, Response,
};
use ssh_encoding::{Decode as _, Encode as _};
use ssh_key::PrivateKey;
use ssh_key::public::KeyData;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use zeroize::Zeroizing;

/// Upper bound on a single agent response.  The protocol has no legitimate
/// response anywhere near this size; anything larger means a corrupt stream.
const MAX_RESPONSE_LEN: u32 = 1024 * 1024;

pub struct AgentClient {
    stream: UnixStream,
}

impl AgentClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!("connect to agent socket {} (is keyholdd running?)", path.display())
        })?;
        Ok(Self { stream })
    }

    /// Send one request and read one response frame.
    async fn roundtrip(&mut self, request: Request) -> Result<Response> {
        let len = request
            .encoded_len()
            .map_err(|e| anyhow::anyhow!("encode request: {e}"))? as u32;

        let mut buf = Vec::with_capacity(4 + len as usize);
        len.encode(&mut buf)
            .and_then(|()| request.encode(&mut buf))
            .map_err(|e| anyhow::anyhow!("encode request: {e}"))?;
        self.stream.write_all(&buf).await.context("write to agent")?;

        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("read from agent")?;
        let resp_len = u32::from_be_bytes(len_buf);
        if resp_len == 0 || resp_len > MAX_RESPONSE_LEN {
            bail!("agent sent a malformed frame ({resp_len} bytes)");
        }

        let mut body = vec![0u8; resp_len as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .context("read from agent")?;

        Response::decode(&mut body.as_slice())
            .map_err(|e| anyhow::anyhow!("decode agent response: {e}"))
    }

    /// Run a request whose only interesting outcome is success or failure.
    async fn expect_success(&mut self, request: Request, op: &str) -> Result<()> {
        match self.roundtrip(request).await? {
            Response::Success => Ok(()),
            Response::Failure => bail!("agent refused {op}"),
            other => bail!("unexpected agent response to {op}: {other:?}"),
        }
    }

    pub async fn list(&mut self) -> Result<Vec<Identity>> {
        match self.roundtrip(Request::RequestIdentities).await? {
            Response::IdentitiesAnswer(identities) => Ok(identities),
            Response::Failure => bail!("agent refused to list identities"),
            other => bail!("unexpected agent response to list: {other:?}"),
        }
    }

    /// Add a decrypted private key, with optional lifetime (seconds) and
    /// per-signature confirmation constraints.
    pub async fn add(
        &mut self,
        key: &PrivateKey,
        comment: String,
        lifetime_secs: Option<u32>,
        confirm: bool,
    ) -> Result<()> {
        let identity = AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment,
            },
        };

        let mut constraints = Vec::new();
        if let Some(secs) = lifetime_secs {
            constraints.push(KeyConstraint::Lifetime(secs));
        }
        if confirm {
            constraints.push(KeyConstraint::Confirm);
        }

        let request = if constraints.is_empty() {
            Request::AddIdentity(identity)
        } else {
            Request::AddIdConstrained(AddIdentityConstrained { identity, constraints })
        };
        self.expect_success(request, "add").await
    }

    pub async fn remove(&mut self, pubkey: KeyData) -> Result<()> {
        self.expect_success(Request::RemoveIdentity(RemoveIdentity { pubkey }), "remove")
            .await
    }

    pub async fn remove_all(&mut self) -> Result<()> {
        self.expect_success(Request::RemoveAllIdentities, "remove-all")
            .await
    }

    pub async fn lock(&mut self, passphrase: Zeroizing<String>) -> Result<()> {
        self.expect_success(Request::Lock(passphrase.as_str().to_string()), "lock")
            .await
    }

    pub async fn unlock(&mut self, passphrase: Zeroizing<String>) -> Result<()> {
        self.expect_success(Request::Unlock(passphrase.as_str().to_string()), "unlock")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_has_length_prefix_and_message_byte() {
        let request = Request::RequestIdentities;
        let len = request.encoded_len().unwrap() as u32;

        let mut buf = Vec::new();
        len.encode(&mut buf).unwrap();
        request.encode(&mut buf).unwrap();

        // SSH_AGENTC_REQUEST_IDENTITIES is message number 11, and the
        // request has no body.
        assert_eq!(buf, vec![0, 0, 0, 1, 11]);
    }

    #[test]
    fn identities_answer_decodes() {
        // SSH_AGENT_IDENTITIES_ANSWER (12) with zero keys.
        let body = vec![12u8, 0, 0, 0, 0];
        let response = Response::decode(&mut body.as_slice()).unwrap();
        match response {
            Response::IdentitiesAnswer(ids) => assert!(ids.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn failure_decodes() {
        // SSH_AGENT_FAILURE is message number 5.
        let body = vec![5u8];
        assert!(matches!(
            Response::decode(&mut body.as_slice()).unwrap(),
            Response::Failure
        ));
    }
}
