//! russh client handler for relay connections.
//!
//! # Host keys
//!
//! Verification follows the configured [`HostKeyPolicy`]:
//!
//! - `AcceptAny`: every key is accepted (similar to `StrictHostKeyChecking=no`).
//!   This is the deployment default and is logged at startup.
//! - `Pinned`: only keys whose `SHA256:` fingerprint is listed are accepted.
//!
//! # Close notification
//!
//! The handler lives inside the russh session task and is dropped when the
//! transport ends (remote close, keep-alive failure, explicit disconnect). Dropping
//! it cancels the `closed` token, which the broker watches to evict the cached
//! connection.

use russh::{client, keys};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::HostKeyPolicy;

pub struct SshClientHandler {
    policy: HostKeyPolicy,
    host: String,
    closed: CancellationToken,
}

impl SshClientHandler {
    pub fn new(policy: HostKeyPolicy, host: impl Into<String>, closed: CancellationToken) -> Self {
        Self {
            policy,
            host: host.into(),
            closed,
        }
    }

    fn accepts(&self, fingerprint: &str) -> bool {
        match &self.policy {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Pinned(allowed) => allowed.iter().any(|f| f == fingerprint),
        }
    }
}

impl Drop for SshClientHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key
            .fingerprint(keys::HashAlg::Sha256)
            .to_string();
        let accepted = self.accepts(&fingerprint);
        if !accepted {
            warn!(
                "Rejected host key {} for {}: not in pinned fingerprints",
                fingerprint, self.host
            );
        }
        Ok(accepted)
    }
}
