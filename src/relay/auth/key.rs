//! Private key SSH authentication.
//!
//! Keys arrive as PEM/OpenSSH text (typed by the user or resolved from a saved
//! profile), never as a path on the relay host.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::relay::error::{RelayError, Result};
use crate::relay::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Private key authentication strategy.
pub struct KeyAuth {
    private_key: String,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn new(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase: passphrase.filter(|p| !p.is_empty()),
        }
    }

    fn decode(&self) -> Result<keys::PrivateKey> {
        keys::decode_secret_key(&self.private_key, self.passphrase.as_deref()).map_err(|e| {
            RelayError::ConnectionFailed(format!("Failed to decode private key: {}", e))
        })
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key_pair = self.decode()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| RelayError::ConnectionFailed(format!("Key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
