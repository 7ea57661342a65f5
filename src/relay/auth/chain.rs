//! Authentication chain for trying multiple strategies.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::relay::error::{RelayError, Result};
use crate::relay::remote::{Credential, KiResponder};
use crate::relay::session::SshClientHandler;

use super::traits::AuthStrategy;
use super::{KeyAuth, KeyboardInteractiveAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// The first successful authentication stops the chain.
///
/// ```ignore
/// let chain = AuthChain::for_credential(&credential, responder);
/// let ok = chain.authenticate(&mut handle, "deploy").await?;
/// ```
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for a credential.
    ///
    /// - password: password, then keyboard-interactive (auto-answering password prompts)
    /// - key: public key only
    pub fn for_credential(credential: &Credential, ki: Option<Arc<dyn KiResponder>>) -> Self {
        match credential {
            Credential::Password(password) => Self::new()
                .with_password(password.clone())
                .with_keyboard_interactive(Some(password.clone()), ki),
            Credential::Key {
                private_key,
                passphrase,
            } => Self::new().with_key(private_key.clone(), passphrase.clone()),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        self.strategies
            .push(Box::new(KeyAuth::new(private_key, passphrase)));
        self
    }

    pub fn with_keyboard_interactive(
        mut self,
        password: Option<String>,
        responder: Option<Arc<dyn KiResponder>>,
    ) -> Self {
        self.strategies
            .push(Box::new(KeyboardInteractiveAuth::new(password, responder)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        if self.strategies.is_empty() {
            return Err(RelayError::ConnectionFailed(
                "No authentication strategies configured".to_string(),
            ));
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication rejected with strategy: {}", strategy.name());
                    last_error = Some(RelayError::ConnectionFailed(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RelayError::ConnectionFailed("All authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
