//! Password login for relay sessions.
//!
//! The password comes either from the `connect` request itself or from a
//! saved profile when the broker reconnects. It lives only as long as the
//! [`AuthChain`](super::AuthChain) built for that one handshake.

use std::fmt;

use async_trait::async_trait;
use russh::client;

use crate::relay::error::{RelayError, Result};
use crate::relay::session::SshClientHandler;

use super::traits::AuthStrategy;

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

// Secrets never reach the logs, even through `{:?}`
impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        // A rejected password is `Ok(false)`; only transport errors fail the handshake
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| {
                RelayError::ConnectionFailed(format!(
                    "Password login for {} failed: {}",
                    username, e
                ))
            })?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
