//! Keyboard-interactive SSH authentication.
//!
//! Many hosts disable plain password auth but ask for the same password via
//! keyboard-interactive. A lone hidden prompt that looks like a password request
//! is answered with the supplied password; any other challenge (OTP, multiple
//! prompts) is relayed to the end user through a [`KiResponder`].

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use tracing::debug;

use crate::relay::error::{RelayError, Result};
use crate::relay::remote::{KiChallenge, KiPrompt, KiResponder};
use crate::relay::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Upper bound on challenge rounds before giving up.
const MAX_ROUNDS: usize = 8;

pub struct KeyboardInteractiveAuth {
    password: Option<String>,
    responder: Option<Arc<dyn KiResponder>>,
}

impl KeyboardInteractiveAuth {
    pub fn new(password: Option<String>, responder: Option<Arc<dyn KiResponder>>) -> Self {
        Self {
            password,
            responder,
        }
    }

    async fn answer(&self, challenge: KiChallenge) -> Result<Vec<String>> {
        if let Some(answers) = auto_answer(&challenge.prompts, self.password.as_deref()) {
            return Ok(answers);
        }
        match &self.responder {
            Some(responder) => responder.respond(challenge).await,
            None => Err(RelayError::ConnectionFailed(
                "Server requested interactive authentication but no client is attached"
                    .to_string(),
            )),
        }
    }
}

/// Answer a challenge without asking the user, when that is unambiguous.
fn auto_answer(prompts: &[KiPrompt], password: Option<&str>) -> Option<Vec<String>> {
    match prompts {
        [] => Some(Vec::new()),
        [only] if !only.echo && only.prompt.to_lowercase().contains("password") => {
            password.map(|p| vec![p.to_string()])
        }
        _ => None,
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let map_err = |e: russh::Error| {
            RelayError::ConnectionFailed(format!("Keyboard-interactive authentication failed: {}", e))
        };

        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(map_err)?;

        for _ in 0..MAX_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!("Keyboard-interactive challenge with {} prompt(s)", prompts.len());
                    let challenge = KiChallenge {
                        name,
                        instructions,
                        prompts: prompts
                            .into_iter()
                            .map(|p| KiPrompt {
                                prompt: p.prompt,
                                echo: p.echo,
                            })
                            .collect(),
                    };
                    let answers = self.answer(challenge).await?;
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(map_err)?;
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}
