//! Authentication strategies for SSH connections.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key material authentication
//! - [`KeyboardInteractiveAuth`]: Keyboard-interactive with challenge relay
//!
//! [`AuthChain::for_credential`] picks the strategies for a [`Credential`](crate::relay::remote::Credential).

mod chain;
mod key;
mod keyboard;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use keyboard::KeyboardInteractiveAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
