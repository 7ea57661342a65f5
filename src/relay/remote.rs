//! Transport seam between the relay core and the SSH client.
//!
//! The broker, execution engine and file operations only talk to these
//! traits. [`super::client::SshConnector`] is the russh-backed implementation;
//! tests substitute in-memory doubles.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::Result;
use super::sftp::SftpPrimitives;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// Secret material used to authenticate. Never logged.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(..)"),
            Credential::Key { .. } => f.write_str("Credential::Key(..)"),
        }
    }
}

/// One prompt of a keyboard-interactive challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KiPrompt {
    pub prompt: String,
    pub echo: bool,
}

/// A keyboard-interactive challenge sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KiChallenge {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<KiPrompt>,
}

/// How long a relayed keyboard-interactive challenge waits for the user.
pub const KI_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Answers keyboard-interactive challenges on behalf of the end user.
#[async_trait]
pub trait KiResponder: Send + Sync {
    async fn respond(&self, challenge: KiChallenge) -> Result<Vec<String>>;
}

/// Output of a command run to completion.
///
/// `stdout` is kept as raw bytes so file reads see exactly what the remote
/// side sent. `stderr` is only ever used for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout decoded lossily, for line-oriented parsing.
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

/// Quote `value` as a single POSIX shell word.
///
/// ```ignore
/// assert_eq!(shell_quote("/srv/it's"), r"'/srv/it'\''s'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Incremental output of a streaming execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Last item on the stream. `code` is absent when the process died from a signal
    /// or the channel closed without reporting a status.
    Finished {
        code: Option<u32>,
        signal: Option<String>,
    },
}

/// Control half of a streaming execution.
#[async_trait]
pub trait ExecControl: Send + Sync {
    /// Best-effort interrupt (INT signal plus a Ctrl-C byte on the pty).
    async fn interrupt(&self);

    /// Close the channel. Ends the output stream.
    async fn close(&self);
}

pub struct ExecStream {
    pub output: mpsc::Receiver<ExecOutput>,
    pub control: Arc<dyn ExecControl>,
}

/// A live, authenticated connection to one remote host.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Start `command` and stream its output. `pty` requests a pseudo-terminal.
    async fn open_exec(&self, command: &str, pty: bool) -> Result<ExecStream>;

    /// Run `command` to completion, optionally feeding `stdin`, within `timeout`.
    async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Open a new SFTP subsystem channel.
    async fn open_sftp(&self) -> Result<Arc<dyn SftpPrimitives>>;

    /// Cancelled once the transport is gone, whatever the cause.
    fn closed(&self) -> CancellationToken;

    /// Disconnect. Idempotent.
    async fn close(&self);
}

/// Opens live connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
        ki: Option<Arc<dyn KiResponder>>,
    ) -> Result<Arc<dyn RemoteHost>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_hides_secrets() {
        let password = Credential::Password("hunter2".to_string());
        let key = Credential::Key {
            private_key: "-----BEGIN".to_string(),
            passphrase: Some("pp".to_string()),
        };
        assert!(!format!("{:?}", password).contains("hunter2"));
        assert!(!format!("{:?}", key).contains("BEGIN"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/log"), "'/var/log'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_command_output_success() {
        let mut out = CommandOutput::default();
        assert!(!out.success());
        out.exit_code = Some(0);
        assert!(out.success());
    }

    #[test]
    fn test_stdout_text_is_lossy() {
        let out = CommandOutput {
            stdout: vec![b'o', b'k', 0xFF],
            ..CommandOutput::default()
        };
        assert_eq!(out.stdout_text(), "ok\u{FFFD}");
        assert_eq!(out.stdout.len(), 3);
    }
}
