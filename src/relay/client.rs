//! SSH client connection and channel logic.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keep-alive probing and compression preference
//!    from [`SshSettings`]. There is no inactivity timeout; live connections are
//!    reclaimed by explicit disconnect, transport failure or the orphan reaper.
//!
//! 2. **Connection Establishment**: TCP connect and key exchange bounded by the
//!    ready timeout. The handler applies the host-key policy.
//!
//! 3. **Authentication**: [`AuthChain::for_credential`] picks the strategies.
//!    Relayed keyboard-interactive challenges extend the bound by the time the
//!    user is given to answer.
//!
//! 4. **Channels**: streaming exec (optionally with a pty), run-to-completion
//!    commands with optional stdin, and the SFTP subsystem.
//!
//! Connects are never retried automatically; authentication failures surface
//! verbatim as `ConnectionFailed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect, Sig};
use russh_sftp::client::SftpSession;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::SshSettings;
use super::error::{RelayError, Result};
use super::remote::{
    CommandOutput, ConnectTarget, Connector, Credential, ExecControl, ExecOutput, ExecStream,
    KI_RESPONSE_TIMEOUT, KiResponder, RemoteHost,
};
use super::session::SshClientHandler;
use super::sftp::{RusshSftp, SftpPrimitives};

/// Terminal type requested for pty executions
const PTY_TERM: &str = "xterm-256color";

/// Pty geometry for executions (columns, rows)
const PTY_SIZE: (u32, u32) = (200, 50);

/// Buffered output items per execution before the reader applies backpressure
const EXEC_OUTPUT_BUFFER: usize = 256;

/// Build russh client configuration from the transport settings.
///
/// ```ignore
/// let config = build_client_config(&SshSettings::default());
/// assert_eq!(config.keepalive_interval, Some(Duration::from_secs(10)));
/// assert_eq!(config.inactivity_timeout, None);
/// ```
pub(crate) fn build_client_config(settings: &SshSettings) -> Arc<client::Config> {
    let compression = if settings.compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(settings.keepalive_interval),
        keepalive_max: settings.keepalive_max,
        preferred,
        ..Default::default()
    })
}

/// Establish an SSH connection and authenticate.
async fn connect_to_ssh(
    settings: &SshSettings,
    target: &ConnectTarget,
    credential: &Credential,
    ki: Option<Arc<dyn KiResponder>>,
) -> Result<SshHost> {
    let config = build_client_config(settings);
    let closed = CancellationToken::new();
    let handler = SshClientHandler::new(
        settings.host_key_policy.clone(),
        target.host.as_str(),
        closed.clone(),
    );

    let connect_future = client::connect(config, (target.host.as_str(), target.port), handler);

    let mut handle = tokio::time::timeout(settings.ready_timeout, connect_future)
        .await
        .map_err(|_| {
            RelayError::ConnectionFailed(format!(
                "Connection to {}:{} timed out after {:?}",
                target.host, target.port, settings.ready_timeout
            ))
        })?
        .map_err(|e| {
            RelayError::ConnectionFailed(format!(
                "Failed to connect to {}:{}: {}",
                target.host, target.port, e
            ))
        })?;

    let auth_timeout = if ki.is_some() {
        settings.ready_timeout + KI_RESPONSE_TIMEOUT
    } else {
        settings.ready_timeout
    };
    let auth_chain = AuthChain::for_credential(credential, ki);

    let success = tokio::time::timeout(
        auth_timeout,
        auth_chain.authenticate(&mut handle, &target.username),
    )
    .await
    .map_err(|_| {
        RelayError::ConnectionFailed(format!(
            "Authentication timed out after {:?}",
            auth_timeout
        ))
    })??;

    if !success {
        return Err(RelayError::ConnectionFailed(
            "Authentication failed: no authentication methods succeeded".to_string(),
        ));
    }

    info!(
        "SSH connection established to {}@{}:{}",
        target.username, target.host, target.port
    );

    Ok(SshHost {
        handle,
        closed,
        label: format!("{}@{}:{}", target.username, target.host, target.port),
    })
}

/// Opens russh connections.
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
        ki: Option<Arc<dyn KiResponder>>,
    ) -> Result<Arc<dyn RemoteHost>> {
        let host = connect_to_ssh(&self.settings, target, credential, ki).await?;
        Ok(Arc::new(host))
    }
}

/// A live russh connection.
pub struct SshHost {
    handle: client::Handle<SshClientHandler>,
    closed: CancellationToken,
    label: String,
}

impl SshHost {
    async fn open_channel(&self) -> Result<russh::Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| RelayError::Remote(format!("Failed to open channel: {}", e)))
    }
}

/// Control half of a russh exec channel.
struct SshExecControl {
    write_half: Mutex<ChannelWriteHalf<Msg>>,
}

#[async_trait]
impl ExecControl for SshExecControl {
    async fn interrupt(&self) {
        let writer = self.write_half.lock().await;
        if let Err(e) = writer.signal(Sig::INT).await {
            debug!("Failed to send INT signal: {}", e);
        }
        // Ctrl-C on the pty reaches programs that ignore the signal request
        if let Err(e) = writer.data(&b"\x03"[..]).await {
            debug!("Failed to write interrupt byte: {}", e);
        }
    }

    async fn close(&self) {
        let writer = self.write_half.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Failed to close exec channel: {}", e);
        }
    }
}

fn signal_name(sig: &Sig) -> String {
    match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl RemoteHost for SshHost {
    async fn open_exec(&self, command: &str, pty: bool) -> Result<ExecStream> {
        let channel = self.open_channel().await?;

        if pty {
            channel
                .request_pty(false, PTY_TERM, PTY_SIZE.0, PTY_SIZE.1, 0, 0, &[])
                .await
                .map_err(|e| RelayError::Remote(format!("Failed to request PTY: {}", e)))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| RelayError::Remote(format!("Failed to execute command: {}", e)))?;

        let (mut read_half, write_half) = channel.split();
        let (tx, rx) = mpsc::channel(EXEC_OUTPUT_BUFFER);

        tokio::spawn(async move {
            let mut exit_code: Option<u32> = None;
            let mut exit_signal: Option<String> = None;

            loop {
                let item = match read_half.wait().await {
                    Some(ChannelMsg::Data { data }) => Some(ExecOutput::Stdout(data.to_vec())),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in SSH protocol
                        (ext == 1).then(|| ExecOutput::Stderr(data.to_vec()))
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                        None
                    }
                    Some(ChannelMsg::ExitSignal { signal_name: sig, .. }) => {
                        exit_signal = Some(signal_name(&sig));
                        None
                    }
                    Some(ChannelMsg::Eof) => {
                        // Continue to wait for exit status if not received yet
                        if exit_code.is_some() || exit_signal.is_some() {
                            break;
                        }
                        None
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => None,
                };

                if let Some(item) = item
                    && tx.send(item).await.is_err()
                {
                    break;
                }
            }

            let _ = tx
                .send(ExecOutput::Finished {
                    code: exit_code,
                    signal: exit_signal,
                })
                .await;
        });

        Ok(ExecStream {
            output: rx,
            control: Arc::new(SshExecControl {
                write_half: Mutex::new(write_half),
            }),
        })
    }

    async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut channel = self.open_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| RelayError::Remote(format!("Failed to execute command: {}", e)))?;

        if let Some(input) = stdin {
            channel
                .data(&input[..])
                .await
                .map_err(|e| RelayError::Remote(format!("Failed to send input: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| RelayError::Remote(format!("Failed to send EOF: {}", e)))?;
        }

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let result = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        // Always close the channel gracefully to keep the connection alive
        let _ = channel.close().await;

        if result.is_err() {
            warn!("Command timed out after {:?} on {}", timeout, self.label);
            return Err(RelayError::RequestTimeout(timeout));
        }

        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpPrimitives>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RelayError::ChannelFailure(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                RelayError::ChannelFailure(format!("Failed to request SFTP subsystem: {}", e))
            })?;

        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RelayError::from_sftp(e, "SFTP initialization"))?;

        debug!("SFTP channel opened on {}", self.label);
        Ok(Arc::new(RusshSftp::new(session)))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        if !self.handle.is_closed()
            && let Err(e) = self
                .handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
        {
            debug!("Disconnect from {} failed: {}", self.label, e);
        }
        self.closed.cancel();
    }
}
