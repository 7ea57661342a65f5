//! Protocol dispatcher.
//!
//! One [`Dispatcher`] per control channel. It validates message shape,
//! resolves and authorizes the target session, then delegates to the broker,
//! the execution engine, file operations or introspection. Component failures
//! come back as `error` events; only malformed framing ends the channel.
//!
//! Each message is handled on its own task so a slow operation never holds up
//! the rest of the channel.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::ConnectionBroker;
use super::config::RelayConfig;
use super::error::{RelayError, Result};
use super::exec::{ExecEngine, ExecRequest};
use super::external::TokenVerifier;
use super::files::FileOps;
use super::introspect::Introspector;
use super::protocol::{ConnectPayload, ConnectionStatus, Envelope, EventSink, Request, ServerEvent};
use super::registry::{AuthKind, NewSession, SessionPatch, SessionRecord};
use super::remote::{Credential, KI_RESPONSE_TIMEOUT, KiChallenge, KiResponder};

/// Services shared by every control channel.
pub struct Relay {
    broker: Arc<ConnectionBroker>,
    exec: Arc<ExecEngine>,
    files: FileOps,
    introspect: Introspector,
    tokens: Arc<dyn TokenVerifier>,
    allow_anonymous: bool,
    request_timeout: Duration,
    next_channel: AtomicU64,
}

impl Relay {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        exec: Arc<ExecEngine>,
        tokens: Arc<dyn TokenVerifier>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            files: FileOps::new(broker.clone()),
            introspect: Introspector::new(broker.clone()),
            broker,
            exec,
            tokens,
            allow_anonymous: config.allow_anonymous,
            request_timeout: config.request_timeout,
            next_channel: AtomicU64::new(1),
        })
    }

    /// Start dispatching for a new control channel whose events go to `tx`.
    pub fn open_channel(self: &Arc<Self>, tx: mpsc::Sender<ServerEvent>) -> Arc<Dispatcher> {
        let channel_id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        debug!("Control channel {} opened", channel_id);
        Arc::new(Dispatcher {
            relay: self.clone(),
            sink: EventSink::new(channel_id, tx),
            user: RwLock::new(None),
            sessions: DashSet::new(),
            pending_ki: Arc::new(DashMap::new()),
        })
    }
}

type PendingPrompts = Arc<DashMap<String, oneshot::Sender<Vec<String>>>>;

/// Per-channel routing state.
pub struct Dispatcher {
    relay: Arc<Relay>,
    sink: EventSink,
    user: RwLock<Option<String>>,
    /// Session ids this channel connected, attached or used.
    sessions: DashSet<String>,
    pending_ki: PendingPrompts,
}

impl Dispatcher {
    pub fn channel_id(&self) -> u64 {
        self.sink.channel_id()
    }

    /// Handle one text frame. Returns `false` when the framing is malformed and
    /// the channel must be closed.
    pub async fn handle_text(self: &Arc<Self>, text: &str) -> bool {
        let value: Value = match serde_json::from_str(text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                let err = RelayError::InvalidRequest("Malformed frame: expected a JSON object".to_string());
                self.sink.send(ServerEvent::error(&err, None, None)).await;
                return false;
            }
        };

        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = RelayError::InvalidRequest(format!("Invalid message: {}", e));
                self.sink.send(ServerEvent::error(&err, None, None)).await;
                return true;
            }
        };

        let this = self.clone();
        tokio::spawn(async move { this.handle(envelope).await });
        true
    }

    /// Report a frame that cannot be processed at all (binary data).
    pub async fn reject_frame(&self, reason: &str) {
        let err = RelayError::InvalidRequest(format!("Malformed frame: {}", reason));
        self.sink.send(ServerEvent::error(&err, None, None)).await;
    }

    /// Route one message and send its reply or error.
    pub async fn handle(&self, envelope: Envelope) {
        let request_id = envelope.request_id.clone();
        let request = match Request::from_envelope(&envelope) {
            Ok(request) => request,
            Err(e) => {
                self.sink.send(ServerEvent::error(&e, request_id, None)).await;
                return;
            }
        };
        let session_id = request.session_id().map(str::to_string);

        match self.route(request, request_id.clone()).await {
            Ok(Some(event)) => {
                self.sink.send(event).await;
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Request {} failed: {}", envelope.kind, e);
                self.sink
                    .send(ServerEvent::error(&e, request_id, session_id))
                    .await;
            }
        }
    }

    /// Drop per-channel state once the socket is gone. Sessions stay alive for `attach`.
    pub async fn close(&self) {
        self.relay.broker.unregister_channel(self.channel_id());
        self.pending_ki.clear();
        debug!(
            "Control channel {} closed, {} session(s) left for reattach",
            self.channel_id(),
            self.sessions.len()
        );
    }

    async fn user(&self) -> Option<String> {
        self.user.read().await.clone()
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.relay.request_timeout;
        tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| RelayError::RequestTimeout(limit))?
    }

    /// Load a session the current user may use.
    async fn session(&self, session_id: &str) -> Result<SessionRecord> {
        let record = self.relay.broker.registry().get(session_id).await?;
        if let Some(owner) = &record.owner_id
            && self.user().await.as_deref() != Some(owner.as_str())
        {
            return Err(RelayError::NotFound(format!("session {}", session_id)));
        }
        self.sessions.insert(record.id.clone());
        Ok(record)
    }

    async fn route(
        &self,
        request: Request,
        request_id: Option<String>,
    ) -> Result<Option<ServerEvent>> {
        if !matches!(request, Request::Auth(_))
            && !self.relay.allow_anonymous
            && self.user().await.is_none()
        {
            return Err(RelayError::Unauthorized(
                "authenticate with an auth message first".to_string(),
            ));
        }

        let files = &self.relay.files;
        let introspect = &self.relay.introspect;
        let reply = match request {
            Request::Auth(p) => {
                let user_id = self.bounded(self.relay.tokens.verify(&p.token)).await?;
                info!("Control channel {} authenticated as {}", self.channel_id(), user_id);
                *self.user.write().await = Some(user_id.clone());
                ServerEvent::AuthOk {
                    request_id,
                    user_id,
                }
            }
            Request::Connect(p) => return self.connect(p, request_id).await.map(Some),
            Request::Attach(p) => {
                let record = self.session(&p.session_id).await?;
                self.relay
                    .broker
                    .register_notifier(&record.id, self.sink.clone());
                info!("Session {} attached on channel {}", record.id, self.channel_id());
                connected_event(record, request_id, true)
            }
            Request::KiResponse(p) => {
                let (_, responder) = self
                    .pending_ki
                    .remove(&p.prompt_id)
                    .ok_or_else(|| RelayError::NotFound(format!("prompt {}", p.prompt_id)))?;
                let _ = responder.send(p.answers);
                return Ok(None);
            }
            Request::GetCwd(p) => {
                let record = self.session(&p.session_id).await?;
                ServerEvent::Cwd {
                    request_id,
                    session_id: record.id,
                    cwd: record.cwd,
                }
            }
            Request::SetCwd(p) => {
                let record = self.session(&p.session_id).await?;
                let cwd = self.bounded(files.resolve_dir(&record, &p.path)).await?;
                let updated = self
                    .relay
                    .broker
                    .registry()
                    .update(
                        &record.id,
                        SessionPatch {
                            cwd: Some(cwd),
                            ..Default::default()
                        },
                    )
                    .await?;
                ServerEvent::Cwd {
                    request_id,
                    session_id: updated.id,
                    cwd: updated.cwd,
                }
            }
            Request::ListDir(p) => {
                let record = self.session(&p.session_id).await?;
                let (path, entries) = self
                    .bounded(files.list_dir(&record, p.path.as_deref()))
                    .await?;
                ServerEvent::DirList {
                    request_id,
                    session_id: record.id,
                    path,
                    entries,
                }
            }
            Request::Mkdir(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self.bounded(files.mkdir(&record, &p.path)).await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::CreateFile(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self.bounded(files.create_file(&record, &p.path)).await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::ReadFile(p) => {
                let record = self.session(&p.session_id).await?;
                let file = self.bounded(files.read_file(&record, &p.path)).await?;
                ServerEvent::File {
                    request_id,
                    session_id: record.id,
                    path: file.path,
                    content: file.content,
                    size: file.size,
                }
            }
            Request::WriteFile(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self
                    .bounded(files.write_file(&record, &p.path, &p.content))
                    .await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::RenamePath(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self
                    .bounded(files.rename_path(&record, &p.path, &p.new_name))
                    .await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::DeletePath(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self.bounded(files.delete_path(&record, &p.path)).await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::CopyPath(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self
                    .bounded(files.copy_path(&record, &p.source, &p.destination_dir))
                    .await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::MovePath(p) => {
                let record = self.session(&p.session_id).await?;
                let path = self
                    .bounded(files.move_path(&record, &p.source, &p.destination_dir))
                    .await?;
                ok_event(request_id, record.id, Some(path))
            }
            Request::Exec(p) => {
                let record = self.session(&p.session_id).await?;
                // Not bounded: the slot reserved by the engine must not be abandoned mid-start
                self.relay
                    .exec
                    .exec(
                        &record,
                        &p.command,
                        ExecRequest {
                            user_id: self.user().await,
                            request_id,
                            sink: self.sink.clone(),
                        },
                    )
                    .await?;
                return Ok(None);
            }
            Request::ExecStop(p) => {
                let record = self.session(&p.session_id).await?;
                self.relay.exec.stop(&record.id, &p.command_id).await?;
                ok_event(request_id, record.id, None)
            }
            Request::ListServices(p) => {
                let record = self.session(&p.session_id).await?;
                let services = self.bounded(introspect.list_services(&record)).await?;
                ServerEvent::ServicesList {
                    request_id,
                    session_id: record.id,
                    services,
                }
            }
            Request::ListDockerContainers(p) => {
                let record = self.session(&p.session_id).await?;
                let containers = self
                    .bounded(introspect.list_docker_containers(&record))
                    .await?;
                ServerEvent::DockerContainersList {
                    request_id,
                    session_id: record.id,
                    containers,
                }
            }
            Request::ListDockerImages(p) => {
                let record = self.session(&p.session_id).await?;
                let images = self.bounded(introspect.list_docker_images(&record)).await?;
                ServerEvent::DockerImagesList {
                    request_id,
                    session_id: record.id,
                    images,
                }
            }
            Request::ListNginxSites(p) => {
                let record = self.session(&p.session_id).await?;
                let sites = self
                    .bounded(introspect.list_nginx_sites(&record, false))
                    .await?;
                ServerEvent::NginxSitesList {
                    request_id,
                    session_id: record.id,
                    sites,
                }
            }
            Request::ListNginxSitesAvailable(p) => {
                let record = self.session(&p.session_id).await?;
                let sites = self
                    .bounded(introspect.list_nginx_sites(&record, true))
                    .await?;
                ServerEvent::NginxSitesAvailableList {
                    request_id,
                    session_id: record.id,
                    sites,
                }
            }
            Request::Disconnect(p) => {
                match self.session(&p.session_id).await {
                    Ok(_) | Err(RelayError::SessionExpired) => {}
                    Err(e) => return Err(e),
                }
                self.relay.exec.cancel_session(&p.session_id).await;
                self.relay.broker.close(&p.session_id).await;
                self.relay.broker.registry().delete(&p.session_id).await;
                self.sessions.remove(&p.session_id);
                info!("Session {} disconnected by client", p.session_id);
                ServerEvent::Status {
                    request_id,
                    session_id: Some(p.session_id),
                    status: ConnectionStatus::Disconnected,
                }
            }
        };
        Ok(Some(reply))
    }

    async fn connect(
        &self,
        payload: ConnectPayload,
        request_id: Option<String>,
    ) -> Result<ServerEvent> {
        let owner_id = self.user().await;
        let (session, credential) = match &payload.profile_id {
            Some(profile_id) => {
                let profile = self
                    .relay
                    .broker
                    .profiles()
                    .get(profile_id, owner_id.as_deref())
                    .await?;
                let credential = profile.credential()?;
                let session = NewSession {
                    owner_id: owner_id.clone(),
                    host: profile.host.clone(),
                    port: profile.port,
                    username: profile.username.clone(),
                    auth_kind: profile.auth_kind,
                    profile_id: Some(profile.id.clone()),
                    cwd: None,
                    hostname: None,
                };
                (session, credential)
            }
            None => direct_connection(&payload, owner_id.clone())?,
        };

        self.sink
            .send(ServerEvent::Status {
                request_id: request_id.clone(),
                session_id: None,
                status: ConnectionStatus::Connecting,
            })
            .await;

        let responder: Arc<dyn KiResponder> = Arc::new(ChannelKiResponder {
            sink: self.sink.clone(),
            pending: self.pending_ki.clone(),
            request_id: request_id.clone(),
        });
        let record = self
            .relay
            .broker
            .open_session(session, &credential, Some(responder))
            .await?;

        self.relay
            .broker
            .register_notifier(&record.id, self.sink.clone());
        self.sessions.insert(record.id.clone());
        Ok(connected_event(record, request_id, false))
    }
}

/// Session and credential for a connect request that carries its own secrets.
fn direct_connection(
    payload: &ConnectPayload,
    owner_id: Option<String>,
) -> Result<(NewSession, Credential)> {
    let required = |field: &Option<String>, name: &str| {
        field
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RelayError::InvalidRequest(format!("'{}' is required", name)))
    };
    let host = required(&payload.host, "host")?;
    let username = required(&payload.username, "username")?;

    let auth_kind = payload.auth_type.unwrap_or(if payload.private_key.is_some() {
        AuthKind::Key
    } else {
        AuthKind::Password
    });
    let credential = match auth_kind {
        AuthKind::Password => Credential::Password(
            payload
                .password
                .clone()
                .ok_or_else(|| RelayError::InvalidRequest("'password' is required".to_string()))?,
        ),
        AuthKind::Key => Credential::Key {
            private_key: required(&payload.private_key, "privateKey")?,
            passphrase: payload.passphrase.clone().filter(|p| !p.is_empty()),
        },
    };

    let session = NewSession {
        owner_id,
        host,
        port: payload.port.unwrap_or(22),
        username,
        auth_kind,
        profile_id: None,
        cwd: None,
        hostname: None,
    };
    Ok((session, credential))
}

fn connected_event(record: SessionRecord, request_id: Option<String>, resumed: bool) -> ServerEvent {
    ServerEvent::Connected {
        request_id,
        session_id: record.id,
        cwd: record.cwd,
        hostname: record.hostname,
        host: record.host,
        port: record.port,
        username: record.username,
        resumed,
    }
}

fn ok_event(request_id: Option<String>, session_id: String, path: Option<String>) -> ServerEvent {
    ServerEvent::Ok {
        request_id,
        session_id,
        path,
    }
}

/// Relays keyboard-interactive challenges to the channel that asked to connect.
struct ChannelKiResponder {
    sink: EventSink,
    pending: PendingPrompts,
    request_id: Option<String>,
}

#[async_trait]
impl KiResponder for ChannelKiResponder {
    async fn respond(&self, challenge: KiChallenge) -> Result<Vec<String>> {
        let prompt_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(prompt_id.clone(), tx);

        let sent = self
            .sink
            .send(ServerEvent::KiPrompt {
                request_id: self.request_id.clone(),
                prompt_id: prompt_id.clone(),
                name: challenge.name,
                instructions: challenge.instructions,
                prompts: challenge.prompts,
            })
            .await;
        if !sent {
            self.pending.remove(&prompt_id);
            return Err(RelayError::ConnectionFailed(
                "client went away during interactive authentication".to_string(),
            ));
        }

        match tokio::time::timeout(KI_RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(answers)) => Ok(answers),
            Ok(Err(_)) => Err(RelayError::ConnectionFailed(
                "interactive authentication was abandoned".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&prompt_id);
                warn!("Interactive authentication prompt {} timed out", prompt_id);
                Err(RelayError::ConnectionFailed(
                    "timed out waiting for interactive authentication answers".to_string(),
                ))
            }
        }
    }
}
