//! Control-channel message types.
//!
//! Inbound frames are `{"type", "requestId"?, "payload"?}` envelopes. The
//! `type`/`payload` pair is decoded into the closed [`Request`] union; anything
//! that does not match a known shape is rejected before it reaches a component.
//!
//! Outbound frames are [`ServerEvent`] values serialized with a `type` tag and
//! camelCase field names.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::error::RelayError;
use super::introspect::{ContainerEntry, ImageEntry, ServiceEntry};
use super::registry::AuthKind;
use super::remote::KiPrompt;
use super::sftp::EntryKind;

/// Wire envelope of every inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthKind>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for ConnectPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectPayload")
            .field("profile_id", &self.profile_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiResponsePayload {
    pub prompt_id: String,
    #[serde(default)]
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDirPayload {
    pub session_id: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFilePayload {
    pub session_id: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePayload {
    pub session_id: String,
    pub path: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    pub session_id: String,
    pub source: String,
    pub destination_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPayload {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStopPayload {
    pub session_id: String,
    pub command_id: String,
}

/// Every message kind a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    Auth(AuthPayload),
    Connect(ConnectPayload),
    Attach(SessionPayload),
    KiResponse(KiResponsePayload),
    GetCwd(SessionPayload),
    SetCwd(PathPayload),
    ListDir(ListDirPayload),
    Mkdir(PathPayload),
    CreateFile(PathPayload),
    ReadFile(PathPayload),
    WriteFile(WriteFilePayload),
    RenamePath(RenamePayload),
    DeletePath(PathPayload),
    CopyPath(TransferPayload),
    MovePath(TransferPayload),
    Exec(ExecPayload),
    ExecStop(ExecStopPayload),
    ListServices(SessionPayload),
    ListDockerContainers(SessionPayload),
    ListDockerImages(SessionPayload),
    ListNginxSites(SessionPayload),
    ListNginxSitesAvailable(SessionPayload),
    Disconnect(SessionPayload),
}

/// `type` values accepted on the control channel.
pub const REQUEST_TYPES: &[&str] = &[
    "auth",
    "connect",
    "attach",
    "ki_response",
    "get_cwd",
    "set_cwd",
    "list_dir",
    "mkdir",
    "create_file",
    "read_file",
    "write_file",
    "rename_path",
    "delete_path",
    "copy_path",
    "move_path",
    "exec",
    "exec_stop",
    "list_services",
    "list_docker_containers",
    "list_docker_images",
    "list_nginx_sites",
    "list_nginx_sites_available",
    "disconnect",
];

impl Request {
    /// Decode an envelope's `type` and `payload` into a request.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, RelayError> {
        if !REQUEST_TYPES.contains(&envelope.kind.as_str()) {
            return Err(RelayError::InvalidRequest(format!(
                "Unknown message type '{}'",
                envelope.kind
            )));
        }
        let tagged = json!({ "type": envelope.kind, "payload": envelope.payload });
        serde_json::from_value(tagged).map_err(|e| {
            RelayError::InvalidRequest(format!("Invalid payload for '{}': {}", envelope.kind, e))
        })
    }

    /// Session the request targets, when it targets one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Request::Auth(_) | Request::Connect(_) | Request::KiResponse(_) => None,
            Request::Attach(p)
            | Request::GetCwd(p)
            | Request::ListServices(p)
            | Request::ListDockerContainers(p)
            | Request::ListDockerImages(p)
            | Request::ListNginxSites(p)
            | Request::ListNginxSitesAvailable(p)
            | Request::Disconnect(p) => Some(&p.session_id),
            Request::SetCwd(p)
            | Request::Mkdir(p)
            | Request::CreateFile(p)
            | Request::ReadFile(p)
            | Request::DeletePath(p) => Some(&p.session_id),
            Request::ListDir(p) => Some(&p.session_id),
            Request::WriteFile(p) => Some(&p.session_id),
            Request::RenamePath(p) => Some(&p.session_id),
            Request::CopyPath(p) | Request::MovePath(p) => Some(&p.session_id),
            Request::Exec(p) => Some(&p.session_id),
            Request::ExecStop(p) => Some(&p.session_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirListEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<u64>,
    pub permissions: Option<String>,
}

/// Every event the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    AuthOk {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        user_id: String,
    },
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        status: ConnectionStatus,
    },
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        cwd: String,
        hostname: Option<String>,
        host: String,
        port: u16,
        username: String,
        resumed: bool,
    },
    KiPrompt {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        prompt_id: String,
        name: String,
        instructions: String,
        prompts: Vec<KiPrompt>,
    },
    Cwd {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        cwd: String,
    },
    DirList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        path: String,
        entries: Vec<DirListEntry>,
    },
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        path: String,
        content: String,
        size: u64,
    },
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: String,
        message: String,
    },
    ExecStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        command_id: String,
        command: String,
        cwd: String,
    },
    Stdout {
        session_id: String,
        command_id: String,
        data: String,
    },
    Stderr {
        session_id: String,
        command_id: String,
        data: String,
    },
    ExecEnd {
        session_id: String,
        command_id: String,
        code: Option<u32>,
        signal: Option<String>,
    },
    ServicesList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        services: Vec<ServiceEntry>,
    },
    DockerContainersList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        containers: Vec<ContainerEntry>,
    },
    DockerImagesList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        images: Vec<ImageEntry>,
    },
    NginxSitesList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        sites: Vec<String>,
    },
    NginxSitesAvailableList {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        sites: Vec<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &RelayError, request_id: Option<String>, session_id: Option<String>) -> Self {
        ServerEvent::Error {
            request_id,
            session_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outbound queue of one control channel.
///
/// Cloned into every task that produces events for the channel; the writer
/// task drains the other end into the socket.
#[derive(Clone)]
pub struct EventSink {
    channel_id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSink {
    pub fn new(channel_id: u64, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { channel_id, tx }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Queue an event. Returns false once the channel is gone.
    pub async fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}
