//! Collaborators the relay consumes but does not own.
//!
//! - [`TokenVerifier`]: binds a control channel to a user id
//! - [`ProfileStore`]: saved host profiles with their decrypted secrets
//! - [`AuditStore`]: command execution records
//!
//! The default implementations are deliberately small: a static token table
//! from the environment, an in-memory profile table optionally loaded from a
//! JSON file, and audit rows written as `tracing` events under the `audit` target.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{RelayError, Result};
use super::registry::AuthKind;
use super::remote::{ConnectTarget, Credential};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a bearer token to a user id.
    async fn verify(&self, token: &str) -> Result<String>;
}

/// Token table built from `token=userId` pairs.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| RelayError::Unauthorized("invalid or expired token".to_string()))
    }
}

fn default_port() -> u16 {
    22
}

/// A saved connection profile with decrypted secret material.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedProfile {
    pub id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for SavedProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedProfile")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_kind", &self.auth_kind)
            .finish_non_exhaustive()
    }
}

impl SavedProfile {
    pub fn target(&self) -> ConnectTarget {
        ConnectTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }

    pub fn credential(&self) -> Result<Credential> {
        match self.auth_kind {
            AuthKind::Password => self
                .password
                .clone()
                .map(Credential::Password)
                .ok_or_else(|| missing_secret(&self.id, "password")),
            AuthKind::Key => self
                .private_key
                .clone()
                .map(|private_key| Credential::Key {
                    private_key,
                    passphrase: self.passphrase.clone(),
                })
                .ok_or_else(|| missing_secret(&self.id, "private key")),
        }
    }
}

fn missing_secret(profile_id: &str, what: &str) -> RelayError {
    RelayError::ConnectionFailed(format!("Profile {} has no stored {}", profile_id, what))
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load a profile visible to `owner_id`. Profiles owned by someone else are `NotFound`.
    async fn get(&self, profile_id: &str, owner_id: Option<&str>) -> Result<SavedProfile>;
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: DashMap<String, SavedProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load profiles from a JSON array file.
    pub fn load_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let profiles: Vec<SavedProfile> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let store = Self::new();
        for profile in profiles {
            store.insert(profile);
        }
        Ok(store)
    }

    pub fn insert(&self, profile: SavedProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, profile_id: &str, owner_id: Option<&str>) -> Result<SavedProfile> {
        let not_found = || RelayError::NotFound(format!("profile {}", profile_id));
        let profile = self
            .profiles
            .get(profile_id)
            .map(|p| p.clone())
            .ok_or_else(not_found)?;
        match (&profile.owner_id, owner_id) {
            (Some(owner), Some(requester)) if owner != requester => Err(not_found()),
            (Some(_), None) => Err(not_found()),
            _ => Ok(profile),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Running,
    Finished,
}

/// One command execution as seen by the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub command_id: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub command: String,
    pub status: AuditStatus,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Audit writes never fail the operation they describe.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Record a started execution (status `running`).
    async fn started(&self, record: &AuditRecord);

    /// Record completion (status `finished`).
    async fn finished(&self, record: &AuditRecord);
}

/// Writes audit rows as structured `tracing` events.
pub struct TracingAuditStore;

#[async_trait]
impl AuditStore for TracingAuditStore {
    async fn started(&self, record: &AuditRecord) {
        info!(
            target: "audit",
            command_id = %record.command_id,
            user_id = record.user_id.as_deref().unwrap_or("-"),
            session_id = %record.session_id,
            command = %record.command,
            status = "running",
            "command started"
        );
    }

    async fn finished(&self, record: &AuditRecord) {
        info!(
            target: "audit",
            command_id = %record.command_id,
            session_id = %record.session_id,
            status = "finished",
            exit_code = ?record.exit_code,
            signal = ?record.signal,
            "command finished"
        );
    }
}
