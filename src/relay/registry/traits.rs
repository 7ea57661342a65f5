//! Session registry trait and record types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::relay::error::Result;

/// How the session authenticates to its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    Key,
}

/// Durable state of one logical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// `None` for anonymous sessions.
    pub owner_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    /// Saved profile used to reconnect, when the session was opened from one.
    pub profile_id: Option<String>,
    /// Always a canonical absolute path.
    pub cwd: String,
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Fields supplied when a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub owner_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub profile_id: Option<String>,
    /// Defaults to `/`.
    pub cwd: Option<String>,
    pub hostname: Option<String>,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub cwd: Option<String>,
    pub hostname: Option<String>,
}

/// TTL-backed store of session records.
///
/// Any call against an unknown or expired id fails with `SessionExpired`;
/// callers treat that as final rather than retrying.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Allocate an id and store the record with a fresh TTL.
    async fn create(&self, session: NewSession) -> Result<SessionRecord>;

    /// Fetch a record, extending its TTL.
    async fn get(&self, session_id: &str) -> Result<SessionRecord>;

    /// Merge `patch`, bump `last_used_at` and re-apply the TTL.
    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<SessionRecord>;

    /// Remove unconditionally.
    async fn delete(&self, session_id: &str);

    /// Whether a live record exists. Does not extend the TTL.
    async fn exists(&self, session_id: &str) -> bool;

    /// Drop expired records, returning how many were removed.
    async fn purge_expired(&self) -> usize;
}
