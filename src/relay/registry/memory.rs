//! DashMap-based session registry.
//!
//! Expiry uses `tokio::time::Instant`, so tests can drive it with a paused clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::relay::error::{RelayError, Result};
use crate::relay::path;

use super::traits::{NewSession, SessionPatch, SessionRecord, SessionRegistry};

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

pub struct MemorySessionRegistry {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl MemorySessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Number of stored records, expired or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove the entry when it has expired. Returns true if it was removed.
    fn evict_if_expired(&self, session_id: &str, now: Instant) -> bool {
        self.entries
            .remove_if(session_id, |_, entry| entry.expires_at <= now)
            .is_some()
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn create(&self, session: NewSession) -> Result<SessionRecord> {
        let cwd = match session.cwd {
            Some(raw) => path::normalize(&raw)?,
            None => "/".to_string(),
        };
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: session.owner_id,
            host: session.host,
            port: session.port,
            username: session.username,
            auth_kind: session.auth_kind,
            profile_id: session.profile_id,
            cwd,
            hostname: session.hostname,
            created_at: now,
            last_used_at: now,
        };
        self.entries.insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(record)
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord> {
        let now = Instant::now();
        if self.evict_if_expired(session_id, now) {
            return Err(RelayError::SessionExpired);
        }
        let mut entry = self
            .entries
            .get_mut(session_id)
            .ok_or(RelayError::SessionExpired)?;
        entry.expires_at = now + self.ttl;
        Ok(entry.record.clone())
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<SessionRecord> {
        let cwd = patch.cwd.as_deref().map(path::normalize).transpose()?;

        let now = Instant::now();
        if self.evict_if_expired(session_id, now) {
            return Err(RelayError::SessionExpired);
        }
        let mut entry = self
            .entries
            .get_mut(session_id)
            .ok_or(RelayError::SessionExpired)?;

        if let Some(cwd) = cwd {
            entry.record.cwd = cwd;
        }
        if let Some(hostname) = patch.hostname {
            entry.record.hostname = Some(hostname);
        }
        entry.record.last_used_at = Utc::now();
        entry.expires_at = now + self.ttl;
        Ok(entry.record.clone())
    }

    async fn delete(&self, session_id: &str) {
        self.entries.remove(session_id);
    }

    async fn exists(&self, session_id: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(session_id)
            .is_some_and(|entry| entry.expires_at > now)
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}
