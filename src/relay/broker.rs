//! Connection broker.
//!
//! Owns the cache of live SSH connections and their SFTP channels, keyed by
//! session id. Connections are opened at most once per session at a time: a
//! per-session lock serializes reconnects, and the cache is re-checked after
//! the lock is taken.
//!
//! Every cached connection and channel gets a watcher task on its `closed`
//! token. When the transport goes away the watcher evicts exactly the entry
//! it was spawned for (tracked by generation) and tells the client that most
//! recently connected or attached the session.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{RelayError, Result};
use super::external::ProfileStore;
use super::path;
use super::protocol::{ConnectionStatus, EventSink, ServerEvent};
use super::registry::{NewSession, SessionRecord, SessionRegistry};
use super::remote::{ConnectTarget, Connector, Credential, KiResponder, RemoteHost};
use super::sftp::SftpPrimitives;

/// Bound on the `pwd`/`hostname` probe run after a fresh connect
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command printing the login directory and the host name, one per line
const PROBE_COMMAND: &str = "pwd; hostname";

struct Cached<T: ?Sized> {
    value: Arc<T>,
    generation: u64,
}

pub struct ConnectionBroker {
    connector: Arc<dyn Connector>,
    registry: Arc<dyn SessionRegistry>,
    profiles: Arc<dyn ProfileStore>,
    connections: DashMap<String, Cached<dyn RemoteHost>>,
    channels: DashMap<String, Cached<dyn SftpPrimitives>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    notifiers: DashMap<String, EventSink>,
    generation: AtomicU64,
}

impl ConnectionBroker {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<dyn SessionRegistry>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            registry,
            profiles,
            connections: DashMap::new(),
            channels: DashMap::new(),
            connect_locks: DashMap::new(),
            channel_locks: DashMap::new(),
            notifiers: DashMap::new(),
            generation: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    /// Connect, probe the login context, register the session and cache the connection.
    ///
    /// Nothing is registered when the handshake or authentication fails.
    pub async fn open_session(
        self: &Arc<Self>,
        session: NewSession,
        credential: &Credential,
        ki: Option<Arc<dyn KiResponder>>,
    ) -> Result<SessionRecord> {
        let target = ConnectTarget {
            host: session.host.clone(),
            port: session.port,
            username: session.username.clone(),
        };
        let host = self.connector.connect(&target, credential, ki).await?;
        let (cwd, hostname) = probe_context(host.as_ref()).await;

        let record = match self
            .registry
            .create(NewSession {
                cwd: Some(cwd),
                hostname,
                ..session
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                host.close().await;
                return Err(e);
            }
        };

        self.install_connection(&record.id, host);
        info!(
            "Session {} opened for {}@{}:{}",
            record.id, record.username, record.host, record.port
        );
        Ok(record)
    }

    fn live_connection(&self, session_id: &str) -> Option<Arc<dyn RemoteHost>> {
        self.connections
            .get(session_id)
            .map(|cached| cached.value.clone())
            .filter(|host| !host.closed().is_cancelled())
    }

    /// Return the cached connection, reconnecting from the session record when there is none.
    pub async fn get_or_connect(self: &Arc<Self>, session_id: &str) -> Result<Arc<dyn RemoteHost>> {
        if let Some(host) = self.live_connection(session_id) {
            return Ok(host);
        }

        let lock = self
            .connect_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.reconnect_locked(session_id).await
        };
        if result.is_err() {
            // A failed reconnect leaves nothing cached, so nothing else would release the lock
            drop(lock);
            release_lock(&self.connect_locks, session_id);
        }
        result
    }

    async fn reconnect_locked(self: &Arc<Self>, session_id: &str) -> Result<Arc<dyn RemoteHost>> {
        // Another caller may have connected while we waited
        if let Some(host) = self.live_connection(session_id) {
            return Ok(host);
        }

        let record = self.registry.get(session_id).await?;
        let credential = self.reconnect_credential(&record).await?;
        let target = ConnectTarget {
            host: record.host.clone(),
            port: record.port,
            username: record.username.clone(),
        };

        info!(
            "Reconnecting session {} to {}@{}:{}",
            session_id, target.username, target.host, target.port
        );
        let host = self.connector.connect(&target, &credential, None).await?;
        self.install_connection(session_id, host.clone());
        Ok(host)
    }

    async fn reconnect_credential(&self, record: &SessionRecord) -> Result<Credential> {
        let Some(profile_id) = record.profile_id.as_deref() else {
            return Err(RelayError::ConnectionFailed(
                "SSH connection lost. Please reconnect.".to_string(),
            ));
        };
        let profile = self
            .profiles
            .get(profile_id, record.owner_id.as_deref())
            .await
            .map_err(|e| match e {
                RelayError::NotFound(_) => RelayError::ConnectionFailed(format!(
                    "Saved profile {} not found",
                    profile_id
                )),
                other => other,
            })?;
        profile.credential()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn install_connection(self: &Arc<Self>, session_id: &str, host: Arc<dyn RemoteHost>) {
        let generation = self.next_generation();
        let closed = host.closed();
        if let Some(previous) = self.connections.insert(
            session_id.to_string(),
            Cached {
                value: host,
                generation,
            },
        ) {
            tokio::spawn(async move { previous.value.close().await });
        }

        let broker: Weak<Self> = Arc::downgrade(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(broker) = broker.upgrade() {
                broker.on_connection_closed(&session_id, generation).await;
            }
        });
    }

    async fn on_connection_closed(&self, session_id: &str, generation: u64) {
        let evicted = self
            .connections
            .remove_if(session_id, |_, cached| cached.generation == generation)
            .is_some();
        if !evicted {
            return;
        }

        info!("SSH connection for session {} closed", session_id);
        self.drop_sftp(session_id);

        let sink = self.notifiers.get(session_id).map(|s| s.clone());
        if let Some(sink) = sink {
            sink.send(ServerEvent::Status {
                request_id: None,
                session_id: Some(session_id.to_string()),
                status: ConnectionStatus::Disconnected,
            })
            .await;
        }
    }

    /// Return the cached SFTP channel or open one on `host`. Open failures are not cached.
    pub async fn get_or_open_sftp(
        self: &Arc<Self>,
        session_id: &str,
        host: &Arc<dyn RemoteHost>,
    ) -> Result<Arc<dyn SftpPrimitives>> {
        let cached = |broker: &Self| {
            broker
                .channels
                .get(session_id)
                .map(|c| c.value.clone())
                .filter(|sftp| !sftp.closed().is_cancelled())
        };
        if let Some(sftp) = cached(self) {
            return Ok(sftp);
        }

        let lock = self
            .channel_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(sftp) = cached(self) {
            return Ok(sftp);
        }

        let sftp = host.open_sftp().await?;
        let generation = self.next_generation();
        let closed = sftp.closed();
        self.channels.insert(
            session_id.to_string(),
            Cached {
                value: sftp.clone(),
                generation,
            },
        );

        let broker: Weak<Self> = Arc::downgrade(self);
        let id = session_id.to_string();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(broker) = broker.upgrade()
                && broker
                    .channels
                    .remove_if(&id, |_, cached| cached.generation == generation)
                    .is_some()
            {
                debug!("SFTP channel for session {} closed", id);
            }
        });

        Ok(sftp)
    }

    /// Evict the cached SFTP channel and close it in the background.
    pub fn drop_sftp(&self, session_id: &str) {
        if let Some((_, cached)) = self.channels.remove(session_id) {
            let sftp = cached.value;
            tokio::spawn(async move { sftp.shutdown().await });
        }
    }

    /// Run `op` against the session's SFTP channel.
    ///
    /// A channel-level failure evicts the channel and the operation is tried
    /// once more on a fresh one.
    pub async fn with_sftp<T, F, Fut>(self: &Arc<Self>, session_id: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn SftpPrimitives>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempt = || async {
            let host = self.get_or_connect(session_id).await?;
            let sftp = self.get_or_open_sftp(session_id, &host).await?;
            op(sftp).await
        };

        attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::ZERO)
                    .with_max_times(1),
            )
            .when(RelayError::is_channel_failure)
            .notify(|err, _| {
                warn!(
                    "SFTP channel for session {} failed: {}. Retrying on a fresh channel",
                    session_id, err
                );
                self.drop_sftp(session_id);
            })
            .await
    }

    /// Close the SFTP channel then the connection. Idempotent.
    pub async fn close(&self, session_id: &str) {
        if let Some((_, cached)) = self.channels.remove(session_id) {
            cached.value.shutdown().await;
        }
        if let Some((_, cached)) = self.connections.remove(session_id) {
            cached.value.close().await;
            info!("Closed SSH connection for session {}", session_id);
        }
        self.connect_locks.remove(session_id);
        self.channel_locks.remove(session_id);
        self.notifiers.remove(session_id);
    }

    /// Session ids with a cached connection.
    pub fn cached_session_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Session ids the broker holds any state for: connections, channels,
    /// locks or notification routes.
    pub fn tracked_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .chain(self.channels.iter().map(|e| e.key().clone()))
            .chain(self.connect_locks.iter().map(|e| e.key().clone()))
            .chain(self.channel_locks.iter().map(|e| e.key().clone()))
            .chain(self.notifiers.iter().map(|e| e.key().clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.live_connection(session_id).is_some()
    }

    /// Route broker notifications for `session_id` to `sink`.
    pub fn register_notifier(&self, session_id: &str, sink: EventSink) {
        self.notifiers.insert(session_id.to_string(), sink);
    }

    /// Forget every notification route pointing at a closed control channel.
    pub fn unregister_channel(&self, channel_id: u64) {
        self.notifiers
            .retain(|_, sink| sink.channel_id() != channel_id);
    }
}

/// Drop the lock entry for `session_id` unless another caller still holds it.
fn release_lock(locks: &DashMap<String, Arc<Mutex<()>>>, session_id: &str) {
    locks.remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
}

/// Best-effort login directory and host name of a fresh connection.
async fn probe_context(host: &dyn RemoteHost) -> (String, Option<String>) {
    let output = match host.run(PROBE_COMMAND, None, PROBE_TIMEOUT).await {
        Ok(output) => output,
        Err(e) => {
            debug!("Session context probe failed: {}", e);
            return ("/".to_string(), None);
        }
    };

    let stdout = output.stdout_text();
    let mut lines = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty());
    let cwd = lines
        .next()
        .and_then(|raw| path::normalize(raw).ok())
        .unwrap_or_else(|| "/".to_string());
    let hostname = lines.next().map(str::to_string);
    (cwd, hostname)
}
