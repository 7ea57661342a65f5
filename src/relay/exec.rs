//! Command execution engine.
//!
//! Every execution runs on its own pty channel with the session's working
//! directory emulated by a `cd` prefix. Output is streamed to the requesting
//! control channel as `stdout`/`stderr` events and terminated by exactly one
//! `exec_end`.
//!
//! # Limits
//!
//! - At most [`MAX_EXECUTIONS_PER_SESSION`] in-flight executions per session
//! - `stop` interrupts first and force-closes the channel after the grace period

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::ConnectionBroker;
use super::error::{RelayError, Result};
use super::external::{AuditRecord, AuditStatus, AuditStore};
use super::protocol::{EventSink, ServerEvent};
use super::registry::SessionRecord;
use super::remote::{ExecControl, ExecOutput, ExecStream, shell_quote};

/// Maximum number of concurrent executions per session
pub const MAX_EXECUTIONS_PER_SESSION: usize = 30;

/// State of one in-flight execution.
struct RunningExecution {
    session_id: String,
    control: Arc<dyn ExecControl>,
    /// Cancelled once the output stream has ended and `exec_end` was sent.
    done: CancellationToken,
}

/// Execution storage with a session index.
///
/// A session's slot is reserved before the channel is opened so the
/// per-session cap holds under concurrent `exec` requests.
#[derive(Default)]
struct ExecutionRegistry {
    executions: DashMap<String, RunningExecution>,
    by_session: DashMap<String, HashSet<String>>,
}

impl ExecutionRegistry {
    fn reserve(&self, session_id: &str, command_id: &str) -> Result<()> {
        let mut ids = self.by_session.entry(session_id.to_string()).or_default();
        if ids.len() >= MAX_EXECUTIONS_PER_SESSION {
            return Err(RelayError::InvalidRequest(format!(
                "Maximum number of running commands ({}) reached for this session",
                MAX_EXECUTIONS_PER_SESSION
            )));
        }
        ids.insert(command_id.to_string());
        Ok(())
    }

    fn release(&self, session_id: &str, command_id: &str) {
        if let Some(mut ids) = self.by_session.get_mut(session_id) {
            ids.remove(command_id);
            if ids.is_empty() {
                drop(ids);
                self.by_session
                    .remove_if(session_id, |_, ids| ids.is_empty());
            }
        }
    }

    fn register(&self, command_id: String, execution: RunningExecution) {
        self.executions.insert(command_id, execution);
    }

    fn unregister(&self, command_id: &str) -> Option<RunningExecution> {
        let removed = self.executions.remove(command_id).map(|(_, e)| e);
        if let Some(ref execution) = removed {
            self.release(&execution.session_id, command_id);
        }
        removed
    }

    fn list_by_session(&self, session_id: &str) -> Vec<String> {
        self.by_session
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn count_by_session(&self, session_id: &str) -> usize {
        self.by_session
            .get(session_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

/// Turns arbitrary byte chunks into text without splitting multi-byte characters.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Append `bytes`, returning every complete character seen so far.
    /// Invalid sequences become U+FFFD.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete trailing sequence, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Whatever is left once the stream ended.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Who asked for an execution and where its events go.
pub struct ExecRequest {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub sink: EventSink,
}

pub struct ExecEngine {
    broker: Arc<ConnectionBroker>,
    audit: Arc<dyn AuditStore>,
    executions: ExecutionRegistry,
    stop_grace: Duration,
}

impl ExecEngine {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        audit: Arc<dyn AuditStore>,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            audit,
            executions: ExecutionRegistry::default(),
            stop_grace,
        })
    }

    /// Start `command` in the session's working directory.
    ///
    /// Sends `exec_start` before returning; output and `exec_end` follow from
    /// a background task. Returns the command id.
    pub async fn exec(
        self: &Arc<Self>,
        session: &SessionRecord,
        command: &str,
        request: ExecRequest,
    ) -> Result<String> {
        let command = command.trim();
        if command.is_empty() {
            return Err(RelayError::InvalidRequest("command is empty".to_string()));
        }

        let command_id = Uuid::new_v4().to_string();
        self.executions.reserve(&session.id, &command_id)?;

        let stream: Result<ExecStream> = async {
            let host = self.broker.get_or_connect(&session.id).await?;
            let wrapped = format!("cd {} && {}", shell_quote(&session.cwd), command);
            host.open_exec(&wrapped, true).await
        }
        .await;
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.executions.release(&session.id, &command_id);
                return Err(e);
            }
        };

        let done = CancellationToken::new();
        self.executions.register(
            command_id.clone(),
            RunningExecution {
                session_id: session.id.clone(),
                control: stream.control,
                done: done.clone(),
            },
        );

        let record = AuditRecord {
            command_id: command_id.clone(),
            user_id: request.user_id,
            session_id: session.id.clone(),
            command: command.to_string(),
            status: AuditStatus::Running,
            exit_code: None,
            signal: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.audit.started(&record).await;

        info!(
            "Started command {} on session {} in {}",
            command_id, session.id, session.cwd
        );
        request
            .sink
            .send(ServerEvent::ExecStart {
                request_id: request.request_id,
                session_id: session.id.clone(),
                command_id: command_id.clone(),
                command: command.to_string(),
                cwd: session.cwd.clone(),
            })
            .await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .pump(stream.output, record, request.sink, done)
                .await;
        });

        Ok(command_id)
    }

    async fn pump(
        &self,
        mut output: mpsc::Receiver<ExecOutput>,
        mut record: AuditRecord,
        sink: EventSink,
        done: CancellationToken,
    ) {
        let session_id = record.session_id.clone();
        let command_id = record.command_id.clone();
        let stdout_event = |data: String| ServerEvent::Stdout {
            session_id: session_id.clone(),
            command_id: command_id.clone(),
            data,
        };
        let stderr_event = |data: String| ServerEvent::Stderr {
            session_id: session_id.clone(),
            command_id: command_id.clone(),
            data,
        };

        let mut stdout = Utf8Chunker::default();
        let mut stderr = Utf8Chunker::default();
        let mut code = None;
        let mut signal = None;

        while let Some(item) = output.recv().await {
            match item {
                ExecOutput::Stdout(bytes) => {
                    if let Some(text) = stdout.push(&bytes) {
                        sink.send(stdout_event(text)).await;
                    }
                }
                ExecOutput::Stderr(bytes) => {
                    if let Some(text) = stderr.push(&bytes) {
                        sink.send(stderr_event(text)).await;
                    }
                }
                ExecOutput::Finished {
                    code: c,
                    signal: s,
                } => {
                    code = c;
                    signal = s;
                    break;
                }
            }
        }
        if let Some(text) = stdout.finish() {
            sink.send(stdout_event(text)).await;
        }
        if let Some(text) = stderr.finish() {
            sink.send(stderr_event(text)).await;
        }

        self.executions.unregister(&command_id);

        record.status = AuditStatus::Finished;
        record.exit_code = code;
        record.signal = signal.clone();
        record.finished_at = Some(Utc::now());
        self.audit.finished(&record).await;

        debug!(
            "Command {} finished with code {:?}, signal {:?}",
            command_id, code, signal
        );
        let delivered = sink
            .send(ServerEvent::ExecEnd {
                session_id,
                command_id,
                code,
                signal,
            })
            .await;
        if !delivered {
            debug!("Control channel gone before exec_end was delivered");
        }
        done.cancel();
    }

    /// Interrupt an execution, force-closing its channel if it outlives the grace period.
    pub async fn stop(&self, session_id: &str, command_id: &str) -> Result<()> {
        let (control, done) = match self.executions.executions.get(command_id) {
            Some(e) if e.session_id == session_id => (e.control.clone(), e.done.clone()),
            _ => {
                return Err(RelayError::NotFound(format!(
                    "command {} in session {}",
                    command_id, session_id
                )));
            }
        };

        control.interrupt().await;
        if tokio::time::timeout(self.stop_grace, done.cancelled())
            .await
            .is_err()
        {
            warn!(
                "Command {} ignored interrupt for {:?}, closing its channel",
                command_id, self.stop_grace
            );
            control.close().await;
        }
        Ok(())
    }

    /// Force-close every execution of a session.
    pub async fn cancel_session(&self, session_id: &str) {
        let controls: Vec<Arc<dyn ExecControl>> = self
            .executions
            .list_by_session(session_id)
            .iter()
            .filter_map(|id| self.executions.executions.get(id).map(|e| e.control.clone()))
            .collect();
        if !controls.is_empty() {
            info!(
                "Closing {} running command(s) of session {}",
                controls.len(),
                session_id
            );
        }
        for control in controls {
            control.close().await;
        }
    }

    pub fn has_running(&self, session_id: &str) -> bool {
        self.executions.count_by_session(session_id) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::external::MemoryProfileStore;
    use crate::relay::registry::{AuthKind, MemorySessionRegistry, NewSession};
    use crate::relay::remote::Credential;
    use crate::relay::testing::{ExecEnd, MemoryAuditStore, MockConnector};

    struct Fixture {
        connector: Arc<MockConnector>,
        audit: Arc<MemoryAuditStore>,
        engine: Arc<ExecEngine>,
        session: SessionRecord,
    }

    async fn fixture() -> Fixture {
        let connector = Arc::new(MockConnector::new());
        connector.on_run("hostname", "/home/deploy\nweb-1\n", "", 0);
        let broker = ConnectionBroker::new(
            connector.clone(),
            Arc::new(MemorySessionRegistry::new(Duration::from_secs(1800))),
            Arc::new(MemoryProfileStore::new()),
        );
        let session = broker
            .open_session(
                NewSession {
                    owner_id: Some("alice".to_string()),
                    host: "web.internal".to_string(),
                    port: 22,
                    username: "deploy".to_string(),
                    auth_kind: AuthKind::Password,
                    profile_id: None,
                    cwd: None,
                    hostname: None,
                },
                &Credential::Password("secret".to_string()),
                None,
            )
            .await
            .unwrap();
        let audit = Arc::new(MemoryAuditStore::default());
        let engine = ExecEngine::new(broker, audit.clone(), Duration::from_millis(800));
        Fixture {
            connector,
            audit,
            engine,
            session,
        }
    }

    fn request(sink: EventSink) -> ExecRequest {
        ExecRequest {
            user_id: Some("alice".to_string()),
            request_id: Some("r1".to_string()),
            sink,
        }
    }

    fn sink() -> (EventSink, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (EventSink::new(1, tx), rx)
    }

    /// Collect events up to and including `exec_end`.
    async fn collect(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let end = matches!(event, ServerEvent::ExecEnd { .. });
            events.push(event);
            if end {
                break;
            }
        }
        events
    }

    mod streaming {
        use super::*;

        #[tokio::test]
        async fn test_pwd_streams_start_output_end() {
            let fx = fixture().await;
            fx.connector.on_exec(
                "pwd",
                vec![ExecOutput::Stdout(b"/home/deploy\r\n".to_vec())],
                ExecEnd::Exit(0),
            );
            let (sink, mut rx) = sink();

            let command_id = fx
                .engine
                .exec(&fx.session, "pwd", request(sink))
                .await
                .unwrap();
            let events = collect(&mut rx).await;

            assert!(matches!(
                &events[0],
                ServerEvent::ExecStart { command_id: id, cwd, request_id: Some(r), .. }
                    if *id == command_id && cwd == "/home/deploy" && r == "r1"
            ));
            let stdout: String = events
                .iter()
                .filter_map(|e| match e {
                    ServerEvent::Stdout { data, .. } => Some(data.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(stdout.trim(), "/home/deploy");
            assert!(matches!(
                events.last(),
                Some(ServerEvent::ExecEnd { code: Some(0), signal: None, .. })
            ));
            assert!(
                fx.connector
                    .commands()
                    .contains(&"cd '/home/deploy' && pwd".to_string())
            );
        }

        #[tokio::test]
        async fn test_multibyte_character_is_not_split() {
            let fx = fixture().await;
            let bytes = "héllo".as_bytes().to_vec();
            fx.connector.on_exec(
                "greet",
                vec![
                    ExecOutput::Stdout(bytes[..2].to_vec()),
                    ExecOutput::Stdout(bytes[2..].to_vec()),
                    ExecOutput::Stderr(b"warn".to_vec()),
                ],
                ExecEnd::Exit(3),
            );
            let (sink, mut rx) = sink();
            fx.engine
                .exec(&fx.session, "greet", request(sink))
                .await
                .unwrap();
            let events = collect(&mut rx).await;

            let chunks: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    ServerEvent::Stdout { data, .. } => Some(data.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(chunks, vec!["h", "éllo"]);
            assert!(events.iter().any(
                |e| matches!(e, ServerEvent::Stderr { data, .. } if data == "warn")
            ));
            assert!(matches!(
                events.last(),
                Some(ServerEvent::ExecEnd { code: Some(3), .. })
            ));
        }

        #[tokio::test]
        async fn test_audit_records_start_and_finish() {
            let fx = fixture().await;
            let (sink, mut rx) = sink();
            let command_id = fx
                .engine
                .exec(&fx.session, "true", request(sink))
                .await
                .unwrap();
            collect(&mut rx).await;

            let started = fx.audit.started.lock().unwrap().clone();
            let finished = fx.audit.finished.lock().unwrap().clone();
            assert_eq!(started.len(), 1);
            assert_eq!(started[0].status, AuditStatus::Running);
            assert_eq!(started[0].user_id.as_deref(), Some("alice"));
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].command_id, command_id);
            assert_eq!(finished[0].status, AuditStatus::Finished);
            assert_eq!(finished[0].exit_code, Some(0));
            assert!(finished[0].finished_at.is_some());
        }

        #[tokio::test]
        async fn test_empty_command_is_rejected() {
            let fx = fixture().await;
            let (sink, _rx) = sink();
            let err = fx
                .engine
                .exec(&fx.session, "   ", request(sink))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::InvalidRequest(_)));
            assert!(!fx.engine.has_running(&fx.session.id));
        }

        #[tokio::test]
        async fn test_cap_per_session() {
            let fx = fixture().await;
            fx.connector.on_exec("sleep", Vec::new(), ExecEnd::UntilClose);
            let (sink, _rx) = sink();
            for _ in 0..MAX_EXECUTIONS_PER_SESSION {
                fx.engine
                    .exec(&fx.session, "sleep 100", request(sink.clone()))
                    .await
                    .unwrap();
            }
            let err = fx
                .engine
                .exec(&fx.session, "sleep 100", request(sink))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::InvalidRequest(_)));
        }
    }

    mod stopping {
        use super::*;

        #[tokio::test]
        async fn test_stop_after_finish_is_not_found() {
            let fx = fixture().await;
            let (sink, mut rx) = sink();
            let command_id = fx
                .engine
                .exec(&fx.session, "true", request(sink))
                .await
                .unwrap();
            collect(&mut rx).await;

            let err = fx
                .engine
                .stop(&fx.session.id, &command_id)
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
        }

        #[tokio::test]
        async fn test_stop_with_other_session_is_not_found() {
            let fx = fixture().await;
            fx.connector.on_exec("tail", Vec::new(), ExecEnd::UntilInterrupt);
            let (sink, _rx) = sink();
            let command_id = fx
                .engine
                .exec(&fx.session, "tail -f log", request(sink))
                .await
                .unwrap();
            let err = fx.engine.stop("other", &command_id).await.unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
        }

        #[tokio::test]
        async fn test_interrupt_ends_command_without_force_close() {
            let fx = fixture().await;
            fx.connector.on_exec("tail", Vec::new(), ExecEnd::UntilInterrupt);
            let (sink, mut rx) = sink();
            let command_id = fx
                .engine
                .exec(&fx.session, "tail -f log", request(sink))
                .await
                .unwrap();

            fx.engine.stop(&fx.session.id, &command_id).await.unwrap();
            let events = collect(&mut rx).await;

            let host = fx.connector.last_host().unwrap();
            assert_eq!(host.interrupts.load(std::sync::atomic::Ordering::SeqCst), 1);
            assert_eq!(host.forced_closes.load(std::sync::atomic::Ordering::SeqCst), 0);
            assert!(matches!(
                events.last(),
                Some(ServerEvent::ExecEnd { code: None, signal: Some(s), .. }) if s == "INT"
            ));
            assert!(!fx.engine.has_running(&fx.session.id));
        }

        #[tokio::test(start_paused = true)]
        async fn test_force_close_after_grace() {
            let fx = fixture().await;
            fx.connector.on_exec("top", Vec::new(), ExecEnd::UntilClose);
            let (sink, mut rx) = sink();
            let command_id = fx
                .engine
                .exec(&fx.session, "top", request(sink))
                .await
                .unwrap();

            let started = tokio::time::Instant::now();
            fx.engine.stop(&fx.session.id, &command_id).await.unwrap();
            assert!(started.elapsed() >= Duration::from_millis(800));

            let host = fx.connector.last_host().unwrap();
            assert_eq!(host.forced_closes.load(std::sync::atomic::Ordering::SeqCst), 1);
            let events = collect(&mut rx).await;
            assert!(matches!(
                events.last(),
                Some(ServerEvent::ExecEnd { code: None, .. })
            ));
        }

        #[tokio::test]
        async fn test_cancel_session_closes_everything() {
            let fx = fixture().await;
            fx.connector.on_exec("sleep", Vec::new(), ExecEnd::UntilClose);
            let (sink, mut rx) = sink();
            for _ in 0..3 {
                fx.engine
                    .exec(&fx.session, "sleep 100", request(sink.clone()))
                    .await
                    .unwrap();
            }
            assert!(fx.engine.has_running(&fx.session.id));

            fx.engine.cancel_session(&fx.session.id).await;

            let mut ended = 0;
            while ended < 3 {
                if let Some(ServerEvent::ExecEnd { .. }) = rx.recv().await {
                    ended += 1;
                }
            }
            let host = fx.connector.last_host().unwrap();
            assert_eq!(host.forced_closes.load(std::sync::atomic::Ordering::SeqCst), 3);
        }
    }

    mod chunking {
        use super::*;

        #[test]
        fn test_invalid_bytes_become_replacement() {
            let mut chunker = Utf8Chunker::default();
            assert_eq!(chunker.push(b"a\xffb").as_deref(), Some("a\u{fffd}b"));
        }

        #[test]
        fn test_truncated_tail_is_flushed_at_finish() {
            let mut chunker = Utf8Chunker::default();
            assert_eq!(chunker.push(&[0xe2, 0x82]), None);
            assert_eq!(chunker.finish().as_deref(), Some("\u{fffd}"));
            assert_eq!(chunker.finish(), None);
        }
    }
}
