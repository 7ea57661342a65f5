//! In-memory doubles for the transport seam, shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{RelayError, Result};
use super::external::{AuditRecord, AuditStore};
use super::path;
use super::remote::{
    CommandOutput, ConnectTarget, Connector, Credential, ExecControl, ExecOutput, ExecStream,
    KiResponder, RemoteHost,
};
use super::sftp::{DirEntry, EntryKind, FileStat, OpenMode, SftpHandle, SftpPrimitives};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

struct OpenFile {
    path: String,
    position: u64,
}

#[derive(Default)]
struct Fs {
    nodes: BTreeMap<String, Node>,
    denied: Vec<String>,
    handles: HashMap<u64, OpenFile>,
    fail_next: Option<RelayError>,
    fail_rename: Option<RelayError>,
}

impl Fs {
    fn check(&mut self, path: &str) -> Result<()> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        if self.denied.iter().any(|d| path::is_within(d, path)) {
            return Err(RelayError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(FileStat {
                kind: EntryKind::Dir,
                size: 4096,
                mtime: Some(1_700_000_000),
                permissions: Some(0o040755),
            }),
            Some(Node::File(content)) => Ok(FileStat {
                kind: EntryKind::File,
                size: content.len() as u64,
                mtime: Some(1_700_000_000),
                permissions: Some(0o100644),
            }),
            None => Err(RelayError::NotFound(path.to_string())),
        }
    }

    fn require_dir(&self, path: &str) -> Result<()> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            _ => Err(RelayError::NotFound(path.to_string())),
        }
    }
}

/// Filesystem-backed [`SftpPrimitives`] double.
///
/// Views created with [`MemorySftp::reopen`] share the same tree but have
/// their own channel lifetime, like successive SFTP channels on one host.
pub struct MemorySftp {
    fs: Arc<Mutex<Fs>>,
    next_handle: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl MemorySftp {
    pub fn new() -> Self {
        let mut fs = Fs::default();
        fs.nodes.insert("/".to_string(), Node::Dir);
        Self {
            fs: Arc::new(Mutex::new(fs)),
            next_handle: Arc::new(AtomicU64::new(1)),
            closed: CancellationToken::new(),
        }
    }

    pub fn reopen(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            next_handle: self.next_handle.clone(),
            closed: CancellationToken::new(),
        }
    }

    fn fs(&self) -> std::sync::MutexGuard<'_, Fs> {
        self.fs.lock().unwrap()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.fs()
            .nodes
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        self.fs().nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.fs().nodes.get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs().nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.fs().nodes.get(path), Some(Node::Dir))
    }

    pub fn open_handles(&self) -> usize {
        self.fs().handles.len()
    }

    /// Every operation on `path` or below fails with `PermissionDenied`.
    pub fn deny(&self, path: &str) {
        self.fs().denied.push(path.to_string());
    }

    /// The next operation on any view fails with `err`.
    pub fn fail_next(&self, err: RelayError) {
        self.fs().fail_next = Some(err);
    }

    /// The next rename fails with `err`.
    pub fn fail_rename(&self, err: RelayError) {
        self.fs().fail_rename = Some(err);
    }
}

#[async_trait]
impl SftpPrimitives for MemorySftp {
    async fn stat(&self, path: &str) -> Result<FileStat> {
        let mut fs = self.fs();
        fs.check(path)?;
        fs.stat(path)
    }

    async fn lstat(&self, path: &str) -> Result<FileStat> {
        self.stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut fs = self.fs();
        fs.check(path)?;
        fs.require_dir(&path::parent(path))?;
        if fs.nodes.contains_key(path) {
            return Err(RelayError::Sftp(format!("{} already exists", path)));
        }
        fs.nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<SftpHandle> {
        let mut fs = self.fs();
        fs.check(path)?;
        match (mode, fs.nodes.get(path).cloned()) {
            (_, Some(Node::Dir)) => {
                return Err(RelayError::Sftp(format!("{} is a directory", path)));
            }
            (OpenMode::Read, None) => return Err(RelayError::NotFound(path.to_string())),
            (OpenMode::Read, Some(_)) | (OpenMode::Create, Some(_)) => {}
            (OpenMode::Create, None) | (OpenMode::Truncate, _) => {
                fs.require_dir(&path::parent(path))?;
                fs.nodes.insert(path.to_string(), Node::File(Vec::new()));
            }
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        fs.handles.insert(
            id,
            OpenFile {
                path: path.to_string(),
                position: 0,
            },
        );
        Ok(SftpHandle(id))
    }

    async fn close(&self, handle: SftpHandle) -> Result<()> {
        self.fs()
            .handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| RelayError::Sftp("unknown handle".to_string()))
    }

    async fn read(&self, handle: SftpHandle, len: usize, offset: u64) -> Result<Vec<u8>> {
        let mut fs = self.fs();
        let path = fs
            .handles
            .get(&handle.0)
            .map(|f| f.path.clone())
            .ok_or_else(|| RelayError::Sftp("unknown handle".to_string()))?;
        fs.check(&path)?;
        match fs.nodes.get(&path) {
            Some(Node::File(content)) => {
                let start = (offset as usize).min(content.len());
                let end = (start + len).min(content.len());
                Ok(content[start..end].to_vec())
            }
            _ => Err(RelayError::NotFound(path)),
        }
    }

    async fn write_all(&self, handle: SftpHandle, bytes: &[u8]) -> Result<()> {
        let mut fs = self.fs();
        let (path, position) = fs
            .handles
            .get(&handle.0)
            .map(|f| (f.path.clone(), f.position as usize))
            .ok_or_else(|| RelayError::Sftp("unknown handle".to_string()))?;
        fs.check(&path)?;
        let Some(Node::File(content)) = fs.nodes.get_mut(&path) else {
            return Err(RelayError::NotFound(path));
        };
        let end = position + bytes.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[position..end].copy_from_slice(bytes);
        if let Some(open) = fs.handles.get_mut(&handle.0) {
            open.position = end as u64;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut fs = self.fs();
        if let Some(err) = fs.fail_rename.take() {
            return Err(err);
        }
        fs.check(from)?;
        fs.check(to)?;
        if !fs.nodes.contains_key(from) {
            return Err(RelayError::NotFound(from.to_string()));
        }
        if fs.nodes.contains_key(to) {
            return Err(RelayError::Sftp(format!("{} already exists", to)));
        }
        fs.require_dir(&path::parent(to))?;
        let moved: Vec<String> = fs
            .nodes
            .keys()
            .filter(|k| path::is_within(from, k))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = fs.nodes.remove(&key) {
                let suffix = &key[from.len()..];
                fs.nodes.insert(format!("{}{}", to, suffix), node);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let mut fs = self.fs();
        fs.check(path)?;
        match fs.nodes.get(path) {
            Some(Node::File(_)) => {
                fs.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir) => Err(RelayError::Sftp(format!("{} is a directory", path))),
            None => Err(RelayError::NotFound(path.to_string())),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let mut fs = self.fs();
        fs.check(path)?;
        fs.require_dir(path)?;
        let has_children = fs
            .nodes
            .keys()
            .any(|k| k != path && path::is_within(path, k));
        if has_children {
            return Err(RelayError::Sftp(format!("{} is not empty", path)));
        }
        fs.nodes.remove(path);
        Ok(())
    }

    async fn readdir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let mut fs = self.fs();
        fs.check(dir)?;
        fs.require_dir(dir)?;
        let children: Vec<String> = fs
            .nodes
            .keys()
            .filter(|k| k.as_str() != dir && path::parent(k) == dir)
            .cloned()
            .collect();
        children
            .into_iter()
            .map(|child| {
                let stat = fs.stat(&child)?;
                let name = path::file_name(&child).unwrap_or_default().to_string();
                Ok(DirEntry { name, stat })
            })
            .collect()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn shutdown(&self) {
        self.closed.cancel();
    }
}

/// How a scripted streaming execution ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEnd {
    Exit(u32),
    /// Runs until interrupted, then reports the INT signal.
    UntilInterrupt,
    /// Ignores interrupts; only a forced close ends it.
    UntilClose,
}

#[derive(Clone)]
enum Script {
    Run(CommandOutput),
    Exec(Vec<ExecOutput>, ExecEnd),
}

#[derive(Default)]
struct HostLog {
    commands: Vec<String>,
    stdin: Vec<Vec<u8>>,
}

/// Scripted [`RemoteHost`]. Scripts match on a substring of the command,
/// first match wins. Unmatched commands succeed with no output.
pub struct MockHost {
    scripts: Arc<Mutex<Vec<(String, Script)>>>,
    log: Arc<Mutex<HostLog>>,
    sftp: MemorySftp,
    sftp_opens: Arc<AtomicUsize>,
    closed: CancellationToken,
    closes: AtomicUsize,
    pub interrupts: Arc<AtomicUsize>,
    pub forced_closes: Arc<AtomicUsize>,
}

impl MockHost {
    pub fn trigger_close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn find(&self, command: &str) -> Option<Script> {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, script)| script.clone())
    }
}

struct MockExecControl {
    interrupted: CancellationToken,
    closed: CancellationToken,
    interrupts: Arc<AtomicUsize>,
    forced_closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecControl for MockExecControl {
    async fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupted.cancel();
    }

    async fn close(&self) {
        self.forced_closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

#[async_trait]
impl RemoteHost for MockHost {
    async fn open_exec(&self, command: &str, _pty: bool) -> Result<ExecStream> {
        self.log.lock().unwrap().commands.push(command.to_string());
        let (outputs, end) = match self.find(command) {
            Some(Script::Exec(outputs, end)) => (outputs, end),
            Some(Script::Run(out)) => {
                let mut outputs = vec![ExecOutput::Stdout(out.stdout)];
                if !out.stderr.is_empty() {
                    outputs.push(ExecOutput::Stderr(out.stderr.into_bytes()));
                }
                (outputs, ExecEnd::Exit(out.exit_code.unwrap_or(0)))
            }
            None => (Vec::new(), ExecEnd::Exit(0)),
        };

        let control = Arc::new(MockExecControl {
            interrupted: CancellationToken::new(),
            closed: CancellationToken::new(),
            interrupts: self.interrupts.clone(),
            forced_closes: self.forced_closes.clone(),
        });
        let (tx, rx) = mpsc::channel(64);
        let interrupted = control.interrupted.clone();
        let closed = control.closed.clone();

        tokio::spawn(async move {
            for item in outputs {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            let finished = match end {
                ExecEnd::Exit(code) => ExecOutput::Finished {
                    code: Some(code),
                    signal: None,
                },
                ExecEnd::UntilInterrupt => {
                    tokio::select! {
                        _ = interrupted.cancelled() => ExecOutput::Finished {
                            code: None,
                            signal: Some("INT".to_string()),
                        },
                        _ = closed.cancelled() => ExecOutput::Finished { code: None, signal: None },
                    }
                }
                ExecEnd::UntilClose => {
                    closed.cancelled().await;
                    ExecOutput::Finished {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = tx.send(finished).await;
        });

        Ok(ExecStream {
            output: rx,
            control,
        })
    }

    async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        {
            let mut log = self.log.lock().unwrap();
            log.commands.push(command.to_string());
            if let Some(input) = stdin {
                log.stdin.push(input);
            }
        }
        match self.find(command) {
            Some(Script::Run(out)) => Ok(out),
            Some(Script::Exec(..)) | None => Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            }),
        }
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpPrimitives>> {
        if self.closed.is_cancelled() {
            return Err(RelayError::ChannelFailure("connection closed".to_string()));
        }
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.sftp.reopen()))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// [`Connector`] producing [`MockHost`]s that share one filesystem and one script.
pub struct MockConnector {
    scripts: Arc<Mutex<Vec<(String, Script)>>>,
    log: Arc<Mutex<HostLog>>,
    sftp: MemorySftp,
    sftp_opens: Arc<AtomicUsize>,
    attempts: AtomicUsize,
    delay: Mutex<Duration>,
    fail_next: Mutex<Option<RelayError>>,
    hosts: Mutex<Vec<Arc<MockHost>>>,
    credentials: Mutex<Vec<Credential>>,
    ki_offered: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(HostLog::default())),
            sftp: MemorySftp::new(),
            sftp_opens: Arc::new(AtomicUsize::new(0)),
            attempts: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            fail_next: Mutex::new(None),
            hosts: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            ki_offered: AtomicUsize::new(0),
        }
    }

    /// Reply to commands containing `needle` with `output`.
    pub fn on_run(&self, needle: &str, stdout: &str, stderr: &str, exit_code: u32) {
        self.on_run_bytes(needle, stdout.as_bytes(), stderr, exit_code);
    }

    /// Like [`Self::on_run`], with arbitrary stdout bytes.
    pub fn on_run_bytes(&self, needle: &str, stdout: &[u8], stderr: &str, exit_code: u32) {
        self.scripts.lock().unwrap().push((
            needle.to_string(),
            Script::Run(CommandOutput {
                stdout: stdout.to_vec(),
                stderr: stderr.to_string(),
                exit_code: Some(exit_code),
            }),
        ));
    }

    /// Stream `outputs` for executions containing `needle`, then end as `end` says.
    pub fn on_exec(&self, needle: &str, outputs: Vec<ExecOutput>, end: ExecEnd) {
        self.scripts
            .lock()
            .unwrap()
            .push((needle.to_string(), Script::Exec(outputs, end)));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_next_connect(&self, err: RelayError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn sftp(&self) -> &MemorySftp {
        &self.sftp
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }

    pub fn ki_offered(&self) -> usize {
        self.ki_offered.load(Ordering::SeqCst)
    }

    pub fn last_host(&self) -> Option<Arc<MockHost>> {
        self.hosts.lock().unwrap().last().cloned()
    }

    pub fn last_credential(&self) -> Option<Credential> {
        self.credentials.lock().unwrap().last().cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().commands.clone()
    }

    pub fn stdin(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().stdin.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _target: &ConnectTarget,
        credential: &Credential,
        ki: Option<Arc<dyn KiResponder>>,
    ) -> Result<Arc<dyn RemoteHost>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if ki.is_some() {
            self.ki_offered.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        self.credentials.lock().unwrap().push(credential.clone());

        let host = Arc::new(MockHost {
            scripts: self.scripts.clone(),
            log: self.log.clone(),
            sftp: self.sftp.reopen(),
            sftp_opens: self.sftp_opens.clone(),
            closed: CancellationToken::new(),
            closes: AtomicUsize::new(0),
            interrupts: Arc::new(AtomicUsize::new(0)),
            forced_closes: Arc::new(AtomicUsize::new(0)),
        });
        self.hosts.lock().unwrap().push(host.clone());
        Ok(host)
    }
}

/// Audit store that keeps every write.
#[derive(Default)]
pub struct MemoryAuditStore {
    pub started: Mutex<Vec<AuditRecord>>,
    pub finished: Mutex<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn started(&self, record: &AuditRecord) {
        self.started.lock().unwrap().push(record.clone());
    }

    async fn finished(&self, record: &AuditRecord) {
        self.finished.lock().unwrap().push(record.clone());
    }
}
