//! SFTP primitive layer.
//!
//! [`SftpPrimitives`] is a uniform request/response surface over the remote
//! file-transfer subsystem. Every call is a single outcome; failures are
//! classified into [`RelayError`] so callers can tell permission problems
//! (privilege fallback) from channel failures (reopen once) from everything else.
//!
//! The recursive helpers ([`copy_file`], [`copy_dir_recursive`],
//! [`remove_recursive`]) are written against the trait so they work on any
//! implementation. Transfers move at most [`CHUNK_SIZE`] bytes at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use russh_sftp::client::SftpSession;
use russh_sftp::client::fs::File;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{RelayError, Result};
use super::path;

/// Transfer unit for reads, writes and copies (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hard ceiling on directory recursion depth
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: Option<u64>,
    /// Mode bits including the file type.
    pub permissions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create when missing, keep existing content.
    Create,
    /// Create when missing, truncate existing content.
    Truncate,
}

/// Opaque handle to an open remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SftpHandle(pub u64);

#[async_trait]
pub trait SftpPrimitives: Send + Sync {
    /// Stat following symlinks.
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Stat without following symlinks.
    async fn lstat(&self, path: &str) -> Result<FileStat>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<SftpHandle>;

    async fn close(&self, handle: SftpHandle) -> Result<()>;

    /// Read up to `len` bytes at `offset`. An empty result means end of file.
    async fn read(&self, handle: SftpHandle, len: usize, offset: u64) -> Result<Vec<u8>>;

    /// Append `bytes` at the handle's position, looping until all are accepted.
    async fn write_all(&self, handle: SftpHandle, bytes: &[u8]) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Directory entries without `.` and `..`.
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Cancelled once the channel is unusable.
    fn closed(&self) -> CancellationToken;

    /// Close the subsystem channel. Idempotent.
    async fn shutdown(&self);
}

fn stat_from_attributes(attrs: &FileAttributes) -> FileStat {
    let file_type = attrs.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    FileStat {
        kind,
        size: attrs.size.unwrap_or(0),
        mtime: attrs.mtime.map(u64::from),
        permissions: attrs.permissions,
    }
}

fn classify_io(err: std::io::Error, context: &str) -> RelayError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            RelayError::PermissionDenied(format!("{}: {}", context, err))
        }
        std::io::ErrorKind::NotFound => RelayError::NotFound(format!("{}: {}", context, err)),
        _ => RelayError::ChannelFailure(format!("{}: {}", context, err)),
    }
}

/// [`SftpPrimitives`] over a russh-sftp session.
pub struct RusshSftp {
    session: SftpSession,
    files: DashMap<u64, Arc<Mutex<File>>>,
    next_handle: AtomicU64,
    closed: CancellationToken,
}

impl RusshSftp {
    pub fn new(session: SftpSession) -> Self {
        Self {
            session,
            files: DashMap::new(),
            next_handle: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Mark the channel dead on channel-level failures.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_channel_failure()
        {
            debug!("SFTP channel reported failure: {}", e);
            self.closed.cancel();
        }
        result
    }

    fn file(&self, handle: SftpHandle) -> Result<Arc<Mutex<File>>> {
        self.files
            .get(&handle.0)
            .map(|f| f.clone())
            .ok_or_else(|| RelayError::Sftp(format!("Unknown file handle {}", handle.0)))
    }
}

#[async_trait]
impl SftpPrimitives for RusshSftp {
    async fn stat(&self, path: &str) -> Result<FileStat> {
        let result = self
            .session
            .metadata(path)
            .await
            .map(|attrs| stat_from_attributes(&attrs))
            .map_err(|e| RelayError::from_sftp(e, &format!("stat {}", path)));
        self.track(result)
    }

    async fn lstat(&self, path: &str) -> Result<FileStat> {
        let result = self
            .session
            .symlink_metadata(path)
            .await
            .map(|attrs| stat_from_attributes(&attrs))
            .map_err(|e| RelayError::from_sftp(e, &format!("lstat {}", path)));
        self.track(result)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let result = self
            .session
            .create_dir(path)
            .await
            .map_err(|e| RelayError::from_sftp(e, &format!("mkdir {}", path)));
        self.track(result)
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<SftpHandle> {
        let flags = match mode {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::Create => OpenFlags::CREATE | OpenFlags::WRITE,
            OpenMode::Truncate => OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
        };
        let result = self
            .session
            .open_with_flags(path, flags)
            .await
            .map_err(|e| RelayError::from_sftp(e, &format!("open {}", path)));
        let file = self.track(result)?;
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.files.insert(id, Arc::new(Mutex::new(file)));
        Ok(SftpHandle(id))
    }

    async fn close(&self, handle: SftpHandle) -> Result<()> {
        let Some((_, file)) = self.files.remove(&handle.0) else {
            return Ok(());
        };
        let mut file = file.lock().await;
        let result = file
            .shutdown()
            .await
            .map_err(|e| classify_io(e, "close"));
        self.track(result)
    }

    async fn read(&self, handle: SftpHandle, len: usize, offset: u64) -> Result<Vec<u8>> {
        let file = self.file(handle)?;
        let mut file = file.lock().await;
        let result: Result<Vec<u8>> = async {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| classify_io(e, "seek"))?;
            let mut buf = vec![0u8; len];
            let mut total = 0;
            while total < len {
                let n = file
                    .read(&mut buf[total..])
                    .await
                    .map_err(|e| classify_io(e, "read"))?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            Ok(buf)
        }
        .await;
        self.track(result)
    }

    async fn write_all(&self, handle: SftpHandle, bytes: &[u8]) -> Result<()> {
        let file = self.file(handle)?;
        let mut file = file.lock().await;
        let result: Result<()> = async {
            for chunk in bytes.chunks(CHUNK_SIZE) {
                file.write_all(chunk)
                    .await
                    .map_err(|e| classify_io(e, "write"))?;
            }
            file.flush().await.map_err(|e| classify_io(e, "flush"))
        }
        .await;
        self.track(result)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let result = self
            .session
            .rename(from, to)
            .await
            .map_err(|e| RelayError::from_sftp(e, &format!("rename {} -> {}", from, to)));
        self.track(result)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let result = self
            .session
            .remove_file(path)
            .await
            .map_err(|e| RelayError::from_sftp(e, &format!("unlink {}", path)));
        self.track(result)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let result = self
            .session
            .remove_dir(path)
            .await
            .map_err(|e| RelayError::from_sftp(e, &format!("rmdir {}", path)));
        self.track(result)
    }

    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let result = self
            .session
            .read_dir(path)
            .await
            .map(|entries| {
                entries
                    .filter(|e| {
                        let name = e.file_name();
                        name != "." && name != ".."
                    })
                    .map(|e| DirEntry {
                        name: e.file_name(),
                        stat: stat_from_attributes(&e.metadata()),
                    })
                    .collect()
            })
            .map_err(|e| RelayError::from_sftp(e, &format!("readdir {}", path)));
        self.track(result)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn shutdown(&self) {
        self.files.clear();
        if let Err(e) = self.session.close().await {
            debug!("SFTP session close failed: {}", e);
        }
        self.closed.cancel();
    }
}

/// Close a handle, logging instead of propagating release failures.
async fn release(sftp: &dyn SftpPrimitives, handle: SftpHandle, path: &str) {
    if let Err(e) = sftp.close(handle).await {
        warn!("Failed to close remote file {}: {}", path, e);
    }
}

/// Read a whole file, failing fast once it grows past `limit` bytes.
pub async fn read_to_end(sftp: &dyn SftpPrimitives, path: &str, limit: u64) -> Result<Vec<u8>> {
    let handle = sftp.open(path, OpenMode::Read).await?;
    let result: Result<Vec<u8>> = async {
        let mut content = Vec::new();
        loop {
            let chunk = sftp.read(handle, CHUNK_SIZE, content.len() as u64).await?;
            if chunk.is_empty() {
                break;
            }
            content.extend_from_slice(&chunk);
            if content.len() as u64 > limit {
                return Err(RelayError::FileTooLarge {
                    size: content.len() as u64,
                    limit,
                });
            }
        }
        Ok(content)
    }
    .await;
    release(sftp, handle, path).await;
    result
}

/// Replace a file's content.
pub async fn write_file(sftp: &dyn SftpPrimitives, path: &str, bytes: &[u8]) -> Result<()> {
    let handle = sftp.open(path, OpenMode::Truncate).await?;
    let result = sftp.write_all(handle, bytes).await;
    release(sftp, handle, path).await;
    result
}

/// Stream `src` to `dst` one chunk at a time.
pub async fn copy_file(sftp: &dyn SftpPrimitives, src: &str, dst: &str) -> Result<()> {
    let source = sftp.open(src, OpenMode::Read).await?;
    let destination = match sftp.open(dst, OpenMode::Truncate).await {
        Ok(handle) => handle,
        Err(e) => {
            release(sftp, source, src).await;
            return Err(e);
        }
    };

    let result: Result<()> = async {
        let mut offset = 0u64;
        loop {
            let chunk = sftp.read(source, CHUNK_SIZE, offset).await?;
            if chunk.is_empty() {
                return Ok(());
            }
            sftp.write_all(destination, &chunk).await?;
            offset += chunk.len() as u64;
        }
    }
    .await;

    release(sftp, source, src).await;
    release(sftp, destination, dst).await;
    result
}

fn depth_exceeded(path: &str) -> RelayError {
    RelayError::InvalidRequest(format!(
        "Directory tree under {} exceeds the maximum depth of {}",
        path, MAX_DEPTH
    ))
}

/// Mirror the directory `src` into a new directory `dst`, depth-first.
///
/// Symlinks and special files are skipped; only directories and regular files
/// are copied.
pub fn copy_dir_recursive<'a>(
    sftp: &'a dyn SftpPrimitives,
    src: &'a str,
    dst: &'a str,
    depth: usize,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if depth > MAX_DEPTH {
            return Err(depth_exceeded(src));
        }
        sftp.mkdir(dst).await?;
        for entry in sftp.readdir(src).await? {
            let from = path::join(src, &entry.name);
            let to = path::join(dst, &entry.name);
            match entry.stat.kind {
                EntryKind::Dir => copy_dir_recursive(sftp, &from, &to, depth + 1).await?,
                EntryKind::File => copy_file(sftp, &from, &to).await?,
                EntryKind::Symlink | EntryKind::Other => {
                    debug!("Skipping non-regular entry during copy: {}", from);
                }
            }
        }
        Ok(())
    })
}

/// Delete `target` and everything below it. Symlinks are removed, never followed.
pub fn remove_recursive<'a>(
    sftp: &'a dyn SftpPrimitives,
    target: &'a str,
    depth: usize,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if depth > MAX_DEPTH {
            return Err(depth_exceeded(target));
        }
        let stat = sftp.lstat(target).await?;
        if stat.kind != EntryKind::Dir {
            return sftp.unlink(target).await;
        }
        for entry in sftp.readdir(target).await? {
            let child = path::join(target, &entry.name);
            if entry.stat.kind == EntryKind::Dir {
                remove_recursive(sftp, &child, depth + 1).await?;
            } else {
                sftp.unlink(&child).await?;
            }
        }
        sftp.rmdir(target).await
    })
}
