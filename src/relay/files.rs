//! File operations with privilege-escalation fallback.
//!
//! Every operation goes through SFTP first. When SFTP reports permission
//! denied, the equivalent shell command is retried once through `sudo -n`,
//! which never prompts: a host that wants a password (or a tty) makes the
//! fallback fail with an explanation instead of hanging.
//!
//! All paths are normalized before use and destination names must be single
//! path segments.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::broker::ConnectionBroker;
use super::error::{RelayError, Result, classify_elevation_failure, elevation_error};
use super::path;
use super::protocol::DirListEntry;
use super::registry::SessionRecord;
use super::remote::{CommandOutput, shell_quote};
use super::sftp::{self, EntryKind, OpenMode};

/// Read and write size ceiling (512 KiB)
pub const MAX_FILE_SIZE: u64 = 512 * 1024;

/// Bound on one elevated or fallback shell command
const SHELL_FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Render mode bits as `drwxr-xr-x`.
pub fn symbolic_mode(kind: EntryKind, mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(match kind {
        EntryKind::Dir => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::Other => '?',
    });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// A file read back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
}

pub struct FileOps {
    broker: Arc<ConnectionBroker>,
}

impl FileOps {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    /// Run a shell command on the session's host, optionally through `sudo -n`.
    async fn shell(
        &self,
        session: &SessionRecord,
        operation: &str,
        command: &str,
        stdin: Option<Vec<u8>>,
        elevate: bool,
    ) -> Result<CommandOutput> {
        let host = self.broker.get_or_connect(&session.id).await?;
        let command = if elevate {
            format!("sudo -n {}", command)
        } else {
            command.to_string()
        };
        let output = host.run(&command, stdin, SHELL_FALLBACK_TIMEOUT).await?;
        if output.success() {
            return Ok(output);
        }

        let stderr = output.stderr.trim();
        if elevate && let Some(issue) = classify_elevation_failure(stderr) {
            return Err(elevation_error(issue, &session.username, operation));
        }
        if !elevate && stderr.to_lowercase().contains("permission denied") {
            return Err(RelayError::PermissionDenied(format!("{}: {}", operation, stderr)));
        }
        Err(RelayError::Remote(format!(
            "{} failed{}",
            operation,
            if stderr.is_empty() {
                String::new()
            } else {
                format!(": {}", stderr)
            }
        )))
    }

    async fn elevated(
        &self,
        session: &SessionRecord,
        operation: &str,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput> {
        info!(
            "Permission denied for {} on session {}, retrying with sudo",
            operation, session.id
        );
        self.shell(session, operation, command, stdin, true).await
    }

    /// Resolve a directory for `set_cwd`.
    pub async fn resolve_dir(&self, session: &SessionRecord, raw: &str) -> Result<String> {
        let dir = path::normalize(raw)?;
        let target = dir.as_str();
        let stat = self
            .broker
            .with_sftp(&session.id, |sftp| async move { sftp.stat(target).await })
            .await?;
        if stat.kind != EntryKind::Dir {
            return Err(RelayError::InvalidPath(format!("{} is not a directory", dir)));
        }
        Ok(dir)
    }

    /// List a directory, directories first then by name.
    pub async fn list_dir(
        &self,
        session: &SessionRecord,
        raw: Option<&str>,
    ) -> Result<(String, Vec<DirListEntry>)> {
        let dir = path::normalize(raw.unwrap_or(&session.cwd))?;
        let target = dir.as_str();
        let mut entries = self
            .broker
            .with_sftp(&session.id, |sftp| async move { sftp.readdir(target).await })
            .await?;

        entries.sort_by(|a, b| {
            let a_dir = a.stat.kind == EntryKind::Dir;
            let b_dir = b.stat.kind == EntryKind::Dir;
            b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
        });

        let listed = entries
            .into_iter()
            .map(|entry| DirListEntry {
                permissions: entry
                    .stat
                    .permissions
                    .map(|mode| symbolic_mode(entry.stat.kind, mode)),
                name: entry.name,
                kind: entry.stat.kind,
                size: entry.stat.size,
                mtime: entry.stat.mtime,
            })
            .collect();
        Ok((dir, listed))
    }

    pub async fn mkdir(&self, session: &SessionRecord, raw: &str) -> Result<String> {
        let dir = path::normalize(raw)?;
        let target = dir.as_str();
        match self
            .broker
            .with_sftp(&session.id, |sftp| async move { sftp.mkdir(target).await })
            .await
        {
            Err(e) if e.is_permission_denied() => {
                let command = format!("mkdir -- {}", shell_quote(&dir));
                self.elevated(session, "mkdir", &command, None).await?;
            }
            other => other?,
        }
        Ok(dir)
    }

    /// Create an empty file. Fails when something already exists at `raw`.
    pub async fn create_file(&self, session: &SessionRecord, raw: &str) -> Result<String> {
        let file = path::normalize(raw)?;
        let target = file.as_str();
        let created = self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                match sftp.stat(target).await {
                    Ok(_) => {
                        return Err(RelayError::InvalidRequest(format!(
                            "{} already exists",
                            target
                        )));
                    }
                    Err(RelayError::NotFound(_)) | Err(RelayError::PermissionDenied(_)) => {}
                    Err(e) => return Err(e),
                }
                let handle = sftp.open(target, OpenMode::Create).await?;
                if let Err(e) = sftp.close(handle).await {
                    debug!("Failed to close new file {}: {}", target, e);
                }
                Ok(())
            })
            .await;

        match created {
            Err(e) if e.is_permission_denied() => {
                let command = format!("touch -- {}", shell_quote(&file));
                self.elevated(session, "create file", &command, None).await?;
            }
            other => other?,
        }
        Ok(file)
    }

    pub async fn read_file(&self, session: &SessionRecord, raw: &str) -> Result<FileContent> {
        let file = path::normalize(raw)?;
        let target = file.as_str();
        let read = self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                let stat = sftp.stat(target).await?;
                if stat.kind == EntryKind::Dir {
                    return Err(RelayError::InvalidPath(format!("{} is a directory", target)));
                }
                if stat.size > MAX_FILE_SIZE {
                    return Err(RelayError::FileTooLarge {
                        size: stat.size,
                        limit: MAX_FILE_SIZE,
                    });
                }
                sftp::read_to_end(sftp.as_ref(), target, MAX_FILE_SIZE).await
            })
            .await;

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.is_permission_denied() => {
                // One byte past the limit tells an oversized file from one exactly at it
                let command = format!("head -c {} -- {}", MAX_FILE_SIZE + 1, shell_quote(&file));
                let output = self.elevated(session, "read file", &command, None).await?;
                let bytes = output.stdout;
                if bytes.len() as u64 > MAX_FILE_SIZE {
                    return Err(RelayError::FileTooLarge {
                        size: bytes.len() as u64,
                        limit: MAX_FILE_SIZE,
                    });
                }
                bytes
            }
            Err(e) => return Err(e),
        };

        Ok(FileContent {
            size: bytes.len() as u64,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            path: file,
        })
    }

    pub async fn write_file(
        &self,
        session: &SessionRecord,
        raw: &str,
        content: &str,
    ) -> Result<String> {
        let file = path::normalize(raw)?;
        let size = content.len() as u64;
        if size > MAX_FILE_SIZE {
            return Err(RelayError::FileTooLarge {
                size,
                limit: MAX_FILE_SIZE,
            });
        }

        let target = file.as_str();
        let bytes = content.as_bytes();
        match self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                sftp::write_file(sftp.as_ref(), target, bytes).await
            })
            .await
        {
            Err(e) if e.is_permission_denied() => {
                let command = format!("tee -- {} >/dev/null", shell_quote(&file));
                self.elevated(session, "write file", &command, Some(bytes.to_vec()))
                    .await?;
            }
            other => other?,
        }
        Ok(file)
    }

    /// Rename within the same directory. Returns the new path.
    pub async fn rename_path(
        &self,
        session: &SessionRecord,
        raw: &str,
        new_name: &str,
    ) -> Result<String> {
        let from = path::normalize(raw)?;
        let name = path::validate_name(new_name)?;
        if from == "/" {
            return Err(RelayError::InvalidPath("cannot rename /".to_string()));
        }
        let to = path::join(&path::parent(&from), name);
        if to == from {
            return Ok(to);
        }

        let (src, dst) = (from.as_str(), to.as_str());
        match self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                ensure_absent(sftp.as_ref(), dst).await?;
                sftp.rename(src, dst).await
            })
            .await
        {
            Err(e) if e.is_permission_denied() => {
                let command = format!("mv -T -- {} {}", shell_quote(&from), shell_quote(&to));
                self.elevated(session, "rename", &command, None).await?;
            }
            other => other?,
        }
        Ok(to)
    }

    /// Delete a file or a directory tree. `/` is refused.
    pub async fn delete_path(&self, session: &SessionRecord, raw: &str) -> Result<String> {
        let target = path::normalize(raw)?;
        if target == "/" {
            return Err(RelayError::InvalidPath("refusing to delete /".to_string()));
        }

        let victim = target.as_str();
        match self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                sftp::remove_recursive(sftp.as_ref(), victim, 0).await
            })
            .await
        {
            Err(e) if e.is_permission_denied() => {
                let command = format!("rm -rf -- {}", shell_quote(&target));
                self.elevated(session, "delete", &command, None).await?;
            }
            other => other?,
        }
        Ok(target)
    }

    /// Copy `source` into `destination_dir`, keeping its name. Returns the new path.
    pub async fn copy_path(
        &self,
        session: &SessionRecord,
        source: &str,
        destination_dir: &str,
    ) -> Result<String> {
        let (from, to) = transfer_paths(source, destination_dir, "copy")?;

        let (src, dst) = (from.as_str(), to.as_str());
        match self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                ensure_absent(sftp.as_ref(), dst).await?;
                match sftp.stat(src).await?.kind {
                    EntryKind::Dir => sftp::copy_dir_recursive(sftp.as_ref(), src, dst, 0).await,
                    EntryKind::File => sftp::copy_file(sftp.as_ref(), src, dst).await,
                    EntryKind::Symlink | EntryKind::Other => Err(RelayError::InvalidRequest(
                        format!("{} is not a regular file or directory", src),
                    )),
                }
            })
            .await
        {
            Err(e) if e.is_permission_denied() => {
                let command = format!("cp -a -T -- {} {}", shell_quote(&from), shell_quote(&to));
                self.elevated(session, "copy", &command, None).await?;
            }
            other => other?,
        }
        Ok(to)
    }

    /// Move `source` into `destination_dir`, keeping its name. Returns the new path.
    ///
    /// SFTP rename is tried first; when the server refuses it for another
    /// reason than permissions (typically a cross-filesystem move) a remote
    /// `mv` is used instead.
    pub async fn move_path(
        &self,
        session: &SessionRecord,
        source: &str,
        destination_dir: &str,
    ) -> Result<String> {
        let (from, to) = transfer_paths(source, destination_dir, "move")?;
        let command = format!("mv -T -- {} {}", shell_quote(&from), shell_quote(&to));

        let (src, dst) = (from.as_str(), to.as_str());
        let renamed = self
            .broker
            .with_sftp(&session.id, |sftp| async move {
                ensure_absent(sftp.as_ref(), dst).await?;
                sftp.stat(src).await?;
                sftp.rename(src, dst).await
            })
            .await;

        match renamed {
            Ok(()) => {}
            Err(e) if e.is_permission_denied() => {
                self.elevated(session, "move", &command, None).await?;
            }
            Err(e @ (RelayError::Sftp(_) | RelayError::ChannelFailure(_))) => {
                debug!("SFTP rename failed ({}), falling back to mv", e);
                match self.shell(session, "move", &command, None, false).await {
                    Err(e) if e.is_permission_denied() => {
                        self.elevated(session, "move", &command, None).await?;
                    }
                    other => {
                        other?;
                    }
                }
            }
            Err(e) => return Err(e),
        }
        Ok(to)
    }
}

/// Normalize a transfer and compute its destination path.
fn transfer_paths(source: &str, destination_dir: &str, verb: &str) -> Result<(String, String)> {
    let from = path::normalize(source)?;
    let dir = path::normalize(destination_dir)?;
    let name = path::file_name(&from)
        .ok_or_else(|| RelayError::InvalidPath(format!("cannot {} /", verb)))?;
    let to = path::join(&dir, name);
    if path::is_within(&from, &to) {
        return Err(RelayError::InvalidRequest(format!(
            "cannot {} {} into itself",
            verb, from
        )));
    }
    Ok((from, to))
}

async fn ensure_absent(sftp: &dyn sftp::SftpPrimitives, target: &str) -> Result<()> {
    match sftp.lstat(target).await {
        Ok(_) => Err(RelayError::InvalidRequest(format!("{} already exists", target))),
        Err(RelayError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
