//! Error taxonomy for the relay.
//!
//! Every component returns [`RelayError`]. The dispatcher converts it into a
//! structured `error` event using [`RelayError::code`] and the `Display`
//! message, so no failure ever escapes past the control channel.
//!
//! # Classification
//!
//! Two kinds of loosely structured failures are classified here:
//!
//! 1. **SFTP status codes**: `PermissionDenied` triggers the privilege
//!    fallback, connection-level failures become [`RelayError::ChannelFailure`]
//!    (retried once on a fresh channel), everything else is an operation error.
//!
//! 2. **Elevation stderr**: `sudo -n` reports why it refused to run. Known
//!    patterns are translated into a message that tells the user what to
//!    configure instead of echoing the raw sudo output.

use std::time::Duration;

use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Session expired or not found. Connect again or attach to a live session.")]
    SessionExpired,

    #[error("SSH connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SFTP channel failure: {0}")]
    ChannelFailure(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    ElevationFailed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    RequestTimeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("File is too large ({size} bytes, limit is {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Remote command failed: {0}")]
    Remote(String),
}

impl RelayError {
    /// Stable wire code for the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::SessionExpired => "SESSION_EXPIRED",
            RelayError::ConnectionFailed(_) => "CONNECTION_FAILED",
            RelayError::ChannelFailure(_) => "CHANNEL_FAILURE",
            RelayError::PermissionDenied(_) => "PERMISSION_DENIED",
            RelayError::ElevationFailed(_) => "ELEVATION_FAILED",
            RelayError::InvalidPath(_) => "INVALID_PATH",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::RequestTimeout(_) => "REQUEST_TIMEOUT",
            RelayError::InvalidRequest(_) => "INVALID_REQUEST",
            RelayError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            RelayError::Unauthorized(_) => "UNAUTHORIZED",
            RelayError::Sftp(_) => "SFTP_ERROR",
            RelayError::Remote(_) => "REMOTE_ERROR",
        }
    }

    pub fn is_channel_failure(&self) -> bool {
        matches!(self, RelayError::ChannelFailure(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RelayError::PermissionDenied(_))
    }

    /// Classify a russh-sftp failure for the operation described by `context`.
    pub fn from_sftp(err: SftpError, context: &str) -> Self {
        match err {
            SftpError::Status(status) => {
                let detail = if status.error_message.is_empty() {
                    context.to_string()
                } else {
                    format!("{}: {}", context, status.error_message)
                };
                match status.status_code {
                    StatusCode::PermissionDenied => RelayError::PermissionDenied(detail),
                    StatusCode::NoSuchFile => RelayError::NotFound(detail),
                    StatusCode::NoConnection | StatusCode::ConnectionLost => {
                        RelayError::ChannelFailure(detail)
                    }
                    _ => RelayError::Sftp(detail),
                }
            }
            other => RelayError::ChannelFailure(format!("{}: {}", context, other)),
        }
    }
}

/// Why non-interactive elevation refused to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationIssue {
    /// sudo wants a password and `-n` forbids prompting.
    PasswordRequired,
    /// sudo insists on a terminal (`requiretty`).
    NoTty,
    /// The user may not use sudo at all.
    NotPermitted,
    /// No sudo binary on the remote host.
    Missing,
}

/// Patterns reported by sudo when a password would be needed.
const PASSWORD_REQUIRED_PATTERNS: &[&str] = &[
    "a password is required",
    "password is required",
    "sorry, try again",
];

/// Patterns reported when sudo insists on a controlling terminal.
const NO_TTY_PATTERNS: &[&str] = &[
    "no tty present",
    "a terminal is required",
    "must have a tty",
];

/// Patterns reported when the user is not allowed to elevate.
const NOT_PERMITTED_PATTERNS: &[&str] = &[
    "is not in the sudoers file",
    "is not allowed to execute",
    "may not run sudo",
];

/// Patterns reported by the shell when sudo is not installed.
const MISSING_PATTERNS: &[&str] = &[
    "sudo: command not found",
    "sudo: not found",
    "sudo: no such file",
];

/// Classify sudo stderr. Returns `None` when the failure is not an elevation problem
/// (for example the elevated command itself failed).
pub fn classify_elevation_failure(stderr: &str) -> Option<ElevationIssue> {
    let lower = stderr.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches_any(MISSING_PATTERNS) {
        Some(ElevationIssue::Missing)
    } else if matches_any(NO_TTY_PATTERNS) {
        Some(ElevationIssue::NoTty)
    } else if matches_any(NOT_PERMITTED_PATTERNS) {
        Some(ElevationIssue::NotPermitted)
    } else if matches_any(PASSWORD_REQUIRED_PATTERNS) {
        Some(ElevationIssue::PasswordRequired)
    } else {
        None
    }
}

/// Build the user-facing explanation for a failed elevation attempt.
pub fn elevation_error(issue: ElevationIssue, username: &str, operation: &str) -> RelayError {
    let reason = match issue {
        ElevationIssue::PasswordRequired => format!(
            "sudo requires a password for '{}'. Configure passwordless sudo (NOPASSWD) for this user to allow privileged file operations.",
            username
        ),
        ElevationIssue::NoTty => format!(
            "sudo requires a terminal for '{}'. Disable 'requiretty' and configure passwordless sudo (NOPASSWD) for this user.",
            username
        ),
        ElevationIssue::NotPermitted => format!(
            "'{}' is not allowed to use sudo. Grant passwordless sudo (NOPASSWD) to this user or choose a location it owns.",
            username
        ),
        ElevationIssue::Missing => {
            "sudo is not installed on the remote host. Install sudo and configure passwordless access, or choose a location the user owns.".to_string()
        }
    };
    RelayError::ElevationFailed(format!(
        "Permission denied for {}; privileged retry failed: {}",
        operation, reason
    ))
}
