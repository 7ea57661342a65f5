//! Configuration resolution for the relay.
//!
//! Every value resolves with a two-tier priority:
//!
//! 1. **Environment Variable** - Value from environment variable (a `.env` file is honored)
//! 2. **Default** - Built-in default value
//!
//! Values that fail to parse fall back to the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_PORT` | 8080 | Control-channel listen port |
//! | `RELAY_SESSION_TTL_SECS` | 1800 | Session registry time-to-live |
//! | `RELAY_REAPER_INTERVAL_SECS` | 60 | Orphan reaper sweep interval |
//! | `SSH_READY_TIMEOUT_SECS` | 20 | Handshake and authentication timeout |
//! | `SSH_KEEPALIVE_INTERVAL_SECS` | 10 | Keep-alive probe interval |
//! | `SSH_KEEPALIVE_MAX` | 3 | Missed keep-alive probes tolerated |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_HOST_KEY_POLICY` | accept-any | `accept-any` or `pinned` |
//! | `SSH_HOST_KEY_FINGERPRINTS` | (empty) | Comma-separated `SHA256:` fingerprints |
//! | `RELAY_EXEC_STOP_GRACE_MS` | 800 | Grace between interrupt and forced close |
//! | `RELAY_REQUEST_TIMEOUT_SECS` | 15 | Bound on correlated request handling |
//! | `RELAY_ALLOW_ANONYMOUS` | false | Allow operations before `auth` |
//! | `RELAY_AUTH_TOKENS` | (empty) | `token=userId` pairs for the built-in verifier |
//! | `RELAY_PROFILES_FILE` | (unset) | JSON file of saved connection profiles |

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default control-channel port
pub(crate) const DEFAULT_PORT: u16 = 8080;

/// Default session time-to-live in seconds (30 minutes)
pub(crate) const DEFAULT_SESSION_TTL_SECS: u64 = 1800;

/// Default reaper interval in seconds
pub(crate) const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

/// Default SSH handshake readiness timeout in seconds
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 20;

/// Default keep-alive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 10;

/// Default number of missed keep-alives before the transport is considered dead
pub(crate) const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Default grace period between interrupt and forced channel close
pub(crate) const DEFAULT_EXEC_STOP_GRACE_MS: u64 = 800;

/// Default bound on correlated request handling in seconds
pub(crate) const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

pub(crate) const PORT_ENV_VAR: &str = "RELAY_PORT";
pub(crate) const SESSION_TTL_ENV_VAR: &str = "RELAY_SESSION_TTL_SECS";
pub(crate) const REAPER_INTERVAL_ENV_VAR: &str = "RELAY_REAPER_INTERVAL_SECS";
pub(crate) const READY_TIMEOUT_ENV_VAR: &str = "SSH_READY_TIMEOUT_SECS";
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL_SECS";
pub(crate) const KEEPALIVE_MAX_ENV_VAR: &str = "SSH_KEEPALIVE_MAX";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const HOST_KEY_POLICY_ENV_VAR: &str = "SSH_HOST_KEY_POLICY";
pub(crate) const HOST_KEY_FINGERPRINTS_ENV_VAR: &str = "SSH_HOST_KEY_FINGERPRINTS";
pub(crate) const EXEC_STOP_GRACE_ENV_VAR: &str = "RELAY_EXEC_STOP_GRACE_MS";
pub(crate) const REQUEST_TIMEOUT_ENV_VAR: &str = "RELAY_REQUEST_TIMEOUT_SECS";
pub(crate) const ALLOW_ANONYMOUS_ENV_VAR: &str = "RELAY_ALLOW_ANONYMOUS";
pub(crate) const AUTH_TOKENS_ENV_VAR: &str = "RELAY_AUTH_TOKENS";
pub(crate) const PROFILES_FILE_ENV_VAR: &str = "RELAY_PROFILES_FILE";

/// How server host keys are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key (equivalent to `StrictHostKeyChecking=no`).
    AcceptAny,
    /// Accept only keys whose SHA256 fingerprint is listed.
    Pinned(Vec<String>),
}

/// SSH transport settings shared by every outbound connection.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub compress: bool,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            compress: true,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub session_ttl: Duration,
    pub reaper_interval: Duration,
    pub ssh: SshSettings,
    pub exec_stop_grace: Duration,
    pub request_timeout: Duration,
    pub allow_anonymous: bool,
    pub auth_tokens: Vec<(String, String)>,
    pub profiles_file: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            ssh: SshSettings::default(),
            exec_stop_grace: Duration::from_millis(DEFAULT_EXEC_STOP_GRACE_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            allow_anonymous: false,
            auth_tokens: Vec::new(),
            profiles_file: None,
        }
    }
}

impl RelayConfig {
    /// Resolve every setting from the environment.
    pub fn from_env() -> Self {
        Self {
            port: resolve_parsed(PORT_ENV_VAR, DEFAULT_PORT),
            session_ttl: Duration::from_secs(resolve_parsed(
                SESSION_TTL_ENV_VAR,
                DEFAULT_SESSION_TTL_SECS,
            )),
            reaper_interval: Duration::from_secs(resolve_parsed(
                REAPER_INTERVAL_ENV_VAR,
                DEFAULT_REAPER_INTERVAL_SECS,
            )),
            ssh: SshSettings {
                ready_timeout: Duration::from_secs(resolve_parsed(
                    READY_TIMEOUT_ENV_VAR,
                    DEFAULT_READY_TIMEOUT_SECS,
                )),
                keepalive_interval: Duration::from_secs(resolve_parsed(
                    KEEPALIVE_INTERVAL_ENV_VAR,
                    DEFAULT_KEEPALIVE_INTERVAL_SECS,
                )),
                keepalive_max: resolve_parsed(KEEPALIVE_MAX_ENV_VAR, DEFAULT_KEEPALIVE_MAX),
                compress: resolve_flag(COMPRESSION_ENV_VAR, true),
                host_key_policy: resolve_host_key_policy(),
            },
            exec_stop_grace: Duration::from_millis(resolve_parsed(
                EXEC_STOP_GRACE_ENV_VAR,
                DEFAULT_EXEC_STOP_GRACE_MS,
            )),
            request_timeout: Duration::from_secs(resolve_parsed(
                REQUEST_TIMEOUT_ENV_VAR,
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            allow_anonymous: resolve_flag(ALLOW_ANONYMOUS_ENV_VAR, false),
            auth_tokens: resolve_auth_tokens(),
            profiles_file: env::var(PROFILES_FILE_ENV_VAR)
                .ok()
                .filter(|p| !p.trim().is_empty()),
        }
    }
}

/// Resolve a parseable value with priority: env var -> default
fn resolve_parsed<T: FromStr>(var: &str, default: T) -> T {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }
    default
}

/// Resolve a boolean flag. Accepts `true`/`1`/`yes` and `false`/`0`/`no`.
fn resolve_flag(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(raw) => {
            let raw = raw.trim();
            if raw.eq_ignore_ascii_case("true") || raw == "1" || raw.eq_ignore_ascii_case("yes") {
                true
            } else if raw.eq_ignore_ascii_case("false")
                || raw == "0"
                || raw.eq_ignore_ascii_case("no")
            {
                false
            } else {
                default
            }
        }
        Err(_) => default,
    }
}

fn resolve_host_key_policy() -> HostKeyPolicy {
    let policy = env::var(HOST_KEY_POLICY_ENV_VAR).unwrap_or_default();
    if !policy.trim().eq_ignore_ascii_case("pinned") {
        return HostKeyPolicy::AcceptAny;
    }
    let fingerprints = env::var(HOST_KEY_FINGERPRINTS_ENV_VAR)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    HostKeyPolicy::Pinned(fingerprints)
}

/// Parse `token=userId` pairs separated by commas. Malformed pairs are skipped.
fn resolve_auth_tokens() -> Vec<(String, String)> {
    env::var(AUTH_TOKENS_ENV_VAR)
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (token, user) = pair.split_once('=')?;
            let (token, user) = (token.trim(), user.trim());
            (!token.is_empty() && !user.is_empty()).then(|| (token.to_string(), user.to_string()))
        })
        .collect()
}
