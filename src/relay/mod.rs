//! SSH relay: a browser-facing SSH/SFTP session broker.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Environment-driven configuration
//! - `error`: Error taxonomy and failure classification
//! - `path`: Remote path normalization
//! - `session`: russh client handler (host-key policy, close notification)
//! - `auth`: Authentication strategies
//! - `client`: russh connection setup and the live connection type
//! - `remote`: Transport seam traits used by the broker and engines
//! - `registry`: TTL-backed session registry
//! - `broker`: Live connection and SFTP channel cache
//! - `sftp`: SFTP primitives and recursive helpers
//! - `files`: File operations with privilege fallback
//! - `exec`: Streaming command execution
//! - `introspect`: Service, container and site listings
//! - `external`: Identity, profile and audit collaborators
//! - `protocol`: Control-channel message types
//! - `dispatcher`: Per-channel routing
//! - `reaper`: Orphan connection sweep
//! - `server`: WebSocket endpoint

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod external;
pub mod files;
pub mod introspect;
pub mod path;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod remote;
pub mod server;
pub mod session;
pub mod sftp;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
