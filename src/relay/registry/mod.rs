//! Session registry: the durable, TTL-backed record of each logical session.
//!
//! The registry outlives any single live connection. The broker consults it
//! before (re)connecting and the reaper consults it to find orphans.

mod memory;
mod traits;

pub use memory::MemorySessionRegistry;
pub use traits::{AuthKind, NewSession, SessionPatch, SessionRecord, SessionRegistry};
