//! State management module.
//!
//! This module provides persistent storage for the last applied snapshot:
//! provider identities, recorded properties and outputs, deposed instances
//! and apply history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{
    DeposedResource, HistoryEntry, HistoryOperation, ResourceState, STATE_VERSION, StateSnapshot,
};
