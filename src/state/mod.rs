//! State management module for stackwright.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources: the snapshot of physical identifiers and applied declarations,
//! the run-level lease, and run history.

mod store;
mod local;
mod s3;
mod lock;
mod shared;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{
    HeldLease, LOCK_EXPIRY_SECS, LeaseOptions, LockInfo, acquire_lease, generate_holder_id,
};
pub use shared::SharedSnapshot;
pub use types::{
    MAX_HISTORY, ResourceRecord, RunHistoryEntry, RunKind, STATE_VERSION, StateSnapshot,
};
