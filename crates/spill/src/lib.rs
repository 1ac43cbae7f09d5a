//! Spill storage for Tessera operators.
//!
//! Architecture role:
//! - [`StorageManager`] persists opaque blocks on one location with a quota
//! - [`SpillManager`] orders locations into tiers and routes reads back
//! - [`SpillableChunks`] keeps operator chunks resident while the operator
//!   pool allows it and transparently unpins the rest to the spill tiers
//!
//! Object-store tiers (`s3://`, `gs://`, `memory://`, ...) require feature `s3`.

pub mod chunked;
pub mod local;
pub mod manager;
#[cfg(feature = "s3")]
pub mod remote;
pub mod storage;

pub use chunked::{ChunkHandle, SharedSpillManager, SpillableChunks};
pub use local::LocalStorageManager;
pub use manager::{SpillHandle, SpillManager, SpillStats};
pub use storage::{StorageManager, StorageUsage, make_storage_manager};
