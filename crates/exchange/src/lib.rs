//! Worker-to-worker data movement.
//!
//! Architecture role:
//! - [`collective`]: the [`Collective`] contract (all-to-all, broadcast,
//!   all-gather, exclusive scan) and the in-process provider used by tests
//!   and single-host deployments
//! - [`hash`]: grouping and partition hashes over key columns
//! - [`shuffle`]: hash-partitioned all-to-all of record batches
//! - [`dictionary`]: canonical dictionaries and their global agreement

pub mod collective;
pub mod dictionary;
pub mod hash;
pub mod shuffle;

pub use collective::{
    Collective, CollectiveExt, LocalCollective, LocalCollectiveGroup, ReduceOp, ScanValue,
    SingleProcess,
};
pub use dictionary::{DictionaryBuilder, DictionaryUnifier, is_dictionary_type, remap_codes};
pub use hash::{GROUPING_HASH_SEED, PARTITION_HASH_SEED, hash_rows, partition_for, top_bits};
pub use shuffle::{
    all_gather_batches, broadcast_batch, group_by_target, shuffle_batch, shuffle_by_key,
    target_ranks,
};
