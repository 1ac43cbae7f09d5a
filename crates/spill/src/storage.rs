use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tessera_common::{BlockId, Result, SpillLocation, SpillTier, TesseraError};

use crate::local::LocalStorageManager;

/// Backing store for spilled blocks.
///
/// Implementations are location-specific (local directory, object store). Every
/// method may fail with an IO/transport error; callers treat that as fatal.
pub trait StorageManager: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Persist `bytes` and return the new block id.
    fn write_block(&mut self, bytes: &[u8]) -> Result<BlockId>;

    /// Read back block `block_id` of `n_bytes` and delete it from storage.
    fn read_block(&mut self, block_id: BlockId, n_bytes: usize) -> Result<Vec<u8>>;

    /// Delete block `block_id` of `n_bytes` without reading it.
    fn delete_block(&mut self, block_id: BlockId, n_bytes: usize) -> Result<()>;

    /// Quota accounting shared by all implementations.
    fn usage(&self) -> &StorageUsage;
}

/// Quota bookkeeping for one storage location.
#[derive(Debug, Clone)]
pub struct StorageUsage {
    quota_bytes: Option<u64>,
    spilled_bytes: u64,
    next_block_id: BlockId,
}

impl StorageUsage {
    pub fn new(quota_bytes: Option<u64>) -> Self {
        Self {
            quota_bytes,
            spilled_bytes: 0,
            next_block_id: BlockId::default(),
        }
    }

    pub fn can_spill(&self, amount: u64) -> bool {
        match self.quota_bytes {
            None => true,
            Some(q) => self.spilled_bytes.saturating_add(amount) <= q,
        }
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes
    }

    pub fn quota_bytes(&self) -> Option<u64> {
        self.quota_bytes
    }

    pub(crate) fn next_block_id(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id = id.next();
        id
    }

    pub(crate) fn add(&mut self, bytes: u64) {
        self.spilled_bytes = self.spilled_bytes.saturating_add(bytes);
    }

    pub(crate) fn sub(&mut self, bytes: u64) {
        self.spilled_bytes = self.spilled_bytes.saturating_sub(bytes);
    }
}

/// Process-unique suffix for spill locations.
pub(crate) fn unique_scope(rank: usize) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("rank{rank}_{}_{nanos}_{seq}", std::process::id())
}

/// Build the storage manager for one configured tier.
pub fn make_storage_manager(tier: &SpillTier, rank: usize) -> Result<Box<dyn StorageManager>> {
    match &tier.location {
        SpillLocation::Local(dir) => Ok(Box::new(LocalStorageManager::try_new(
            dir,
            tier.quota_bytes,
            rank,
        )?)),
        #[cfg(feature = "s3")]
        SpillLocation::ObjectStore(url) => Ok(Box::new(
            crate::remote::ObjectStoreStorageManager::try_new(url, tier.quota_bytes, rank)?,
        )),
        #[cfg(not(feature = "s3"))]
        SpillLocation::ObjectStore(url) => Err(TesseraError::Unsupported(format!(
            "object store spill location '{url}' requires the 's3' feature"
        ))),
    }
}
