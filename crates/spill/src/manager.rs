//! Ordered spill tiers.
//!
//! Writes go to the first tier whose quota still admits the block. Once every
//! tier is full the write fails with `ResourceExhausted`; the caller treats
//! that as fatal for the query.

use tessera_common::{BlockId, Result, SpillTier, TesseraError};
use tracing::{debug, info};

use crate::storage::{StorageManager, make_storage_manager};

/// Locator for a spilled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillHandle {
    pub tier: usize,
    pub block_id: BlockId,
    pub n_bytes: usize,
}

/// Aggregate counters reported as operator metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub blocks_written: u64,
    pub blocks_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

pub struct SpillManager {
    tiers: Vec<Box<dyn StorageManager>>,
    stats: SpillStats,
}

impl SpillManager {
    /// Open every configured tier for worker `rank`.
    pub fn try_new(tiers: &[SpillTier], rank: usize) -> Result<Self> {
        let tiers = tiers
            .iter()
            .map(|t| make_storage_manager(t, rank))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_storage(tiers))
    }

    pub fn with_storage(tiers: Vec<Box<dyn StorageManager>>) -> Self {
        for (i, t) in tiers.iter().enumerate() {
            info!(
                tier = i,
                storage = t.name(),
                quota = ?t.usage().quota_bytes(),
                "spill tier ready"
            );
        }
        Self {
            tiers,
            stats: SpillStats::default(),
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub fn stats(&self) -> SpillStats {
        self.stats
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.tiers.iter().map(|t| t.usage().spilled_bytes()).sum()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<SpillHandle> {
        let n = bytes.len() as u64;
        let Some(tier) = self.tiers.iter().position(|t| t.usage().can_spill(n)) else {
            return Err(TesseraError::ResourceExhausted(format!(
                "no spill tier can accept {n} bytes ({} tiers configured)",
                self.tiers.len()
            )));
        };
        let block_id = self.tiers[tier].write_block(bytes)?;
        self.stats.blocks_written += 1;
        self.stats.bytes_written += n;
        debug!(tier, block_id = block_id.0, bytes = n, "spilled block");
        Ok(SpillHandle {
            tier,
            block_id,
            n_bytes: bytes.len(),
        })
    }

    /// Read and remove a previously spilled block.
    pub fn read(&mut self, handle: SpillHandle) -> Result<Vec<u8>> {
        let storage = self.storage(handle.tier)?;
        let bytes = storage.read_block(handle.block_id, handle.n_bytes)?;
        self.stats.blocks_read += 1;
        self.stats.bytes_read += bytes.len() as u64;
        Ok(bytes)
    }

    pub fn delete(&mut self, handle: SpillHandle) -> Result<()> {
        self.storage(handle.tier)?
            .delete_block(handle.block_id, handle.n_bytes)
    }

    fn storage(&mut self, tier: usize) -> Result<&mut Box<dyn StorageManager>> {
        self.tiers
            .get_mut(tier)
            .ok_or_else(|| TesseraError::Execution(format!("unknown spill tier {tier}")))
    }
}

impl std::fmt::Debug for SpillManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillManager")
            .field("tiers", &self.tiers.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::SpillLocation;

    fn local_tier(dir: &std::path::Path, quota: Option<u64>) -> SpillTier {
        SpillTier {
            location: SpillLocation::Local(dir.to_path_buf()),
            quota_bytes: quota,
        }
    }

    #[test]
    fn overflows_into_next_tier_then_exhausts() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        let mut mgr = SpillManager::try_new(
            &[local_tier(a.path(), Some(10)), local_tier(b.path(), Some(10))],
            0,
        )
        .expect("manager");

        let h1 = mgr.write(&[1u8; 8]).expect("tier 0");
        let h2 = mgr.write(&[2u8; 8]).expect("tier 1");
        assert_eq!(h1.tier, 0);
        assert_eq!(h2.tier, 1);
        let err = mgr.write(&[3u8; 8]).expect_err("all tiers full");
        assert!(matches!(err, TesseraError::ResourceExhausted(_)));

        assert_eq!(mgr.read(h1).expect("read"), vec![1u8; 8]);
        let h3 = mgr.write(&[3u8; 8]).expect("tier 0 has room again");
        assert_eq!(h3.tier, 0);
        mgr.delete(h2).expect("delete");
        assert_eq!(mgr.spilled_bytes(), 8);
        assert_eq!(mgr.stats().blocks_written, 3);
    }

    #[cfg(not(feature = "s3"))]
    #[test]
    fn object_store_tier_requires_feature() {
        let tier = SpillTier {
            location: SpillLocation::ObjectStore("s3://bucket/spill".to_string()),
            quota_bytes: None,
        };
        let err = SpillManager::try_new(&[tier], 0).expect_err("feature disabled");
        assert!(matches!(err, TesseraError::Unsupported(_)));
    }
}
