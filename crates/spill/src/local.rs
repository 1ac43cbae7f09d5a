use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tessera_common::{BlockId, Result, TesseraError};
use tracing::{debug, warn};

use crate::storage::{StorageManager, StorageUsage, unique_scope};

/// Spills blocks as individual files under a rank/process-unique directory.
#[derive(Debug)]
pub struct LocalStorageManager {
    name: String,
    dir: PathBuf,
    usage: StorageUsage,
}

impl LocalStorageManager {
    pub fn try_new(root: &Path, quota_bytes: Option<u64>, rank: usize) -> Result<Self> {
        let dir = root.join(unique_scope(rank));
        fs::create_dir_all(&dir)?;
        Ok(Self {
            name: format!("local:{}", dir.display()),
            dir,
            usage: StorageUsage::new(quota_bytes),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.dir.join(block_id.file_name())
    }
}

impl StorageManager for LocalStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_block(&mut self, bytes: &[u8]) -> Result<BlockId> {
        let block_id = self.usage.next_block_id();
        let path = self.block_path(block_id);
        let mut file = fs::File::create(&path)?;
        file.write_all(bytes)?;
        file.flush()?;
        self.usage.add(bytes.len() as u64);
        debug!(storage = %self.name, block_id = block_id.0, bytes = bytes.len(), "block written");
        Ok(block_id)
    }

    fn read_block(&mut self, block_id: BlockId, n_bytes: usize) -> Result<Vec<u8>> {
        let path = self.block_path(block_id);
        let mut out = Vec::with_capacity(n_bytes);
        fs::File::open(&path)?.read_to_end(&mut out)?;
        if out.len() != n_bytes {
            return Err(TesseraError::Execution(format!(
                "spill block {block_id} size mismatch: expected {n_bytes}, found {}",
                out.len()
            )));
        }
        fs::remove_file(&path)?;
        self.usage.sub(n_bytes as u64);
        Ok(out)
    }

    fn delete_block(&mut self, block_id: BlockId, n_bytes: usize) -> Result<()> {
        fs::remove_file(self.block_path(block_id))?;
        self.usage.sub(n_bytes as u64);
        Ok(())
    }

    fn usage(&self) -> &StorageUsage {
        &self.usage
    }
}

impl Drop for LocalStorageManager {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "spill directory cleanup failed");
        }
    }
}
