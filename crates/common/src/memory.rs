//! Worker-level buffer pool and per-operator memory budgets.
//!
//! A single [`BufferPool`] exists per worker process. Every streaming operator
//! carves an [`OperatorBufferPool`] out of it and accounts its resident state
//! through [`MemoryReservation`]s. Growing a reservation never fails while the
//! operator is below its hard limit; it only reports whether the operator is
//! still inside its budget so the caller can decide to spill:
//! - `Ok(true)`: within budget
//! - `Ok(false)`: over budget, caller should unpin/spill
//! - `Err(ResourceExhausted)`: above the hard limit, fatal

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, TesseraError};

/// Pressure level derived from used vs granted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Plenty of budget available.
    Normal,
    /// Budget is tight; prefer earlier spill.
    Elevated,
    /// Budget is exceeded.
    Critical,
}

/// Shared worker-level pool.
#[derive(Debug)]
pub struct BufferPool {
    total_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl BufferPool {
    #[must_use]
    pub fn new(total_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            total_bytes,
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Create an operator pool with `budget_bytes`; reservations above
    /// `budget * error_threshold_pct / 100` fail hard.
    #[must_use]
    pub fn operator_pool(
        self: &Arc<Self>,
        budget_bytes: usize,
        error_threshold_pct: u32,
    ) -> Arc<OperatorBufferPool> {
        let pct = error_threshold_pct.max(100) as u128;
        let hard = (budget_bytes as u128).saturating_mul(pct) / 100;
        Arc::new(OperatorBufferPool {
            parent: Arc::clone(self),
            budget_bytes,
            hard_limit_bytes: hard.min(usize::MAX as u128) as usize,
            used_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        })
    }
}

/// Budget granted to one operator instance.
#[derive(Debug)]
pub struct OperatorBufferPool {
    parent: Arc<BufferPool>,
    budget_bytes: usize,
    hard_limit_bytes: usize,
    used_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl OperatorBufferPool {
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    /// Account `bytes` more; see module docs for the return contract.
    pub fn grow(&self, bytes: usize) -> Result<bool> {
        if bytes == 0 {
            return Ok(!self.is_over_budget());
        }
        let next = self.used_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let parent_next = self.parent.in_use_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if next > self.hard_limit_bytes {
            self.shrink(bytes);
            return Err(TesseraError::ResourceExhausted(format!(
                "operator pool hard limit exceeded: requested {next} bytes, limit {} bytes",
                self.hard_limit_bytes
            )));
        }
        self.peak_bytes.fetch_max(next, Ordering::AcqRel);
        Ok(next <= self.budget_bytes && parent_next <= self.parent.total_bytes)
    }

    pub fn shrink(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.parent.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn is_over_budget(&self) -> bool {
        self.used_bytes() > self.budget_bytes
            || self.parent.in_use_bytes() > self.parent.total_bytes
    }

    #[must_use]
    pub fn pressure(&self) -> MemoryPressure {
        let used = self.used_bytes() as u128;
        let budget = self.budget_bytes.max(1) as u128;
        if used > budget {
            MemoryPressure::Critical
        } else if used.saturating_mul(5) > budget.saturating_mul(4) {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Normal
        }
    }

    /// New empty reservation charged to this pool.
    #[must_use]
    pub fn reservation(self: &Arc<Self>) -> MemoryReservation {
        MemoryReservation {
            pool: Arc::clone(self),
            bytes: 0,
        }
    }
}

/// RAII reservation that releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<OperatorBufferPool>,
    bytes: usize,
}

impl MemoryReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn pool(&self) -> &Arc<OperatorBufferPool> {
        &self.pool
    }

    /// Set the reservation to exactly `bytes`.
    pub fn resize(&mut self, bytes: usize) -> Result<bool> {
        if bytes >= self.bytes {
            let within = self.pool.grow(bytes - self.bytes)?;
            self.bytes = bytes;
            Ok(within)
        } else {
            self.pool.shrink(self.bytes - bytes);
            self.bytes = bytes;
            Ok(!self.pool.is_over_budget())
        }
    }

    pub fn free(&mut self) {
        self.pool.shrink(self.bytes);
        self.bytes = 0;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}
