//! Spillable chunk arena.
//!
//! Holds record batches behind stable [`ChunkHandle`]s. Resident chunks are
//! charged to the owning operator's [`MemoryReservation`]; when the operator
//! pool goes over budget the least recently used unpinned chunks are encoded
//! as Arrow IPC and written through the shared [`SpillManager`]. Pinned chunks
//! are never evicted.

use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tessera_common::ipc::{decode_batches, encode_batches};
use tessera_common::{MemoryReservation, Result, TesseraError};
use tracing::debug;

use crate::manager::{SpillHandle, SpillManager};

/// Spill manager shared by all arenas of one operator.
pub type SharedSpillManager = Arc<Mutex<SpillManager>>;

/// Stable index of a chunk inside one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle(pub usize);

#[derive(Debug)]
enum Slot {
    Resident {
        batch: RecordBatch,
        bytes: usize,
        pins: u32,
        last_used: u64,
    },
    Spilled(SpillHandle),
    Released,
}

#[derive(Debug)]
pub struct SpillableChunks {
    schema: SchemaRef,
    slots: Vec<Slot>,
    reservation: MemoryReservation,
    spill: SharedSpillManager,
    tick: u64,
    live_rows: usize,
}

pub(crate) fn lock(spill: &SharedSpillManager) -> Result<std::sync::MutexGuard<'_, SpillManager>> {
    spill
        .lock()
        .map_err(|_| TesseraError::Execution("spill manager lock poisoned".to_string()))
}

impl SpillableChunks {
    pub fn new(
        schema: SchemaRef,
        reservation: MemoryReservation,
        spill: SharedSpillManager,
    ) -> Self {
        Self {
            schema,
            slots: Vec::new(),
            reservation,
            spill,
            tick: 0,
            live_rows: 0,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Number of live (not released) chunks.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Released))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_rows(&self) -> usize {
        self.live_rows
    }

    pub fn resident_bytes(&self) -> usize {
        self.reservation.bytes()
    }

    pub fn spilled_chunks(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Spilled(_)))
            .count()
    }

    pub fn handles(&self) -> Vec<ChunkHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, Slot::Released))
            .map(|(i, _)| ChunkHandle(i))
            .collect()
    }

    /// Append an unpinned chunk, evicting older chunks if the pool is over budget.
    pub fn append(&mut self, batch: RecordBatch) -> Result<ChunkHandle> {
        let bytes = batch.get_array_memory_size();
        self.make_room(bytes)?;
        self.live_rows += batch.num_rows();
        self.tick += 1;
        self.slots.push(Slot::Resident {
            batch,
            bytes,
            pins: 0,
            last_used: self.tick,
        });
        let within = self.reservation.resize(self.reservation.bytes() + bytes)?;
        if !within {
            self.evict_until_within_budget()?;
        }
        Ok(ChunkHandle(self.slots.len() - 1))
    }

    /// Make a chunk resident and protect it from eviction until [`Self::unpin`].
    pub fn pin(&mut self, handle: ChunkHandle) -> Result<RecordBatch> {
        self.tick += 1;
        let tick = self.tick;
        self.load(handle)?;
        match self.slot_mut(handle)? {
            Slot::Resident {
                batch,
                pins,
                last_used,
                ..
            } => {
                *pins += 1;
                *last_used = tick;
                Ok(batch.clone())
            }
            _ => Err(TesseraError::Execution(format!("chunk {} not resident", handle.0))),
        }
    }

    pub fn unpin(&mut self, handle: ChunkHandle) -> Result<()> {
        if let Slot::Resident { pins, .. } = self.slot_mut(handle)? {
            *pins = pins.saturating_sub(1);
        }
        if self.reservation.pool().is_over_budget() {
            self.evict_until_within_budget()?;
        }
        Ok(())
    }

    /// Remove a chunk from the arena and return its data.
    pub fn take(&mut self, handle: ChunkHandle) -> Result<RecordBatch> {
        self.load(handle)?;
        let slot = std::mem::replace(self.slot_mut(handle)?, Slot::Released);
        match slot {
            Slot::Resident { batch, bytes, .. } => {
                self.live_rows -= batch.num_rows();
                self.reservation.resize(self.reservation.bytes() - bytes)?;
                Ok(batch)
            }
            _ => Err(TesseraError::Execution(format!("chunk {} already released", handle.0))),
        }
    }

    /// Take every live chunk in append order, leaving the arena empty.
    pub fn drain(&mut self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::with_capacity(self.len());
        for h in self.handles() {
            out.push(self.take(h)?);
        }
        self.slots.clear();
        Ok(out)
    }

    /// Drop every chunk, deleting spilled blocks.
    pub fn release(&mut self) -> Result<()> {
        let slots = std::mem::take(&mut self.slots);
        let mut spill = lock(&self.spill)?;
        for slot in slots {
            if let Slot::Spilled(h) = slot {
                spill.delete(h)?;
            }
        }
        drop(spill);
        self.reservation.free();
        self.live_rows = 0;
        Ok(())
    }

    /// Spill every unpinned resident chunk.
    pub fn spill_all(&mut self) -> Result<usize> {
        let mut n = 0;
        while let Some(idx) = self.lru_victim() {
            self.spill_slot(idx)?;
            n += 1;
        }
        Ok(n)
    }

    fn evict_until_within_budget(&mut self) -> Result<()> {
        while self.reservation.pool().is_over_budget() {
            let Some(idx) = self.lru_victim() else {
                break;
            };
            self.spill_slot(idx)?;
        }
        Ok(())
    }

    /// Evict until `incoming` more bytes fit under the soft budget.
    fn make_room(&mut self, incoming: usize) -> Result<()> {
        let pool = Arc::clone(self.reservation.pool());
        while pool.used_bytes() + incoming > pool.budget_bytes() {
            let Some(idx) = self.lru_victim() else {
                break;
            };
            self.spill_slot(idx)?;
        }
        Ok(())
    }

    fn lru_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Resident {
                    pins: 0, last_used, ..
                } => Some((i, *last_used)),
                _ => None,
            })
            .min_by_key(|(_, t)| *t)
            .map(|(i, _)| i)
    }

    fn spill_slot(&mut self, idx: usize) -> Result<()> {
        let Slot::Resident { batch, bytes, .. } = &self.slots[idx] else {
            return Ok(());
        };
        let bytes = *bytes;
        let encoded = encode_batches(&self.schema, std::slice::from_ref(batch))?;
        let handle = lock(&self.spill)?.write(&encoded)?;
        self.slots[idx] = Slot::Spilled(handle);
        self.reservation.resize(self.reservation.bytes() - bytes)?;
        debug!(chunk = idx, bytes, spilled_bytes = encoded.len(), "chunk unpinned to storage");
        Ok(())
    }

    fn load(&mut self, handle: ChunkHandle) -> Result<()> {
        let Slot::Spilled(spill_handle) = *self.slot_mut(handle)? else {
            return Ok(());
        };
        let bytes = lock(&self.spill)?.read(spill_handle)?;
        let (_, mut batches) = decode_batches(&bytes)?;
        let batch = match batches.len() {
            1 => batches.remove(0),
            0 => RecordBatch::new_empty(self.schema.clone()),
            _ => arrow::compute::concat_batches(&self.schema, &batches)?,
        };
        let size = batch.get_array_memory_size();
        self.tick += 1;
        self.slots[handle.0] = Slot::Resident {
            batch,
            bytes: size,
            pins: 0,
            last_used: self.tick,
        };
        self.reservation.resize(self.reservation.bytes() + size)?;
        Ok(())
    }

    fn slot_mut(&mut self, handle: ChunkHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.0)
            .ok_or_else(|| TesseraError::Execution(format!("unknown chunk {}", handle.0)))
    }
}

impl Drop for SpillableChunks {
    fn drop(&mut self) {
        if self.slots.iter().any(|s| matches!(s, Slot::Spilled(_))) {
            let _ = self.release();
        }
    }
}
