//! Open-addressing hash table mapping keys to dense group ids.
//!
//! The table stores only ids; key equality is delegated to the caller, which
//! compares against wherever the group's key lives (a build buffer row or a
//! representative input row). Ids are handed out in insertion order and never
//! change or get reused.

const EMPTY: u32 = u32::MAX;
const MIN_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct GroupIndex {
    slots: Vec<u32>,
    hashes: Vec<u64>,
    probeable: Vec<bool>,
    mask: usize,
}

impl Default for GroupIndex {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl GroupIndex {
    pub fn with_capacity(groups: usize) -> Self {
        let cap = (groups * 2).max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: vec![EMPTY; cap],
            hashes: Vec::with_capacity(groups),
            probeable: Vec::with_capacity(groups),
            mask: cap - 1,
        }
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn group_hash(&self, id: u32) -> u64 {
        self.hashes[id as usize]
    }

    pub fn memory_size(&self) -> usize {
        self.slots.capacity() * 4 + self.hashes.capacity() * 9
    }

    /// Find the group equal to the probe key.
    pub fn find(&self, hash: u64, mut eq: impl FnMut(u32) -> bool) -> Option<u32> {
        let mut pos = hash as usize & self.mask;
        loop {
            let id = self.slots[pos];
            if id == EMPTY {
                return None;
            }
            if self.hashes[id as usize] == hash && eq(id) {
                return Some(id);
            }
            pos = (pos + 1) & self.mask;
        }
    }

    /// Find the group equal to the probe key or insert a new one.
    /// Returns `(id, inserted)`.
    pub fn find_or_insert(&mut self, hash: u64, mut eq: impl FnMut(u32) -> bool) -> (u32, bool) {
        if (self.hashes.len() + 1) * 2 > self.slots.len() {
            self.grow();
        }
        let mut pos = hash as usize & self.mask;
        loop {
            let id = self.slots[pos];
            if id == EMPTY {
                let new_id = self.hashes.len() as u32;
                self.slots[pos] = new_id;
                self.hashes.push(hash);
                self.probeable.push(true);
                return (new_id, true);
            }
            if self.hashes[id as usize] == hash && eq(id) {
                return (id, false);
            }
            pos = (pos + 1) & self.mask;
        }
    }

    /// Add a group that never matches a later probe (e.g. a NULL key when
    /// NULLs are not equal to each other).
    pub fn insert_distinct(&mut self, hash: u64) -> u32 {
        let id = self.hashes.len() as u32;
        self.hashes.push(hash);
        self.probeable.push(false);
        id
    }

    pub fn clear(&mut self) {
        self.slots.fill(EMPTY);
        self.hashes.clear();
        self.probeable.clear();
    }

    fn grow(&mut self) {
        let cap = self.slots.len() * 2;
        self.slots = vec![EMPTY; cap];
        self.mask = cap - 1;
        for (id, &h) in self.hashes.iter().enumerate() {
            if !self.probeable[id] {
                continue;
            }
            let mut pos = h as usize & self.mask;
            while self.slots[pos] != EMPTY {
                pos = (pos + 1) & self.mask;
            }
            self.slots[pos] = id as u32;
        }
    }
}
