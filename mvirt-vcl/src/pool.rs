//! Index pool with free-slot reuse.
//!
//! A `Slab` addressed by `u32` with an upper bound on live elements.
//! Indices stay stable while a slot is allocated; freed slots are recycled.

use slab::Slab;

#[derive(Debug, Clone)]
pub struct Pool<T> {
    slots: Slab<T>,
    capacity: u32,
}

impl<T> Pool<T> {
    /// Create a pool that refuses to grow beyond `capacity` live elements.
    pub fn with_capacity_limit(capacity: u32) -> Self {
        Pool {
            slots: Slab::new(),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity as usize
    }

    /// Insert a value built from its future index.
    ///
    /// Returns `None` when the pool is full.
    pub fn insert_with(&mut self, f: impl FnOnce(u32) -> T) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let entry = self.slots.vacant_entry();
        let index = u32::try_from(entry.key()).ok()?;
        entry.insert(f(index));
        Some(index)
    }

    /// Index the next insert will use, or `None` when full.
    pub fn next_index(&self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        u32::try_from(self.slots.vacant_key()).ok()
    }

    /// Place `value` at a specific free `index`.
    ///
    /// Returns the value back if the slot is taken or beyond capacity.
    pub fn insert_at(&mut self, index: u32, value: T) -> Result<(), T> {
        if index >= self.capacity || self.is_full() || self.slots.contains(index as usize) {
            return Err(value);
        }
        if self.slots.vacant_key() == index as usize {
            self.slots.insert(value);
            return Ok(());
        }
        // Rebuilding lets the slab record the holes below `index` as vacant.
        let slots = std::mem::take(&mut self.slots);
        self.slots = slots
            .into_iter()
            .chain(std::iter::once((index as usize, value)))
            .collect();
        Ok(())
    }

    /// Remove and return the value at `index`.
    pub fn remove(&mut self, index: u32) -> Option<T> {
        self.slots.try_remove(index as usize)
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize)
    }

    /// True if `index` is not currently allocated.
    pub fn is_free_index(&self, index: u32) -> bool {
        !self.slots.contains(index as usize)
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate live (index, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots.iter().map(|(i, v)| (i as u32, v))
    }

    /// Indices of all live elements.
    pub fn indices(&self) -> Vec<u32> {
        self.iter().map(|(i, _)| i).collect()
    }
}
