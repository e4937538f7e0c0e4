//! Connection slot table
//!
//! Bounded registry of live connections indexed by small integers. Index 0 is
//! reserved for the listening endpoint, so connection slots start at 1.
//! Freed indices are reused lowest first and trailing empty slots are
//! trimmed, so iteration cost follows the current number of connections
//! rather than the historical peak.

use std::collections::BTreeSet;

use crate::common::{Error, Result};

/// Index of the listening endpoint in the readiness set
pub const LISTENER_SLOT: usize = 0;

/// Fixed-capacity table of occupied slots
#[derive(Debug)]
pub struct SlotTable<T> {
    /// `slots[i]` holds slot index `i + 1`
    slots: Vec<Option<T>>,
    /// Empty indices below `slots.len()`
    free: BTreeSet<usize>,
    capacity: usize,
}

impl<T> SlotTable<T> {
    /// Create a table able to hold `capacity` connections
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            capacity,
        }
    }

    /// Maximum number of simultaneously occupied slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest slot index in use
    pub fn high_water(&self) -> usize {
        self.slots.len() + 1
    }

    /// Place `value` in the lowest empty slot at or above index 1
    pub fn allocate(&mut self, value: T) -> Result<usize> {
        if let Some(index) = self.free.pop_first() {
            self.slots[index - 1] = Some(value);
            return Ok(index);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Some(value));
            return Ok(self.slots.len());
        }
        Err(Error::NoCapacity {
            capacity: self.capacity,
        })
    }

    /// Empty `index`, returning what it held
    ///
    /// Dropping the returned value releases whatever it owns.
    pub fn free(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index.checked_sub(1)?)?.take()?;
        self.free.insert(index);

        while matches!(self.slots.last(), Some(None)) {
            let top = self.slots.len();
            self.slots.pop();
            self.free.remove(&top);
        }

        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index.checked_sub(1)?)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index.checked_sub(1)?)?.as_mut()
    }

    /// Occupied slots in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i + 1, v)))
    }
}
