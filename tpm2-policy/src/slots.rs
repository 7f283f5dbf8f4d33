// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity arena of loaded sessions

use crate::error::{Result, TpmError};

/// Index of an occupied slot in a [`SlotRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Arena that never grows past its capacity
#[derive(Debug, Clone)]
pub struct SlotRegistry<T> {
    slots: Vec<Option<T>>,
    free: usize,
}

impl<T> SlotRegistry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            free: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn occupied_count(&self) -> usize {
        self.capacity() - self.free
    }

    /// First free slot, without claiming it
    pub fn peek_free(&self) -> Result<SlotId> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(SlotId)
            .ok_or(TpmError::SessionMemory)
    }

    /// Store `value` in the first free slot
    pub fn allocate(&mut self, value: T) -> Result<SlotId> {
        let id = self.peek_free()?;
        self.slots[id.0] = Some(value);
        self.free -= 1;
        Ok(id)
    }

    pub fn release(&mut self, id: SlotId) -> Option<T> {
        let value = self.slots.get_mut(id.0)?.take()?;
        self.free += 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    /// Drop every loaded value
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.free = self.capacity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_recoverable() {
        let mut reg = SlotRegistry::with_capacity(2);
        let a = reg.allocate("a").unwrap();
        let _b = reg.allocate("b").unwrap();
        assert_eq!(reg.allocate("c"), Err(TpmError::SessionMemory));
        assert_eq!(reg.release(a), Some("a"));
        assert_eq!(reg.free_count(), 1);
        let c = reg.allocate("c").unwrap();
        assert_eq!(c, a);
        assert_eq!(reg.get(c), Some(&"c"));
    }

    #[test]
    fn test_double_release() {
        let mut reg = SlotRegistry::with_capacity(1);
        let a = reg.allocate(1u8).unwrap();
        assert!(reg.release(a).is_some());
        assert!(reg.release(a).is_none());
        assert_eq!(reg.free_count(), 1);
    }
}
