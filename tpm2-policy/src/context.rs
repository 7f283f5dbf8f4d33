// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Context identity allocator
//!
//! Each active session owns one entry of the registry for its whole life.
//! While loaded the entry names its RAM slot; while saved it holds the low
//! bits of the 64-bit context counter at the time of the save. Only those
//! low bits survive, so the allocator refuses any create, save or load that
//! could hand out a truncated value still held by the oldest saved context.

use tracing::{debug, warn};

use crate::config::ContextSlot;
use crate::error::{Result, TpmError};
use crate::slots::SlotId;

/// State of one active-session entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    Loaded(SlotId),
    /// Truncated context counter recorded at save time
    Saved(u16),
}

/// Stable identity of an active session (the handle's index bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActiveId(pub(crate) u32);

impl ActiveId {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct ContextRegistry {
    entries: Vec<SlotState>,
    counter: u64,
    oldest: Option<ActiveId>,
    slot: ContextSlot,
    max_loaded: usize,
}

impl ContextRegistry {
    pub fn new(max_active: usize, max_loaded: usize, slot: ContextSlot) -> Self {
        Self {
            entries: vec![SlotState::Free; max_active],
            counter: Self::initial_counter(max_loaded),
            oldest: None,
            slot,
            max_loaded,
        }
    }

    fn initial_counter(max_loaded: usize) -> u64 {
        max_loaded as u64 + 1
    }

    /// Current 64-bit context counter
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn low_bits(&self) -> u16 {
        self.slot.truncate(self.counter)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn state(&self, id: ActiveId) -> Option<SlotState> {
        self.entries.get(id.0 as usize).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActiveId, SlotState)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, s)| (ActiveId(i as u32), *s))
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| !matches!(s, SlotState::Free))
            .count()
    }

    /// Tracked oldest saved entry
    pub fn oldest(&self) -> Option<ActiveId> {
        self.oldest
    }

    /// True when the oldest saved context holds the value the counter
    /// would assign next
    fn oldest_blocks_counter(&self) -> bool {
        self.oldest
            .and_then(|id| self.state(id))
            .is_some_and(|s| s == SlotState::Saved(self.low_bits()))
    }

    /// Recompute the oldest saved entry by modular distance from the counter
    pub fn set_oldest(&mut self) {
        let low = self.low_bits() as u64;
        let range = self.slot.range();
        let mut best: Option<(u64, ActiveId)> = None;
        for (id, state) in self.iter() {
            if let SlotState::Saved(value) = state {
                let distance = (value as u64 + range - low) % range;
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, id));
                }
            }
        }
        self.oldest = best.map(|(_, id)| id);
    }

    /// Choose the entry for a new session that will occupy one of
    /// `free_slots` free RAM slots; nothing is recorded until
    /// [`Self::mark_loaded`]
    pub fn begin_create(&self, free_slots: usize) -> Result<ActiveId> {
        if free_slots == 0 {
            return Err(TpmError::SessionMemory);
        }
        if free_slots == 1 && self.oldest_blocks_counter() {
            warn!(
                counter = self.counter,
                "refusing session create: would strand the oldest saved context"
            );
            return Err(TpmError::ContextGap);
        }
        self.entries
            .iter()
            .position(|s| *s == SlotState::Free)
            .map(|i| ActiveId(i as u32))
            .ok_or(TpmError::SessionHandles)
    }

    /// Check that the saved entry `id` may take one of `free_slots`
    pub fn begin_load(&self, id: ActiveId, free_slots: usize) -> Result<()> {
        if !matches!(self.state(id), Some(SlotState::Saved(_))) {
            return Err(TpmError::Handle);
        }
        if free_slots == 0 {
            return Err(TpmError::SessionMemory);
        }
        if free_slots == 1 && self.oldest != Some(id) && self.oldest_blocks_counter() {
            warn!(
                index = id.0,
                "refusing context load: only the oldest saved context may take the last slot"
            );
            return Err(TpmError::ContextGap);
        }
        Ok(())
    }

    /// Record that `id` now lives in `slot`
    pub fn mark_loaded(&mut self, id: ActiveId, slot: SlotId) {
        let was_saved = matches!(self.state(id), Some(SlotState::Saved(_)));
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            *entry = SlotState::Loaded(slot);
        }
        if was_saved && self.oldest == Some(id) {
            self.set_oldest();
        }
    }

    /// Counter value a save of `id` would use, or the reason it cannot
    pub fn check_save(&self, id: ActiveId) -> Result<u64> {
        let Some(SlotState::Loaded(_)) = self.state(id) else {
            return Err(TpmError::Handle);
        };
        if self.oldest_blocks_counter() {
            warn!(
                counter = self.counter,
                "refusing context save: oldest saved context must be reloaded first"
            );
            return Err(TpmError::ContextGap);
        }
        self.next_counter()?;
        Ok(self.counter)
    }

    fn next_counter(&self) -> Result<u64> {
        let mut next = self
            .counter
            .checked_add(1)
            .ok_or(TpmError::TooManyContexts)?;
        if self.slot.truncate(next) == 0 {
            next = next
                .checked_add(self.max_loaded as u64 + 1)
                .ok_or(TpmError::TooManyContexts)?;
        }
        Ok(next)
    }

    /// Move `id` from its slot to the saved state
    ///
    /// Returns the full counter value (the context sequence number) and the
    /// slot that the caller must release.
    pub fn save(&mut self, id: ActiveId) -> Result<(u64, SlotId)> {
        let sequence = self.check_save(id)?;
        let Some(SlotState::Loaded(slot)) = self.state(id) else {
            return Err(TpmError::Handle);
        };
        let next = self.next_counter()?;
        self.entries[id.0 as usize] = SlotState::Saved(self.low_bits());
        self.counter = next;
        if self.oldest.is_none() {
            self.oldest = Some(id);
        }
        debug!(index = id.0, sequence, "session context saved");
        Ok((sequence, slot))
    }

    /// Release the entry; returns the slot it held, if loaded
    pub fn flush(&mut self, id: ActiveId) -> Option<SlotId> {
        let entry = self.entries.get_mut(id.0 as usize)?;
        let previous = std::mem::replace(entry, SlotState::Free);
        if self.oldest == Some(id) {
            self.set_oldest();
        }
        match previous {
            SlotState::Loaded(slot) => Some(slot),
            _ => None,
        }
    }

    /// Whether a context blob carrying `sequence` can belong to `id`
    pub fn sequence_is_valid(&self, id: ActiveId, sequence: u64) -> bool {
        let Some(SlotState::Saved(value)) = self.state(id) else {
            return false;
        };
        value == self.slot.truncate(sequence)
            && sequence <= self.counter
            && self.counter - sequence <= self.slot.range()
    }

    /// Reset after TPM Reset (`clear`) or TPM Restart/Resume
    pub fn startup(&mut self, clear: bool) {
        if clear {
            self.entries.iter_mut().for_each(|e| *e = SlotState::Free);
            self.counter = Self::initial_counter(self.max_loaded);
            self.oldest = None;
        } else {
            for e in self.entries.iter_mut() {
                if matches!(e, SlotState::Loaded(_)) {
                    *e = SlotState::Free;
                }
            }
            self.set_oldest();
        }
    }

    /// Distinct truncated values currently saved equal the number of saved
    /// entries
    pub fn saved_values_are_unique(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.entries.iter().all(|s| match s {
            SlotState::Saved(v) => seen.insert(*v),
            _ => true,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotRegistry;

    fn registry(max_active: usize, max_loaded: usize) -> (ContextRegistry, SlotRegistry<u32>) {
        (
            ContextRegistry::new(max_active, max_loaded, ContextSlot::U8),
            SlotRegistry::with_capacity(max_loaded),
        )
    }

    fn create(ctx: &mut ContextRegistry, slots: &mut SlotRegistry<u32>) -> Result<ActiveId> {
        let id = ctx.begin_create(slots.free_count())?;
        let slot = slots.allocate(id.0)?;
        ctx.mark_loaded(id, slot);
        Ok(id)
    }

    fn save(ctx: &mut ContextRegistry, slots: &mut SlotRegistry<u32>, id: ActiveId) -> Result<u64> {
        let (seq, slot) = ctx.save(id)?;
        slots.release(slot);
        Ok(seq)
    }

    fn load(ctx: &mut ContextRegistry, slots: &mut SlotRegistry<u32>, id: ActiveId) -> Result<()> {
        ctx.begin_load(id, slots.free_count())?;
        let slot = slots.allocate(id.0)?;
        ctx.mark_loaded(id, slot);
        Ok(())
    }

    #[test]
    fn test_counter_starts_past_slot_values() {
        let (ctx, _) = registry(4, 3);
        assert_eq!(ctx.counter(), 4);
    }

    #[test]
    fn test_save_assigns_counter_and_tracks_oldest() {
        let (mut ctx, mut slots) = registry(4, 2);
        let a = create(&mut ctx, &mut slots).unwrap();
        let b = create(&mut ctx, &mut slots).unwrap();
        assert_eq!(save(&mut ctx, &mut slots, a).unwrap(), 3);
        assert_eq!(save(&mut ctx, &mut slots, b).unwrap(), 4);
        assert_eq!(ctx.state(a), Some(SlotState::Saved(3)));
        assert_eq!(ctx.oldest(), Some(a));
        load(&mut ctx, &mut slots, a).unwrap();
        assert_eq!(ctx.oldest(), Some(b));
    }

    #[test]
    fn test_error_precedence_on_create() {
        let (mut ctx, mut slots) = registry(1, 1);
        create(&mut ctx, &mut slots).unwrap();
        assert_eq!(
            ctx.begin_create(slots.free_count()),
            Err(TpmError::SessionMemory)
        );
        let (mut ctx, mut slots) = registry(1, 2);
        create(&mut ctx, &mut slots).unwrap();
        assert_eq!(
            ctx.begin_create(slots.free_count()),
            Err(TpmError::SessionHandles)
        );
    }

    #[test]
    fn test_wrap_skips_reserved_values() {
        let (mut ctx, mut slots) = registry(4, 3);
        ctx.set_counter(0xFF);
        let a = create(&mut ctx, &mut slots).unwrap();
        assert_eq!(save(&mut ctx, &mut slots, a).unwrap(), 0xFF);
        // low bits wrapped to zero, then skipped 0..=3
        assert_eq!(ctx.counter(), 0x104);
        assert_eq!(ctx.low_bits(), 4);
    }

    #[test]
    fn test_oldest_uses_modular_distance() {
        let (mut ctx, mut slots) = registry(4, 2);
        ctx.set_counter(0xFE);
        let a = create(&mut ctx, &mut slots).unwrap();
        let b = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, a).unwrap(); // 0xFE
        save(&mut ctx, &mut slots, b).unwrap(); // 0xFF
        let c = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, c).unwrap(); // 0x03 after the skip
        ctx.set_oldest();
        // raw value 0x03 is smallest, but 0xFE is oldest
        assert_eq!(ctx.oldest(), Some(a));
    }

    #[test]
    fn test_context_gap_on_save() {
        // 250 truncated values are available with a u8 slot and 5 loaded
        let (mut ctx, mut slots) = registry(8, 5);
        let first = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, first).unwrap();
        let other = create(&mut ctx, &mut slots).unwrap();
        // cycle the other session until the counter laps the first save
        let mut result = Ok(0);
        for _ in 0..400 {
            result = save(&mut ctx, &mut slots, other);
            if result.is_err() {
                break;
            }
            load(&mut ctx, &mut slots, other).unwrap();
        }
        assert_eq!(result, Err(TpmError::ContextGap));
        assert!(ctx.saved_values_are_unique());
        // reloading and resaving the oldest resolves the gap
        load(&mut ctx, &mut slots, first).unwrap();
        save(&mut ctx, &mut slots, first).unwrap();
        assert!(save(&mut ctx, &mut slots, other).is_ok());
    }

    #[test]
    fn test_context_gap_on_load_and_create() {
        let (mut ctx, mut slots) = registry(8, 2);
        let first = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, first).unwrap();
        let other = create(&mut ctx, &mut slots).unwrap();
        loop {
            save(&mut ctx, &mut slots, other).unwrap();
            if ctx.low_bits() == 3 {
                break;
            }
            load(&mut ctx, &mut slots, other).unwrap();
        }
        // `other` is saved, `first` holds the next counter value
        assert_eq!(ctx.oldest(), Some(first));
        let _filler = create(&mut ctx, &mut slots).unwrap();
        assert_eq!(slots.free_count(), 1);
        assert_eq!(
            ctx.begin_create(slots.free_count()),
            Err(TpmError::ContextGap)
        );
        assert_eq!(
            ctx.begin_load(other, slots.free_count()),
            Err(TpmError::ContextGap)
        );
        assert!(ctx.begin_load(first, slots.free_count()).is_ok());
    }

    #[test]
    fn test_flush_recomputes_oldest() {
        let (mut ctx, mut slots) = registry(4, 2);
        let a = create(&mut ctx, &mut slots).unwrap();
        let b = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, a).unwrap();
        save(&mut ctx, &mut slots, b).unwrap();
        assert_eq!(ctx.flush(a), None);
        assert_eq!(ctx.oldest(), Some(b));
        assert_eq!(ctx.state(a), Some(SlotState::Free));
    }

    #[test]
    fn test_sequence_validation() {
        let (mut ctx, mut slots) = registry(4, 2);
        let a = create(&mut ctx, &mut slots).unwrap();
        let seq = save(&mut ctx, &mut slots, a).unwrap();
        assert!(ctx.sequence_is_valid(a, seq));
        assert!(!ctx.sequence_is_valid(a, seq + 0x100));
        assert!(!ctx.sequence_is_valid(a, seq + 1));
        assert!(!ctx.sequence_is_valid(ActiveId(1), seq));
    }

    #[test]
    fn test_too_many_contexts_checked_before_mutation() {
        let (mut ctx, mut slots) = registry(4, 2);
        let a = create(&mut ctx, &mut slots).unwrap();
        ctx.set_counter(u64::MAX);
        assert_eq!(ctx.save(a).map(|_| ()), Err(TpmError::TooManyContexts));
        assert!(matches!(ctx.state(a), Some(SlotState::Loaded(_))));
        assert_eq!(ctx.counter(), u64::MAX);
    }

    #[test]
    fn test_startup_resume_keeps_saved() {
        let (mut ctx, mut slots) = registry(4, 2);
        let a = create(&mut ctx, &mut slots).unwrap();
        let b = create(&mut ctx, &mut slots).unwrap();
        save(&mut ctx, &mut slots, a).unwrap();
        ctx.startup(false);
        assert!(matches!(ctx.state(a), Some(SlotState::Saved(_))));
        assert_eq!(ctx.state(b), Some(SlotState::Free));
        assert_eq!(ctx.oldest(), Some(a));
        ctx.startup(true);
        assert_eq!(ctx.active_count(), 0);
        assert_eq!(ctx.counter(), 3);
    }
}
