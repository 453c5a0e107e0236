//! Generation-Checked Slot Arena
//!
//! Every table is a fixed-size arena of typed slots. Each slot carries its
//! [`EntryState`] and a generation counter that advances on every mutation,
//! so a handle taken before a slot was reused or rewritten is rejected
//! instead of silently addressing the new occupant.

use crate::error::{Error, Result};
use crate::store::entry::EntryState;
use std::ops::Range;

/// Position plus generation of a slot at the time it was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    state: EntryState,
    generation: u64,
    value: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: EntryState::Invalid,
            generation: 0,
            value: None,
        }
    }
}

/// Fixed-size table of generation-checked slots
#[derive(Debug)]
pub struct SlotArena<T> {
    table: &'static str,
    slots: Vec<Slot<T>>,
}

impl<T: Clone> SlotArena<T> {
    pub fn new(table: &'static str, size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Slot::default);
        Self { table, slots }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every slot and resize
    pub fn reset(&mut self, size: usize) {
        self.slots.clear();
        self.slots.resize_with(size, Slot::default);
    }

    fn slot(&self, index: usize) -> Result<&Slot<T>> {
        self.slots.get(index).ok_or(Error::EntryIndexOutOfRange {
            table: self.table,
            index,
        })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot<T>> {
        let table = self.table;
        self.slots
            .get_mut(index)
            .ok_or(Error::EntryIndexOutOfRange { table, index })
    }

    fn checked_mut(&mut self, handle: EntryHandle) -> Result<&mut Slot<T>> {
        let table = self.table;
        let slot = self.slot_mut(handle.index)?;
        if slot.generation != handle.generation {
            return Err(Error::StaleEntryHandle {
                table,
                index: handle.index,
            });
        }
        Ok(slot)
    }

    fn transition(table: &'static str, slot: &mut Slot<T>, to: EntryState) -> Result<()> {
        if !slot.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                table,
                from: slot.state,
                to,
            });
        }
        slot.state = to;
        slot.generation += 1;
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn state(&self, index: usize) -> Result<EntryState> {
        Ok(self.slot(index)?.state)
    }

    /// Handle of a slot as it is now
    pub fn handle(&self, index: usize) -> Result<EntryHandle> {
        let slot = self.slot(index)?;
        Ok(EntryHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Check a handle still addresses the slot generation it was taken at
    pub fn check(&self, handle: EntryHandle, expected: EntryState) -> Result<()> {
        let slot = self.slot(handle.index)?;
        if slot.generation != handle.generation {
            return Err(Error::StaleEntryHandle {
                table: self.table,
                index: handle.index,
            });
        }
        if slot.state != expected {
            return Err(Error::InvalidStateTransition {
                table: self.table,
                from: slot.state,
                to: expected,
            });
        }
        Ok(())
    }

    /// Value of a `Valid` slot
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots
            .get(index)
            .filter(|slot| slot.state == EntryState::Valid)
            .and_then(|slot| slot.value.as_ref())
    }

    /// First `Invalid` slot in `range`
    pub fn first_free(&self, range: Range<usize>) -> Option<usize> {
        let end = range.end.min(self.slots.len());
        (range.start..end).find(|&i| self.slots[i].state == EntryState::Invalid)
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            if slot.state == EntryState::Valid {
                slot.value.as_ref().map(|v| (i, v))
            } else {
                None
            }
        })
    }

    pub fn count(&self, state: EntryState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// `Invalid -> Uncommitted`
    pub fn reserve(&mut self, index: usize) -> Result<EntryHandle> {
        let table = self.table;
        let slot = self.slot_mut(index)?;
        Self::transition(table, slot, EntryState::Uncommitted)?;
        Ok(EntryHandle {
            index,
            generation: slot.generation,
        })
    }

    /// `Uncommitted -> Valid`, storing the value
    pub fn commit(&mut self, handle: EntryHandle, value: T) -> Result<EntryHandle> {
        let table = self.table;
        let slot = self.checked_mut(handle)?;
        Self::transition(table, slot, EntryState::Valid)?;
        slot.value = Some(value);
        Ok(EntryHandle {
            index: handle.index,
            generation: slot.generation,
        })
    }

    /// Overwrite a `Valid` slot
    pub fn replace(&mut self, handle: EntryHandle, value: T) -> Result<EntryHandle> {
        let table = self.table;
        let slot = self.checked_mut(handle)?;
        if slot.state != EntryState::Valid {
            return Err(Error::InvalidStateTransition {
                table,
                from: slot.state,
                to: EntryState::Valid,
            });
        }
        slot.generation += 1;
        slot.value = Some(value);
        Ok(EntryHandle {
            index: handle.index,
            generation: slot.generation,
        })
    }

    /// `Valid -> Destroy`
    pub fn mark_destroy(&mut self, handle: EntryHandle) -> Result<EntryHandle> {
        let table = self.table;
        let slot = self.checked_mut(handle)?;
        Self::transition(table, slot, EntryState::Destroy)?;
        Ok(EntryHandle {
            index: handle.index,
            generation: slot.generation,
        })
    }

    /// `Uncommitted | Destroy -> Invalid`, zeroing the slot
    pub fn release(&mut self, handle: EntryHandle) -> Result<()> {
        let table = self.table;
        let slot = self.checked_mut(handle)?;
        Self::transition(table, slot, EntryState::Invalid)?;
        slot.value = None;
        Ok(())
    }

    /// Write a value regardless of the handle held by anyone else.
    ///
    /// Used by replay and peer replication, which carry already-committed
    /// entries. A slot reserved by a local transaction is refused.
    pub fn install(&mut self, index: usize, value: T) -> Result<EntryHandle> {
        let handle = self.handle(index)?;
        match self.state(index)? {
            EntryState::Valid => self.replace(handle, value),
            EntryState::Invalid => {
                let handle = self.reserve(index)?;
                self.commit(handle, value)
            }
            state => Err(Error::InvalidStateTransition {
                table: self.table,
                from: state,
                to: EntryState::Valid,
            }),
        }
    }

    /// Remove a `Valid` slot through `Destroy` back to `Invalid`
    pub fn remove(&mut self, index: usize) -> Result<Option<T>> {
        let handle = self.handle(index)?;
        match self.state(index)? {
            EntryState::Invalid => Ok(None),
            EntryState::Valid => {
                let value = self.slot(index)?.value.clone();
                let handle = self.mark_destroy(handle)?;
                self.release(handle)?;
                Ok(value)
            }
            EntryState::Destroy => {
                let value = self.slot(index)?.value.clone();
                self.release(handle)?;
                Ok(value)
            }
            EntryState::Uncommitted => Err(Error::InvalidStateTransition {
                table: self.table,
                from: EntryState::Uncommitted,
                to: EntryState::Invalid,
            }),
        }
    }
}
