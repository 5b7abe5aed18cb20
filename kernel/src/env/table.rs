//! The environment table.
//!
//! Fixed array of [`Environment`] descriptors. The table is only
//! reachable through the dispatch lock (it lives inside the
//! `spin::Mutex` guarding all scheduling state), so every method here
//! already executes under mutual exclusion.

use alloc::boxed::Box;

use super::{EnvId, EnvStatus, Environment};
use crate::config::NENV;
use crate::memory::{AddressSpace, FrameStore};
use crate::syscall::SysError;
use crate::trap::TrapContext;

/// Fixed-capacity table of process descriptors.
pub struct EnvTable {
    slots: Box<[Environment]>,
}

impl EnvTable {
    pub(crate) fn new() -> Self {
        EnvTable {
            slots: (0..NENV).map(Environment::empty).collect(),
        }
    }

    /// Resolve an identity to its descriptor.
    ///
    /// Fails with [`SysError::NotFound`] if the slot is free or has
    /// been reused by a later generation: a stale identity must never
    /// resolve to the slot's new occupant.
    pub fn lookup(&self, id: EnvId) -> Result<&Environment, SysError> {
        let env = &self.slots[id.slot()];
        if env.status == EnvStatus::Free || env.id != id {
            return Err(SysError::NotFound);
        }
        Ok(env)
    }

    /// Mutable variant of [`lookup`](Self::lookup).
    pub fn lookup_mut(&mut self, id: EnvId) -> Result<&mut Environment, SysError> {
        let env = &mut self.slots[id.slot()];
        if env.status == EnvStatus::Free || env.id != id {
            return Err(SysError::NotFound);
        }
        Ok(env)
    }

    /// Set the status of the environment identified by `id`.
    pub fn set_status(&mut self, id: EnvId, status: EnvStatus) -> Result<(), SysError> {
        self.lookup_mut(id)?.status = status;
        Ok(())
    }

    /// Claim a free slot for a new environment.
    ///
    /// The slot's generation counter is advanced so identities held on
    /// the previous occupant go stale. The new descriptor starts
    /// `NotRunnable` with an empty address space.
    pub(crate) fn alloc(&mut self, parent: Option<EnvId>) -> Result<EnvId, SysError> {
        let slot = self
            .slots
            .iter()
            .position(|env| env.status == EnvStatus::Free)
            .ok_or(SysError::NoFreeEnv)?;
        let env = &mut self.slots[slot];
        let id = EnvId::new(slot, env.id.generation() + 1);
        env.id = id;
        env.parent = parent;
        env.status = EnvStatus::NotRunnable;
        env.aspace = AddressSpace::new();
        env.context = TrapContext::default();
        env.fault_upcall = None;
        env.last_cpu = None;
        env.runs = 0;
        Ok(id)
    }

    /// Release a descriptor: drop every mapping (returning frames to
    /// the store) and mark the slot free. The identity stays behind so
    /// stale lookups keep failing until the slot is reused.
    pub(crate) fn free(&mut self, id: EnvId, frames: &mut FrameStore) {
        let env = &mut self.slots[id.slot()];
        debug_assert_eq!(env.id, id);
        for (_, entry) in env.aspace.drain() {
            frames.decref(entry.frame);
        }
        env.parent = None;
        env.status = EnvStatus::Free;
        env.context = TrapContext::default();
        env.fault_upcall = None;
        env.last_cpu = None;
    }

    /// Descriptor at `slot`, regardless of status.
    pub fn slot(&self, slot: usize) -> &Environment {
        &self.slots[slot]
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut Environment {
        &mut self.slots[slot]
    }

    /// Slot-ordered iteration over all descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.slots.iter()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots (never true in practice).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_bumps_generation() {
        let mut table = EnvTable::new();
        let first = table.alloc(None).unwrap();
        assert_eq!(first.generation(), 1);

        let mut frames = FrameStore::new(1);
        table.free(first, &mut frames);
        let second = table.alloc(None).unwrap();
        assert_eq!(second.slot(), first.slot());
        assert_eq!(second.generation(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_lookup_fails() {
        let mut table = EnvTable::new();
        let mut frames = FrameStore::new(1);
        let stale = table.alloc(None).unwrap();
        table.free(stale, &mut frames);
        let fresh = table.alloc(None).unwrap();

        assert_eq!(table.lookup(stale).err(), Some(SysError::NotFound));
        assert!(table.lookup(fresh).is_ok());
    }

    #[test]
    fn test_lookup_free_slot_fails() {
        let table = EnvTable::new();
        assert_eq!(table.lookup(EnvId::new(0, 0)).err(), Some(SysError::NotFound));
    }

    #[test]
    fn test_table_exhaustion() {
        let mut table = EnvTable::new();
        for _ in 0..NENV {
            table.alloc(None).unwrap();
        }
        assert_eq!(table.alloc(None).err(), Some(SysError::NoFreeEnv));
    }

    #[test]
    fn test_free_returns_frames() {
        let mut table = EnvTable::new();
        let mut frames = FrameStore::new(2);
        let id = table.alloc(None).unwrap();
        let frame = frames.alloc().unwrap();
        table
            .lookup_mut(id)
            .unwrap()
            .aspace
            .insert(0x1000, crate::memory::PageEntry {
                frame,
                flags: crate::memory::PageFlags::PRESENT,
            });
        table.free(id, &mut frames);
        assert_eq!(frames.allocated(), 0);
    }
}
