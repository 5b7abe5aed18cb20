//! Environments: the process abstraction of the kernel.
//!
//! An environment is a slot in a fixed table plus an identity that
//! encodes both the slot index and a generation counter, so that a
//! stale identity from a previous occupant of the slot can never
//! resolve to the current one.

pub mod table;

pub use table::EnvTable;

use crate::config::{LOG2_NENV, NENV};
use crate::cpu::CpuId;
use crate::memory::AddressSpace;
use crate::trap::TrapContext;

/// Environment identity: slot index in the low [`LOG2_NENV`] bits,
/// generation counter above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(u32);

impl EnvId {
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        debug_assert!(slot < NENV);
        EnvId((generation << LOG2_NENV) | slot as u32)
    }

    /// Table slot this identity refers to.
    pub fn slot(self) -> usize {
        (self.0 & (NENV as u32 - 1)) as usize
    }

    /// Generation counter of this identity.
    pub fn generation(self) -> u32 {
        self.0 >> LOG2_NENV
    }

    /// Raw encoded value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Lifecycle status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot is unoccupied.
    Free,
    /// Ready to be dispatched.
    Runnable,
    /// Dispatched on some CPU right now.
    Running,
    /// Exists but must not be scheduled (e.g. half-built fork child).
    NotRunnable,
    /// Marked for destruction; reclaimed at its next trap.
    Dying,
}

/// One process descriptor.
#[derive(Debug)]
pub struct Environment {
    /// Identity of the current (or most recent) occupant of this slot.
    pub id: EnvId,
    /// Creator of this environment, if any.
    pub parent: Option<EnvId>,
    /// Lifecycle status.
    pub status: EnvStatus,
    /// Page mappings, exclusively owned by this environment.
    pub aspace: AddressSpace,
    /// Register state at last suspension.
    pub context: TrapContext,
    /// Entry point for page-fault upcalls, once installed.
    pub fault_upcall: Option<u64>,
    /// CPU that last ran this environment. Diagnostics only; any CPU
    /// may dispatch any runnable environment.
    pub last_cpu: Option<CpuId>,
    /// Number of times this environment has been dispatched.
    pub runs: u64,
}

impl Environment {
    fn empty(slot: usize) -> Self {
        Environment {
            id: EnvId::new(slot, 0),
            parent: None,
            status: EnvStatus::Free,
            aspace: AddressSpace::new(),
            context: TrapContext::default(),
            fault_upcall: None,
            last_cpu: None,
            runs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_encoding() {
        let id = EnvId::new(5, 3);
        assert_eq!(id.slot(), 5);
        assert_eq!(id.generation(), 3);
    }

    #[test]
    fn test_same_slot_different_generation_not_equal() {
        assert_ne!(EnvId::new(7, 1), EnvId::new(7, 2));
    }
}
