//! Saved execution context and fault records.

use crate::memory::flags::FaultCause;

/// Number of general-purpose registers carried in a saved context.
pub const NREGS: usize = 8;

/// Register state captured at an environment's last suspension.
///
/// Written only while the environment is not running; read at dispatch
/// time when the context is handed to a CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapContext {
    /// Program counter.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
    /// General-purpose registers.
    pub regs: [u64; NREGS],
    /// Return-value slot, as seen by the resumed code.
    pub retval: u64,
}

impl TrapContext {
    /// Set the value the environment observes as the return value of
    /// the request it was suspended in.
    pub fn set_return_value(&mut self, value: u64) {
        self.retval = value;
    }
}

/// Description of a page fault, as delivered to an upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting virtual address.
    pub va: u64,
    /// Error-code bitfield.
    pub cause: FaultCause,
}
