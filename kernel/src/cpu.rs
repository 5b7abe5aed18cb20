//! Per-CPU state.

use crate::env::EnvId;

/// Identifier of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub usize);

impl core::fmt::Display for CpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Execution state of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    /// Running kernel or user code.
    Started,
    /// Waiting in the low-power state for a timer interrupt.
    Halted,
}

/// Scheduling state of one CPU. Lives inside the dispatch lock: the
/// halt path must mark `Halted` before the lock is released.
#[derive(Debug)]
pub struct Cpu {
    /// Execution state.
    pub status: CpuStatus,
    /// Environment currently dispatched on this CPU, if any.
    pub current: Option<EnvId>,
}

impl Cpu {
    pub(crate) fn new() -> Self {
        Cpu {
            status: CpuStatus::Started,
            current: None,
        }
    }
}
