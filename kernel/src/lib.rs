//! Chalk kernel core: environments, dispatch lock, scheduler, paging.
//!
//! This crate is the process-management core of the Chalk teaching
//! OS. It provides:
//!
//! - a fixed-size table of environment descriptors with
//!   generation-checked identities ([`env`]),
//! - one coarse dispatch lock serializing every table access and
//!   scheduling decision across CPUs ([`system::System`]),
//! - a round-robin scheduler with an explicit halt path ([`sched`]),
//! - reference-counted physical frames and per-environment address
//!   spaces with a software copy-on-write permission bit ([`memory`]),
//! - the request primitives user-level code builds on ([`syscall`]).
//!
//! The user-level half — the copy-on-write fork protocol and the
//! page-fault recovery handler — lives in the `chalk-userlib` crate.

#![no_std]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod env;
pub mod memory;
pub mod sched;
pub mod syscall;
pub mod system;
pub mod trap;

pub use cpu::{Cpu, CpuId, CpuStatus};
pub use env::{EnvId, EnvStatus, EnvTable, Environment};
pub use memory::{Access, AddressSpace, FaultCause, PageFlags, Perm};
pub use sched::Dispatch;
pub use syscall::SysError;
pub use system::{System, SystemConfig};
pub use trap::{FaultInfo, TrapContext};
