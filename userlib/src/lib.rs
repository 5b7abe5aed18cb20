//! Chalk userspace library.
//!
//! The user-level half of the Chalk core: an explicit process handle
//! (`process`), the page-fault upcall runtime (`pgfault`) and
//! user-level copy-on-write fork (`fork`). Everything here talks to
//! the kernel exclusively through the request primitives exposed by
//! `chalk-kernel`.

#![no_std]

extern crate alloc;

pub mod fork;
pub mod pgfault;
pub mod process;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::fork::{fork, ForkError};
    pub use crate::pgfault::{cow_fault_handler, set_fault_handler};
    pub use crate::process::Process;
}
