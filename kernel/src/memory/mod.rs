//! Memory management: permission bits, frame store, address spaces.

pub mod aspace;
pub mod flags;
pub mod frame;

pub use aspace::{AddressSpace, PageEntry};
pub use flags::{Access, FaultCause, PageFlags, Perm};
pub use frame::{FrameId, FrameStore};
