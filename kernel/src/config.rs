//! Kernel configuration constants.
//!
//! Central location for table sizes and the user address-space layout.
//!
//! # Address Space Layout
//!
//! ```text
//! FAULT_STACK_TOP ─┐
//!   exception stack │ one page, always private and writable
//! ────────────────── │ one unmapped guard page
//! USER_STACK_TOP  ─┘
//!   normal user pages (code, data, stack) — duplicated on fork
//! SCRATCH_PAGE        staging address used by fault recovery
//! ```

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the environment table size. The slot index of an
/// environment identity occupies this many low bits.
pub const LOG2_NENV: u32 = 6;

/// Number of slots in the environment table.
pub const NENV: usize = 1 << LOG2_NENV;

/// Default number of CPUs.
pub const NCPU: usize = 8;

/// Top of the user-controllable address space.
pub const USER_TOP: u64 = 0x8000_0000;

/// Top of the exception stack used for page-fault upcalls. The stack
/// occupies the single page below this address.
pub const FAULT_STACK_TOP: u64 = USER_TOP;

/// Top of the normal user stack. The page between here and the
/// exception stack is left unmapped so a stack overrun faults instead
/// of silently corrupting the exception stack.
pub const USER_STACK_TOP: u64 = FAULT_STACK_TOP - 2 * PAGE_SIZE as u64;

/// Fixed staging virtual address used while recovering from a
/// copy-on-write fault.
pub const SCRATCH_PAGE: u64 = 0x0040_0000;

/// Round an address down to its page boundary.
pub const fn page_align_down(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

/// Check whether an address is page-aligned.
pub const fn is_page_aligned(va: u64) -> bool {
    va & (PAGE_SIZE as u64 - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert_eq!(page_align_down(0x1234), 0x1000);
        assert_eq!(page_align_down(0x1000), 0x1000);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2001));
    }

    #[test]
    fn test_layout_leaves_guard_page() {
        assert_eq!(FAULT_STACK_TOP - USER_STACK_TOP, 2 * PAGE_SIZE as u64);
        assert!(SCRATCH_PAGE < USER_STACK_TOP);
        assert!(is_page_aligned(SCRATCH_PAGE));
    }
}
