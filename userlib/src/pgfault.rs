//! Page-fault upcall runtime and copy-on-write recovery.
//!
//! A process installs a fault handler once; the first installation
//! allocates the exception stack (the dedicated page the upcall runs
//! on) and registers the upcall entry point with the kernel. The
//! exception stack is always private and writable — were it
//! copy-on-write, the first write while servicing a fault would
//! re-enter the fault path.

use chalk_kernel::config::{page_align_down, FAULT_STACK_TOP, PAGE_SIZE, SCRATCH_PAGE};
use chalk_kernel::syscall::SysError;
use chalk_kernel::{FaultCause, FaultInfo, PageFlags};

use crate::process::{FaultHandler, Process};

/// Entry point of the upcall trampoline in the process image.
pub const UPCALL_ENTRY: u64 = 0x0010_0000;

/// Install `handler` as this process's page-fault handler.
///
/// Idempotent: the exception stack and the kernel-side upcall entry
/// are set up once per process lifetime; later calls only replace the
/// handler function.
pub fn set_fault_handler(proc: &mut Process, handler: FaultHandler) -> Result<(), SysError> {
    let stack_page = FAULT_STACK_TOP - PAGE_SIZE as u64;
    // A fork child arrives with the exception stack already in place;
    // only a process that has never had a handler sets one up.
    if proc.permissions(stack_page).is_none() {
        let sys = proc.system().clone();
        let me = proc.id();
        sys.page_alloc(
            me,
            me,
            stack_page,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE,
        )?;
        sys.set_fault_upcall(me, me, UPCALL_ENTRY)?;
    }
    proc.fault_handler = Some(handler);
    Ok(())
}

/// Copy-on-write fault handler.
///
/// Valid only for a write fault on a page whose mapping carries the
/// copy-on-write bit; anything else is an unrecoverable programming
/// error. Recovery stages a private copy at [`SCRATCH_PAGE`] and
/// remaps it over the faulting address — one mapping replacement, so
/// no other address space sharing the original frame is affected.
pub fn cow_fault_handler(proc: &mut Process, fault: &FaultInfo) {
    let va = page_align_down(fault.va);
    let cow = proc
        .permissions(va)
        .is_some_and(|flags| flags.contains(PageFlags::COPY_ON_WRITE));
    if !fault.cause.contains(FaultCause::WRITE) || !cow {
        panic!(
            "{}: fault at {:#x} (cause {:?}) is not a copy-on-write write",
            proc.id(),
            fault.va,
            fault.cause
        );
    }

    let sys = proc.system().clone();
    let me = proc.id();
    let writable = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE;

    if let Err(err) = sys.page_alloc(me, me, SCRATCH_PAGE, writable) {
        panic!("{}: fault recovery: page_alloc: {}", me, err);
    }

    // The faulted page is still readable; stage its contents into the
    // scratch page through our own mappings.
    let mut page = alloc::vec![0u8; PAGE_SIZE];
    if let Err(inner) = sys.user_read(me, va, &mut page) {
        panic!("{}: fault recovery: reading faulted page: {:?}", me, inner);
    }
    if let Err(inner) = sys.user_write(me, SCRATCH_PAGE, &page) {
        panic!("{}: fault recovery: filling scratch page: {:?}", me, inner);
    }

    if let Err(err) = sys.page_map(me, me, SCRATCH_PAGE, me, va, writable) {
        panic!("{}: fault recovery: page_map: {}", me, err);
    }
    if let Err(err) = sys.page_unmap(me, me, SCRATCH_PAGE) {
        panic!("{}: fault recovery: page_unmap: {}", me, err);
    }
    log::debug!("{}: copied out COW page at {:#x}", me, va);
}
