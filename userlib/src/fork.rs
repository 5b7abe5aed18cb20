//! User-level copy-on-write fork.
//!
//! Duplicates the calling process without copying any page contents
//! eagerly: every writable page is shared with the child read-only
//! and marked copy-on-write in both address spaces; the first write
//! on either side triggers the recovery handler in
//! [`crate::pgfault`], which copies the page out privately.

use chalk_kernel::config::{FAULT_STACK_TOP, PAGE_SIZE, USER_STACK_TOP};
use chalk_kernel::syscall::SysError;
use chalk_kernel::{Access, EnvId, EnvStatus, PageFlags, Perm, System};

use crate::pgfault::{cow_fault_handler, set_fault_handler, UPCALL_ENTRY};
use crate::process::Process;

/// Mapping side of the fork protocol.
///
/// `duppage` issues its mapping requests through this seam so the
/// exact request sequence can be observed; the ordering of those
/// requests is load-bearing, not just their combined effect.
trait PageMapper {
    /// Map our page at `src_va` into `dst` at `dst_va` with `flags`.
    fn map(&mut self, src_va: u64, dst: EnvId, dst_va: u64, flags: PageFlags)
        -> Result<(), SysError>;
}

struct KernelMapper<'a> {
    sys: &'a System,
    me: EnvId,
}

impl PageMapper for KernelMapper<'_> {
    fn map(
        &mut self,
        src_va: u64,
        dst: EnvId,
        dst_va: u64,
        flags: PageFlags,
    ) -> Result<(), SysError> {
        self.sys.page_map(self.me, self.me, src_va, dst, dst_va, flags)
    }
}

/// Failure of the fork protocol. There is no partial rollback: on any
/// error the half-built child is left `NotRunnable` and is therefore
/// never scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the fault handler failed.
    Handler(SysError),
    /// The duplicate-self request failed.
    Create(SysError),
    /// Sharing the page at `va` with the child failed.
    Share {
        /// Page being duplicated.
        va: u64,
        /// Underlying failure.
        err: SysError,
    },
    /// Allocating the child's exception stack failed.
    ExceptionStack(SysError),
    /// Installing the child's upcall entry failed.
    Upcall(SysError),
    /// Releasing the child failed.
    SetRunnable(SysError),
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ForkError::Handler(err) => write!(f, "fork: installing fault handler: {}", err),
            ForkError::Create(err) => write!(f, "fork: duplicate-self: {}", err),
            ForkError::Share { va, err } => write!(f, "fork: sharing page {:#x}: {}", va, err),
            ForkError::ExceptionStack(err) => write!(f, "fork: child exception stack: {}", err),
            ForkError::Upcall(err) => write!(f, "fork: child upcall: {}", err),
            ForkError::SetRunnable(err) => write!(f, "fork: releasing child: {}", err),
        }
    }
}

/// Duplicate the calling process copy-on-write.
///
/// Returns the child's identity. The child comes to life as a
/// register-state copy of the caller and should build its own handle
/// with [`Process::attach`] when it first runs. It is released to the
/// scheduler only after its whole address space, exception stack and
/// fault upcall are in place.
pub fn fork(proc: &mut Process) -> Result<EnvId, ForkError> {
    set_fault_handler(proc, cow_fault_handler).map_err(ForkError::Handler)?;

    let sys = proc.system().clone();
    let me = proc.id();
    let child = sys.exofork(me).map_err(ForkError::Create)?;

    // Share every user page below the stack top. The exception stack
    // lives above this boundary and is deliberately excluded: it must
    // never be copy-on-write.
    let mut mapper = KernelMapper { sys: &sys, me };
    for (va, flags) in sys.mapped_pages(me) {
        if va >= USER_STACK_TOP {
            break;
        }
        if !flags.contains(PageFlags::USER_ACCESSIBLE) {
            continue;
        }
        duppage(&mut mapper, me, child, va, flags).map_err(|err| ForkError::Share { va, err })?;
    }

    sys.page_alloc(
        me,
        child,
        FAULT_STACK_TOP - PAGE_SIZE as u64,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE,
    )
    .map_err(ForkError::ExceptionStack)?;
    sys.set_fault_upcall(me, child, UPCALL_ENTRY)
        .map_err(ForkError::Upcall)?;
    sys.set_status(me, child, EnvStatus::Runnable)
        .map_err(ForkError::SetRunnable)?;

    log::debug!("{}: forked {}", me, child);
    Ok(child)
}

/// Duplicate one page into `child` at the same address.
///
/// A writable or already-COW page is mapped into the child read-only
/// with the COW bit set, and only then is our own mapping downgraded
/// the same way. The order is a hard requirement: we may be executing
/// on the very page being duplicated, and a fault taken after the
/// downgrade but before the child's copy exists would have no safe
/// continuation. An immutable page is shared as-is.
fn duppage(
    mapper: &mut impl PageMapper,
    me: EnvId,
    child: EnvId,
    va: u64,
    flags: PageFlags,
) -> Result<(), SysError> {
    let perm = Perm::from_flags(flags & PageFlags::SHARE_MASK)
        .ok_or(SysError::InvalidArgument("corrupt permission bits"))?;

    match perm.access {
        Access::Writable | Access::CopyOnWrite => {
            let cow = Perm {
                access: Access::CopyOnWrite,
                user: perm.user,
            }
            .to_flags();
            mapper.map(va, child, va, cow)?;
            // Downgrade ourselves only now that the child holds the frame.
            mapper.map(va, me, va, cow)?;
        }
        Access::ReadOnly => {
            mapper.map(va, child, va, perm.to_flags())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod duppage_tests {
    use super::*;
    use alloc::vec::Vec;
    use chalk_kernel::SystemConfig;

    struct RecordingMapper {
        calls: Vec<(u64, EnvId, u64, PageFlags)>,
    }

    impl PageMapper for RecordingMapper {
        fn map(
            &mut self,
            src_va: u64,
            dst: EnvId,
            dst_va: u64,
            flags: PageFlags,
        ) -> Result<(), SysError> {
            self.calls.push((src_va, dst, dst_va, flags));
            Ok(())
        }
    }

    fn identities() -> (EnvId, EnvId) {
        let sys = System::new(SystemConfig { ncpu: 1, frames: 4 });
        let me = sys.create_env().unwrap();
        let child = sys.exofork(me).unwrap();
        (me, child)
    }

    fn cow() -> PageFlags {
        PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE | PageFlags::COPY_ON_WRITE
    }

    #[test]
    fn test_writable_page_maps_child_before_downgrading_self() {
        let (me, child) = identities();
        let mut mapper = RecordingMapper { calls: Vec::new() };
        let rw = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE;
        duppage(&mut mapper, me, child, 0x1000, rw).unwrap();

        // The child must hold the frame copy-on-write before our own
        // mapping is downgraded; swapping the two requests is a
        // correctness bug even though the end state looks the same.
        assert_eq!(
            mapper.calls,
            alloc::vec![(0x1000, child, 0x1000, cow()), (0x1000, me, 0x1000, cow())]
        );
    }

    #[test]
    fn test_already_cow_page_repeats_child_first_order() {
        let (me, child) = identities();
        let mut mapper = RecordingMapper { calls: Vec::new() };
        duppage(&mut mapper, me, child, 0x2000, cow()).unwrap();

        assert_eq!(
            mapper.calls,
            alloc::vec![(0x2000, child, 0x2000, cow()), (0x2000, me, 0x2000, cow())]
        );
    }

    #[test]
    fn test_read_only_page_is_shared_in_a_single_request() {
        let (me, child) = identities();
        let mut mapper = RecordingMapper { calls: Vec::new() };
        let ro = PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE;
        duppage(&mut mapper, me, child, 0x3000, ro).unwrap();

        // No downgrade of our own mapping: one request, child only.
        assert_eq!(mapper.calls, alloc::vec![(0x3000, child, 0x3000, ro)]);
    }
}
