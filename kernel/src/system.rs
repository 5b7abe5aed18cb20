//! The system root object.
//!
//! [`System`] owns the two locks of the core: the dispatch lock (one
//! `spin::Mutex` around the whole scheduling state — environment table
//! plus per-CPU records) and the frame-store lock. The dispatch lock is
//! taken for every table access and for the entirety of a scheduling
//! pass; where both locks are needed, the dispatch lock is always
//! taken first.
//!
//! `System` also provides the MMU boundary used by user-level code:
//! [`user_read`](System::user_read) and
//! [`user_write`](System::user_write) perform an access through an
//! environment's mappings and report a [`FaultInfo`] exactly where
//! hardware would raise a page fault.

use spin::Mutex;

use crate::config::{page_align_down, NCPU, PAGE_SIZE};
use crate::cpu::CpuId;
use crate::env::{EnvId, EnvStatus, Environment};
use crate::memory::{FaultCause, FrameStore, PageFlags};
use crate::sched::{Dispatch, Machine};
use crate::syscall::SysError;
use crate::trap::{FaultInfo, TrapContext};

/// Sizing of a [`System`].
#[derive(Debug, Clone, Copy)]
pub struct SystemConfig {
    /// Number of CPUs.
    pub ncpu: usize,
    /// Number of physical frames.
    pub frames: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            ncpu: NCPU,
            frames: 1024,
        }
    }
}

/// The environment-management core: table, scheduler and frame store.
pub struct System {
    /// The dispatch lock.
    pub(crate) machine: Mutex<Machine>,
    /// Physical frame pool.
    pub(crate) frames: Mutex<FrameStore>,
}

impl System {
    /// Create a system with the given sizing.
    pub fn new(config: SystemConfig) -> Self {
        System {
            machine: Mutex::new(Machine::new(config.ncpu)),
            frames: Mutex::new(FrameStore::new(config.frames)),
        }
    }

    /// Bootstrap creation of a fresh, immediately runnable
    /// environment with an empty address space.
    pub fn create_env(&self) -> Result<EnvId, SysError> {
        let mut machine = self.machine.lock();
        let id = machine.envs.alloc(None)?;
        machine.envs.set_status(id, EnvStatus::Runnable)?;
        Ok(id)
    }

    /// Run one scheduling pass for `cpu`: circular scan from the slot
    /// after the one this CPU last dispatched, re-dispatching its own
    /// still-running environment or halting when nothing is runnable.
    pub fn schedule(&self, cpu: CpuId) -> Dispatch {
        self.machine.lock().schedule(cpu)
    }

    /// Timer interrupt on `cpu`: save the interrupted context, demote
    /// the current environment to `Runnable` (or reclaim it if it is
    /// `Dying`), and reschedule.
    pub fn timer_interrupt(&self, cpu: CpuId, context: TrapContext) -> Dispatch {
        let mut machine = self.machine.lock();
        {
            let mut frames = self.frames.lock();
            machine.suspend_current(cpu, context, true, &mut frames);
        }
        machine.schedule(cpu)
    }

    /// Voluntary CPU relinquishment by the environment running on
    /// `cpu`. Same effect as a timer interrupt, minus the preemption.
    pub fn yield_cpu(&self, cpu: CpuId, context: TrapContext) -> Dispatch {
        let mut machine = self.machine.lock();
        {
            let mut frames = self.frames.lock();
            machine.suspend_current(cpu, context, true, &mut frames);
        }
        machine.schedule(cpu)
    }

    /// Trap that resumes the same environment: save the context and
    /// re-dispatch the current environment without advancing the
    /// round-robin position. Falls back to a full scheduling pass if
    /// the current environment went away (e.g. it was `Dying`).
    pub fn trap_return(&self, cpu: CpuId, context: TrapContext) -> Dispatch {
        let mut machine = self.machine.lock();
        {
            let mut frames = self.frames.lock();
            machine.suspend_current(cpu, context, false, &mut frames);
        }
        machine.schedule_current(cpu)
    }

    /// Read-only introspection of `env`'s own permission bits at `va`.
    pub fn page_perms(&self, env: EnvId, va: u64) -> Option<PageFlags> {
        let machine = self.machine.lock();
        let env = machine
            .envs
            .lookup(env)
            .unwrap_or_else(|_| panic!("introspection through stale identity {}", env));
        env.aspace.permissions(va)
    }

    /// All of `env`'s mappings in ascending address order, as
    /// `(page_va, flags)` pairs.
    pub fn mapped_pages(&self, env: EnvId) -> alloc::vec::Vec<(u64, PageFlags)> {
        let machine = self.machine.lock();
        let env = machine
            .envs
            .lookup(env)
            .unwrap_or_else(|_| panic!("introspection through stale identity {}", env));
        env.aspace
            .mapped_pages()
            .into_iter()
            .map(|(va, entry)| (va, entry.flags))
            .collect()
    }

    /// Perform a user-mode read through `env`'s mappings.
    ///
    /// Fails with the fault description at the first address where
    /// hardware would fault; earlier pages may already have been
    /// copied out.
    pub fn user_read(&self, env: EnvId, va: u64, buf: &mut [u8]) -> Result<(), FaultInfo> {
        self.user_access(env, va, buf.len(), false, |frames, entry, offset, len, pos| {
            buf[pos..pos + len].copy_from_slice(&frames.data(entry)[offset..offset + len]);
        })
    }

    /// Perform a user-mode write through `env`'s mappings.
    ///
    /// Fails with the fault description at the first address where
    /// hardware would fault; earlier pages may already have been
    /// written (hardware retires stores page by page the same way).
    pub fn user_write(&self, env: EnvId, va: u64, bytes: &[u8]) -> Result<(), FaultInfo> {
        self.user_access(env, va, bytes.len(), true, |frames, entry, offset, len, pos| {
            frames.data_mut(entry)[offset..offset + len].copy_from_slice(&bytes[pos..pos + len]);
        })
    }

    fn user_access(
        &self,
        env: EnvId,
        va: u64,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut FrameStore, crate::memory::FrameId, usize, usize, usize),
    ) -> Result<(), FaultInfo> {
        let mut pos = 0;
        while pos < len {
            let cur = va + pos as u64;
            let page = page_align_down(cur);
            let offset = (cur - page) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - pos);

            let machine = self.machine.lock();
            let descriptor = machine
                .envs
                .lookup(env)
                .unwrap_or_else(|_| panic!("user access through stale identity {}", env));

            let mut cause = if write {
                FaultCause::USER | FaultCause::WRITE
            } else {
                FaultCause::USER
            };
            let entry = match descriptor.aspace.lookup(page) {
                Some(entry) => {
                    cause |= FaultCause::PRESENT;
                    entry
                }
                None => return Err(FaultInfo { va: cur, cause }),
            };
            if !entry.flags.contains(PageFlags::USER_ACCESSIBLE)
                || (write && !entry.flags.contains(PageFlags::WRITABLE))
            {
                return Err(FaultInfo { va: cur, cause });
            }

            let mut frames = self.frames.lock();
            copy(&mut frames, entry.frame, offset, chunk, pos);
            drop(frames);
            drop(machine);
            pos += chunk;
        }
        Ok(())
    }

    /// Number of physical frames currently allocated.
    pub fn frames_allocated(&self) -> usize {
        self.frames.lock().allocated()
    }

    /// Kernel-side access to a descriptor under the dispatch lock.
    /// Panics on a stale identity; kernel code has no business keeping
    /// identities of dead environments.
    pub fn with_env<R>(&self, id: EnvId, f: impl FnOnce(&mut Environment) -> R) -> R {
        let mut machine = self.machine.lock();
        let env = machine
            .envs
            .lookup_mut(id)
            .unwrap_or_else(|_| panic!("kernel access to stale identity {}", id));
        f(env)
    }

    /// Status of `id`, or `Err(NotFound)` once it has been reclaimed.
    pub fn env_status(&self, id: EnvId) -> Result<EnvStatus, SysError> {
        let machine = self.machine.lock();
        machine.envs.lookup(id).map(|env| env.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> System {
        System::new(SystemConfig { ncpu: 2, frames: 8 })
    }

    fn user_rw() -> PageFlags {
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let sys = system();
        let env = sys.create_env().unwrap();
        sys.page_alloc(env, env, 0x1000, user_rw()).unwrap();

        sys.user_write(env, 0x1100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        sys.user_read(env, 0x1100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_access_spans_page_boundary() {
        let sys = system();
        let env = sys.create_env().unwrap();
        sys.page_alloc(env, env, 0x1000, user_rw()).unwrap();
        sys.page_alloc(env, env, 0x2000, user_rw()).unwrap();

        let data = [0xaau8; 64];
        sys.user_write(env, 0x2000 - 32, &data).unwrap();
        let mut buf = [0u8; 64];
        sys.user_read(env, 0x2000 - 32, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_write_to_unmapped_page_faults() {
        let sys = system();
        let env = sys.create_env().unwrap();
        let fault = sys.user_write(env, 0x5000, &[1]).unwrap_err();
        assert_eq!(fault.va, 0x5000);
        assert_eq!(fault.cause, FaultCause::USER | FaultCause::WRITE);
    }

    #[test]
    fn test_write_to_readonly_page_is_protection_fault() {
        let sys = system();
        let env = sys.create_env().unwrap();
        let cow = PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE | PageFlags::COPY_ON_WRITE;
        sys.page_alloc(env, env, 0x1000, cow).unwrap();

        let fault = sys.user_write(env, 0x1004, &[1]).unwrap_err();
        assert_eq!(fault.va, 0x1004);
        assert_eq!(
            fault.cause,
            FaultCause::USER | FaultCause::WRITE | FaultCause::PRESENT
        );
        // Reads of a copy-on-write page are unaffected.
        let mut buf = [1u8; 4];
        sys.user_read(env, 0x1004, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_shared_frame_is_visible_from_both_mappings() {
        let sys = system();
        let env = sys.create_env().unwrap();
        sys.page_alloc(env, env, 0x1000, user_rw()).unwrap();
        sys.page_map(env, env, 0x1000, env, 0x4000, user_rw()).unwrap();

        sys.user_write(env, 0x1010, &[7]).unwrap();
        let mut buf = [0u8];
        sys.user_read(env, 0x4010, &mut buf).unwrap();
        assert_eq!(buf, [7]);
    }

    #[test]
    fn test_timer_interrupt_rotates_between_envs() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let b = sys.create_env().unwrap();
        let cpu = CpuId(0);

        let first = match sys.schedule(cpu) {
            Dispatch::Run { env, context } => {
                assert_eq!(env, a);
                context
            }
            other => panic!("expected Run, got {:?}", other),
        };
        match sys.timer_interrupt(cpu, first) {
            Dispatch::Run { env, .. } => assert_eq!(env, b),
            other => panic!("expected Run, got {:?}", other),
        }
        assert_eq!(sys.env_status(a).unwrap(), EnvStatus::Runnable);
    }

    #[test]
    fn test_dying_env_reclaimed_at_next_trap() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let cpu = CpuId(0);
        let context = match sys.schedule(cpu) {
            Dispatch::Run { context, .. } => context,
            other => panic!("expected Run, got {:?}", other),
        };
        sys.env_destroy(a, a).unwrap();
        assert_eq!(sys.env_status(a).unwrap(), EnvStatus::Dying);

        // Next trap reclaims it; with the table empty the scheduler
        // drops into the monitor.
        assert_eq!(sys.timer_interrupt(cpu, context), Dispatch::Monitor);
        assert_eq!(sys.env_status(a).err(), Some(SysError::NotFound));
    }
}
