//! The process handle.
//!
//! [`Process`] carries the one piece of ambient state a user program
//! needs: its own identity. It is threaded explicitly rather than kept
//! in a process-global, and refreshed once when a fork child starts
//! via [`Process::attach`].
//!
//! Memory accessors on the handle model the hardware fault-and-retry
//! loop: an access that faults delivers the fault to the installed
//! upcall handler and then retries the access. An unhandled fault
//! aborts the process.

use alloc::sync::Arc;

use chalk_kernel::syscall::SysError;
use chalk_kernel::{EnvId, FaultInfo, PageFlags, System};

/// A page-fault upcall handler, running in the faulting process.
pub type FaultHandler = fn(&mut Process, &FaultInfo);

/// Handle a user program holds on itself.
pub struct Process {
    sys: Arc<System>,
    env: EnvId,
    pub(crate) fault_handler: Option<FaultHandler>,
}

impl Process {
    /// Wrap an existing environment. Used when bootstrapping the
    /// first process of a system.
    pub fn new(sys: Arc<System>, env: EnvId) -> Self {
        Process {
            sys,
            env,
            fault_handler: None,
        }
    }

    /// Child-entry continuation of fork: build the handle for a
    /// freshly created environment, asking the kernel who we are
    /// instead of trusting any cached identity.
    pub fn attach(sys: Arc<System>, env: EnvId) -> Result<Self, SysError> {
        let env = sys.getenvid(env)?;
        Ok(Process {
            sys,
            env,
            fault_handler: None,
        })
    }

    /// This process's identity.
    pub fn id(&self) -> EnvId {
        self.env
    }

    /// The system this process runs on.
    pub fn system(&self) -> &Arc<System> {
        &self.sys
    }

    /// Permission bits of our own mapping at `va`, if any.
    pub fn permissions(&self, va: u64) -> Option<PageFlags> {
        self.sys.page_perms(self.env, va)
    }

    /// Read from our address space, faulting and retrying as hardware
    /// would.
    pub fn read(&mut self, va: u64, buf: &mut [u8]) {
        loop {
            match self.sys.user_read(self.env, va, buf) {
                Ok(()) => return,
                Err(fault) => self.deliver_fault(fault),
            }
        }
    }

    /// Write to our address space, faulting and retrying as hardware
    /// would.
    pub fn write(&mut self, va: u64, bytes: &[u8]) {
        loop {
            match self.sys.user_write(self.env, va, bytes) {
                Ok(()) => return,
                Err(fault) => self.deliver_fault(fault),
            }
        }
    }

    /// Convenience single-byte read.
    pub fn read_u8(&mut self, va: u64) -> u8 {
        let mut buf = [0u8];
        self.read(va, &mut buf);
        buf[0]
    }

    /// Convenience single-byte write.
    pub fn write_u8(&mut self, va: u64, byte: u8) {
        self.write(va, &[byte]);
    }

    /// Hand a fault to the installed upcall handler. A process with
    /// no handler cannot make progress past the fault.
    fn deliver_fault(&mut self, fault: FaultInfo) {
        let Some(handler) = self.fault_handler else {
            panic!(
                "{}: unhandled page fault at {:#x} (cause {:?})",
                self.env, fault.va, fault.cause
            );
        };
        log::debug!(
            "{}: page fault at {:#x} (cause {:?}), entering upcall",
            self.env,
            fault.va,
            fault.cause
        );
        handler(self, &fault);
    }
}
