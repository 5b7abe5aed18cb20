//! Request primitives.
//!
//! The narrow interface user-level code calls into: duplicate-self,
//! page mapping requests, status and upcall installation. Every
//! primitive takes the caller's identity explicitly and serializes on
//! the dispatch lock. A caller may target itself or an environment it
//! created; anything else is refused.

use crate::config::{is_page_aligned, USER_TOP};
use crate::env::{EnvId, EnvStatus, EnvTable, Environment};
use crate::memory::{PageEntry, PageFlags};
use crate::system::System;

/// Typed failure of a request primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Identity does not resolve: free slot, or stale generation.
    NotFound,
    /// Caller is neither the target nor its creator.
    PermissionDenied,
    /// Malformed request.
    InvalidArgument(&'static str),
    /// Physical memory exhausted.
    OutOfMemory,
    /// No free slot in the environment table.
    NoFreeEnv,
}

impl core::fmt::Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NotFound => write!(f, "no such environment"),
            SysError::PermissionDenied => write!(f, "permission denied"),
            SysError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            SysError::OutOfMemory => write!(f, "out of memory"),
            SysError::NoFreeEnv => write!(f, "environment table full"),
        }
    }
}

/// Resolve `target` on behalf of `caller`, checking both liveness and
/// the caller's right to operate on it.
fn checked_target<'t>(
    envs: &'t mut EnvTable,
    caller: EnvId,
    target: EnvId,
) -> Result<&'t mut Environment, SysError> {
    envs.lookup(caller)?;
    let env = envs.lookup_mut(target)?;
    if env.id == caller || env.parent == Some(caller) {
        Ok(env)
    } else {
        Err(SysError::PermissionDenied)
    }
}

/// Validate a user-supplied virtual address.
fn checked_va(va: u64) -> Result<u64, SysError> {
    if !is_page_aligned(va) {
        return Err(SysError::InvalidArgument("address not page-aligned"));
    }
    if va >= USER_TOP {
        return Err(SysError::InvalidArgument("address above user top"));
    }
    Ok(va)
}

/// Validate user-supplied permission bits for a mapping request.
fn checked_flags(flags: PageFlags) -> Result<PageFlags, SysError> {
    if !flags.contains(PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE) {
        return Err(SysError::InvalidArgument("mapping must be present and user"));
    }
    if !PageFlags::SHARE_MASK.contains(flags) {
        return Err(SysError::InvalidArgument("permission bits outside share mask"));
    }
    if flags.contains(PageFlags::WRITABLE | PageFlags::COPY_ON_WRITE) {
        return Err(SysError::InvalidArgument("writable copy-on-write mapping"));
    }
    Ok(flags)
}

impl System {
    /// Current identity of the caller. Used by a fresh fork child to
    /// refresh its cached "who am I".
    pub fn getenvid(&self, caller: EnvId) -> Result<EnvId, SysError> {
        let machine = self.machine.lock();
        machine.envs.lookup(caller).map(|env| env.id)
    }

    /// Duplicate-self: create a new environment whose saved register
    /// state is a copy of the caller's, with the return-value slot
    /// zeroed. The child starts `NotRunnable` with an empty address
    /// space; the caller must populate and release it.
    pub fn exofork(&self, caller: EnvId) -> Result<EnvId, SysError> {
        let mut machine = self.machine.lock();
        let context = machine.envs.lookup(caller)?.context;
        let child = machine.envs.alloc(Some(caller))?;
        let env = machine.envs.slot_mut(child.slot());
        env.context = context;
        env.context.set_return_value(0);
        log::debug!("{} forked child {}", caller, child);
        Ok(child)
    }

    /// Allocate a fresh zeroed frame and map it into `target` at `va`.
    /// Any previous mapping at `va` is replaced.
    pub fn page_alloc(
        &self,
        caller: EnvId,
        target: EnvId,
        va: u64,
        flags: PageFlags,
    ) -> Result<(), SysError> {
        let va = checked_va(va)?;
        let flags = checked_flags(flags)?;
        let mut machine = self.machine.lock();
        let env = checked_target(&mut machine.envs, caller, target)?;
        let mut frames = self.frames.lock();
        let frame = frames.alloc()?;
        if let Some(old) = env.aspace.insert(va, PageEntry { frame, flags }) {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Map the frame backing `src`'s page at `src_va` into `dst` at
    /// `dst_va` with `flags`. A writable grant requires the source
    /// mapping itself to be writable. Replaces any previous mapping at
    /// `dst_va` in one step.
    pub fn page_map(
        &self,
        caller: EnvId,
        src: EnvId,
        src_va: u64,
        dst: EnvId,
        dst_va: u64,
        flags: PageFlags,
    ) -> Result<(), SysError> {
        let src_va = checked_va(src_va)?;
        let dst_va = checked_va(dst_va)?;
        let flags = checked_flags(flags)?;
        let mut machine = self.machine.lock();

        let entry = checked_target(&mut machine.envs, caller, src)?
            .aspace
            .lookup(src_va)
            .ok_or(SysError::InvalidArgument("source page not mapped"))?;
        if flags.contains(PageFlags::WRITABLE) && !entry.flags.contains(PageFlags::WRITABLE) {
            return Err(SysError::InvalidArgument(
                "writable grant from read-only mapping",
            ));
        }

        let env = checked_target(&mut machine.envs, caller, dst)?;
        let mut frames = self.frames.lock();
        frames.incref(entry.frame);
        if let Some(old) = env.aspace.insert(dst_va, PageEntry { frame: entry.frame, flags }) {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Remove the mapping at `va` in `target`, if any.
    pub fn page_unmap(&self, caller: EnvId, target: EnvId, va: u64) -> Result<(), SysError> {
        let va = checked_va(va)?;
        let mut machine = self.machine.lock();
        let env = checked_target(&mut machine.envs, caller, target)?;
        if let Some(old) = env.aspace.remove(va) {
            self.frames.lock().decref(old.frame);
        }
        Ok(())
    }

    /// Set `target`'s status. Only the `Runnable`/`NotRunnable`
    /// transition pair is available to user code.
    pub fn set_status(
        &self,
        caller: EnvId,
        target: EnvId,
        status: EnvStatus,
    ) -> Result<(), SysError> {
        if status != EnvStatus::Runnable && status != EnvStatus::NotRunnable {
            return Err(SysError::InvalidArgument("status not settable from user code"));
        }
        let mut machine = self.machine.lock();
        checked_target(&mut machine.envs, caller, target)?.status = status;
        Ok(())
    }

    /// Install `target`'s page-fault upcall entry point.
    pub fn set_fault_upcall(
        &self,
        caller: EnvId,
        target: EnvId,
        entry: u64,
    ) -> Result<(), SysError> {
        let mut machine = self.machine.lock();
        checked_target(&mut machine.envs, caller, target)?.fault_upcall = Some(entry);
        Ok(())
    }

    /// Destroy `target`. An environment currently dispatched on a CPU
    /// is marked `Dying` and reclaimed at its next trap; anything else
    /// is reclaimed immediately.
    pub fn env_destroy(&self, caller: EnvId, target: EnvId) -> Result<(), SysError> {
        let mut machine = self.machine.lock();
        let env = checked_target(&mut machine.envs, caller, target)?;
        let id = env.id;
        if env.status == EnvStatus::Running {
            env.status = EnvStatus::Dying;
            log::debug!("{} marked dying", id);
        } else {
            let mut frames = self.frames.lock();
            machine.envs.free(id, &mut frames);
            log::debug!("{} destroyed", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemConfig;

    fn system() -> System {
        System::new(SystemConfig {
            ncpu: 1,
            frames: 16,
        })
    }

    fn user_rw() -> PageFlags {
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE
    }

    #[test]
    fn test_exofork_copies_context_with_zero_retval() {
        let sys = system();
        let parent = sys.create_env().unwrap();
        sys.with_env(parent, |env| {
            env.context.pc = 0x8000;
            env.context.set_return_value(99);
        });

        let child = sys.exofork(parent).unwrap();
        assert_ne!(child, parent);
        let (pc, retval, status) =
            sys.with_env(child, |env| (env.context.pc, env.context.retval, env.status));
        assert_eq!(pc, 0x8000);
        assert_eq!(retval, 0);
        assert_eq!(status, EnvStatus::NotRunnable);
    }

    #[test]
    fn test_page_alloc_validates_arguments() {
        let sys = system();
        let env = sys.create_env().unwrap();
        assert_eq!(
            sys.page_alloc(env, env, 0x1001, user_rw()).err(),
            Some(SysError::InvalidArgument("address not page-aligned"))
        );
        assert_eq!(
            sys.page_alloc(env, env, USER_TOP, user_rw()).err(),
            Some(SysError::InvalidArgument("address above user top"))
        );
        assert_eq!(
            sys.page_alloc(env, env, 0x1000, PageFlags::PRESENT).err(),
            Some(SysError::InvalidArgument("mapping must be present and user"))
        );
        assert!(sys.page_alloc(env, env, 0x1000, user_rw()).is_ok());
    }

    #[test]
    fn test_page_map_refuses_writable_from_readonly() {
        let sys = system();
        let env = sys.create_env().unwrap();
        let ro = PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE;
        sys.page_alloc(env, env, 0x1000, ro).unwrap();
        assert_eq!(
            sys.page_map(env, env, 0x1000, env, 0x2000, user_rw()).err(),
            Some(SysError::InvalidArgument("writable grant from read-only mapping"))
        );
        assert!(sys.page_map(env, env, 0x1000, env, 0x2000, ro).is_ok());
    }

    #[test]
    fn test_page_map_shares_one_frame() {
        let sys = system();
        let env = sys.create_env().unwrap();
        sys.page_alloc(env, env, 0x1000, user_rw()).unwrap();
        assert_eq!(sys.frames_allocated(), 1);
        sys.page_map(env, env, 0x1000, env, 0x3000, user_rw()).unwrap();
        assert_eq!(sys.frames_allocated(), 1);

        sys.page_unmap(env, env, 0x1000).unwrap();
        assert_eq!(sys.frames_allocated(), 1);
        sys.page_unmap(env, env, 0x3000).unwrap();
        assert_eq!(sys.frames_allocated(), 0);
    }

    #[test]
    fn test_target_permission_check() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let b = sys.create_env().unwrap();
        // b was not created by a.
        assert_eq!(
            sys.page_alloc(a, b, 0x1000, user_rw()).err(),
            Some(SysError::PermissionDenied)
        );
        // A child is fair game for its parent.
        let child = sys.exofork(a).unwrap();
        assert!(sys.page_alloc(a, child, 0x1000, user_rw()).is_ok());
    }

    #[test]
    fn test_stale_target_reports_not_found() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let child = sys.exofork(a).unwrap();
        sys.env_destroy(a, child).unwrap();
        assert_eq!(
            sys.page_alloc(a, child, 0x1000, user_rw()).err(),
            Some(SysError::NotFound)
        );
    }

    #[test]
    fn test_set_status_restricted() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let child = sys.exofork(a).unwrap();
        assert_eq!(
            sys.set_status(a, child, EnvStatus::Running).err(),
            Some(SysError::InvalidArgument("status not settable from user code"))
        );
        assert!(sys.set_status(a, child, EnvStatus::Runnable).is_ok());
    }

    #[test]
    fn test_destroy_releases_frames() {
        let sys = system();
        let a = sys.create_env().unwrap();
        let child = sys.exofork(a).unwrap();
        sys.page_alloc(a, child, 0x1000, user_rw()).unwrap();
        sys.page_alloc(a, child, 0x2000, user_rw()).unwrap();
        assert_eq!(sys.frames_allocated(), 2);
        sys.env_destroy(a, child).unwrap();
        assert_eq!(sys.frames_allocated(), 0);
    }
}
