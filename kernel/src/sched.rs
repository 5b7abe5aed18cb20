//! Round-robin scheduler and halt path.
//!
//! All scheduling state — the environment table and the per-CPU
//! records — lives in one `Machine` value behind a single
//! `spin::Mutex`, the dispatch lock. A whole scan-and-dispatch pass
//! executes under one acquisition of that lock, so two CPUs can never
//! claim the same runnable environment.
//!
//! Dispatch does not return to the scheduler. It is modeled as an
//! explicit hand-off: a scheduling pass yields a [`Dispatch`] value
//! whose `Run` variant carries the chosen environment's saved
//! context for the execution loop to consume. Control re-enters the
//! core only through the trap paths on [`crate::System`], which
//! re-acquire the lock first.

use alloc::boxed::Box;

use crate::config::NENV;
use crate::cpu::{Cpu, CpuId, CpuStatus};
use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::memory::FrameStore;
use crate::trap::TrapContext;

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Transfer control to `env`, resuming at `context`. The
    /// environment has been marked `Running`; the caller must treat
    /// this as a one-way transfer, not a call.
    Run {
        /// Chosen environment.
        env: EnvId,
        /// Saved context to load into the CPU.
        context: TrapContext,
    },
    /// Nothing runnable: the CPU has been marked `Halted` and should
    /// enter its low-power wait until a timer interrupt.
    Halt,
    /// No environments exist at all. Terminal condition: the caller
    /// drops into the interactive debug monitor and never returns.
    Monitor,
}

/// All state guarded by the dispatch lock.
pub(crate) struct Machine {
    pub(crate) envs: EnvTable,
    pub(crate) cpus: Box<[Cpu]>,
}

impl Machine {
    pub(crate) fn new(ncpu: usize) -> Self {
        Machine {
            envs: EnvTable::new(),
            cpus: (0..ncpu).map(|_| Cpu::new()).collect(),
        }
    }

    /// Choose an environment for `cpu` and hand it off.
    ///
    /// Scans the table circularly starting just after the slot this
    /// CPU last dispatched, taking the first `Runnable` environment.
    /// An environment `Running` on another CPU is never chosen. If
    /// nothing is runnable but this CPU's current environment is still
    /// `Running`, it is re-dispatched; otherwise the halt path runs.
    pub(crate) fn schedule(&mut self, cpu: CpuId) -> Dispatch {
        let begin = match self.cpus[cpu.0].current {
            Some(id) => (id.slot() + 1) % NENV,
            None => 0,
        };

        let mut slot = begin;
        loop {
            if self.envs.slot(slot).status == EnvStatus::Runnable {
                let id = self.envs.slot(slot).id;
                return self.dispatch(cpu, id);
            }
            slot = (slot + 1) % NENV;
            if slot == begin {
                break;
            }
        }

        if let Some(id) = self.cpus[cpu.0].current {
            if let Ok(env) = self.envs.lookup(id) {
                if env.status == EnvStatus::Running && env.last_cpu == Some(cpu) {
                    return self.dispatch(cpu, id);
                }
            }
        }

        self.halt(cpu)
    }

    /// Mark `id` running on `cpu` and hand its context off.
    fn dispatch(&mut self, cpu: CpuId, id: EnvId) -> Dispatch {
        // A previous occupant of this CPU that never got around to
        // trapping stays runnable for other CPUs.
        if let Some(prev) = self.cpus[cpu.0].current {
            if prev != id {
                if let Ok(env) = self.envs.lookup_mut(prev) {
                    if env.status == EnvStatus::Running && env.last_cpu == Some(cpu) {
                        env.status = EnvStatus::Runnable;
                    }
                }
            }
        }

        let env = self
            .envs
            .lookup_mut(id)
            .unwrap_or_else(|_| panic!("dispatch of stale identity {}", id));
        match env.status {
            EnvStatus::Runnable => {}
            EnvStatus::Running if env.last_cpu == Some(cpu) => {}
            status => panic!("dispatch of {} in state {:?}", id, status),
        }
        env.status = EnvStatus::Running;
        env.last_cpu = Some(cpu);
        env.runs += 1;
        let context = env.context;

        self.cpus[cpu.0].status = CpuStatus::Started;
        self.cpus[cpu.0].current = Some(id);
        log::debug!("{}: dispatching {} (run {})", cpu, id, env.runs);

        Dispatch::Run { env: id, context }
    }

    /// Halt path, reached with the dispatch lock held and nothing to
    /// dispatch.
    fn halt(&mut self, cpu: CpuId) -> Dispatch {
        if self.envs.iter().all(|env| env.status == EnvStatus::Free) {
            log::warn!("no runnable environments in the system");
            return Dispatch::Monitor;
        }

        // Mark HALTED before the lock is released (on guard drop in
        // the caller), so a timer interrupt cannot observe a stale
        // Started status on a CPU that is about to sleep.
        self.cpus[cpu.0].current = None;
        self.cpus[cpu.0].status = CpuStatus::Halted;
        log::debug!("{}: halting", cpu);
        Dispatch::Halt
    }

    /// Resume this CPU's current environment without advancing the
    /// round-robin position, falling back to a full pass if the CPU
    /// has no current environment anymore.
    pub(crate) fn schedule_current(&mut self, cpu: CpuId) -> Dispatch {
        match self.cpus[cpu.0].current {
            Some(id) => self.dispatch(cpu, id),
            None => self.schedule(cpu),
        }
    }

    /// Common trap-entry bookkeeping: wake the CPU, save the trapped
    /// context into the current descriptor, optionally demote it from
    /// `Running` to `Runnable`, and reclaim it if it is `Dying`.
    pub(crate) fn suspend_current(
        &mut self,
        cpu: CpuId,
        context: TrapContext,
        demote: bool,
        frames: &mut FrameStore,
    ) {
        self.cpus[cpu.0].status = CpuStatus::Started;
        let Some(id) = self.cpus[cpu.0].current else {
            return;
        };
        let dying = match self.envs.lookup_mut(id) {
            Ok(env) if env.status == EnvStatus::Running && env.last_cpu == Some(cpu) => {
                env.context = context;
                if demote {
                    env.status = EnvStatus::Runnable;
                }
                return;
            }
            Ok(env) => env.status == EnvStatus::Dying,
            Err(_) => false,
        };
        if dying {
            log::debug!("{}: reclaiming dying environment {}", cpu, id);
            self.envs.free(id, frames);
        }
        // The environment went away while we were out of the kernel;
        // forget it.
        self.cpus[cpu.0].current = None;
    }
}
