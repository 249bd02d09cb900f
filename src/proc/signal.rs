//! Signal generation and delivery.
//!
//! Each task holds a pending bitset and a mask. Sending a signal is a
//! pure bitset write plus a wakeup, so senders may run from any context
//! including the PTY teardown path. Delivery happens on the way back to
//! user mode: the lowest unmasked pending signal is taken, and either
//! dropped, applied as the default action, or pushed as a handler frame
//! on the user stack.

use zerocopy::AsBytes;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    proc::{Chan, Pid, TaskState, UserRegs},
};

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGWINCH: u32 = 28;

/// Where the arch layer maps the sigreturn trampoline.
pub const SIGRETURN_TRAMPOLINE: u32 = 0xffff_e000;

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

const fn sigbit(sig: u32) -> u32 {
    1 << (sig - 1)
}

/// Signals that can be neither caught, masked nor ignored.
const UNBLOCKABLE: u32 = sigbit(SIGKILL) | sigbit(SIGSTOP);

const STOP_SIGNALS: u32 =
    sigbit(SIGSTOP) | sigbit(SIGTSTP) | sigbit(SIGTTIN) | sigbit(SIGTTOU);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    Handler(u32),
}

bitflags::bitflags! {
    pub struct SigFlags: u32 {
        const NODEFER = 0x4000_0000;
        const RESTART = 0x1000_0000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: u32,
    pub flags: SigFlags,
    pub restorer: u32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SigHandler::Default,
            mask: 0,
            flags: SigFlags::empty(),
            restorer: 0,
        }
    }
}

/// Handler frame pushed on the user stack; `sigreturn` pops it.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, zerocopy::FromBytes)]
pub struct SigFrame {
    /// Return address: the sigreturn trampoline.
    pub ret: u32,
    /// Handler argument.
    pub signum: u32,
    /// Mask to restore.
    pub saved_mask: u32,
    /// Register state to restore verbatim.
    pub saved_regs: UserRegs,
}

impl Kernel {
    fn deliver_to(&self, pid: Pid, sig: u32) -> Result<()> {
        if sig == 0 || sig as usize > crate::param::NSIG {
            return Err(KernelError::InvalidArg);
        }
        let mut inner = self.procs.inner.lock();
        let task = inner.task_mut(pid).ok_or(KernelError::NoProcess)?;

        task.sigpend |= sigbit(sig);

        // A continue signal restarts a stopped task by itself.
        if sig == SIGCONT && task.state == TaskState::STOPPED {
            task.sigpend &= !STOP_SIGNALS;
            task.state = TaskState::RUNNING;
        }

        // Wake a sleeper so it can notice the signal at its suspension
        // point, unless the signal is masked.
        if task.sigmask & sigbit(sig) == 0 && task.state == TaskState::SLEEPING {
            task.state = TaskState::RUNNING;
        }
        Ok(())
    }

    /// Send a signal to one task. Signal 0 only probes for existence.
    pub fn task_signal(&self, pid: Pid, sig: u32) -> Result<()> {
        if sig == 0 {
            return if self.procs.exists(pid) {
                Ok(())
            } else {
                Err(KernelError::NoProcess)
            };
        }
        self.deliver_to(pid, sig)
    }

    /// Send a signal to every task in a process group.
    pub fn task_signal_group(&self, pgid: Pid, sig: u32) -> Result<()> {
        let targets: alloc::vec::Vec<Pid> = {
            let inner = self.procs.inner.lock();
            inner
                .order()
                .iter()
                .copied()
                .filter(|pid| inner.task(*pid).map(|t| t.pgid) == Some(pgid))
                .collect()
        };
        for pid in targets {
            let _ = self.task_signal(pid, sig);
        }
        Ok(())
    }

    /// Send a signal to every task except the init process and the idle
    /// task.
    pub fn task_signal_all(&self, sig: u32) -> Result<()> {
        let targets: alloc::vec::Vec<Pid> = {
            let inner = self.procs.inner.lock();
            inner.order().iter().copied().filter(|p| *p > 1).collect()
        };
        for pid in targets {
            let _ = self.task_signal(pid, sig);
        }
        Ok(())
    }

    /// Deliver one pending signal to the current task, called before the
    /// return to user mode. `regs` is the saved trap frame.
    pub fn do_signal(&self, regs: &mut UserRegs) {
        let (sig, action, parent, orig_eax) = {
            let mut inner = self.procs.inner.lock();
            let pid = inner.current();
            let task = match inner.task_mut(pid) {
                Some(t) => t,
                None => return,
            };
            let pending = task.sigpend & !task.sigmask;
            if pending == 0 {
                return;
            }
            let sig = pending.trailing_zeros() + 1;
            task.sigpend &= !sigbit(sig);
            let action = task.sig.actions[(sig - 1) as usize];
            (sig, action, task.parent, task.orig_eax)
        };

        let handler = if sig == SIGKILL || sig == SIGSTOP {
            SigHandler::Default
        } else {
            action.handler
        };

        match handler {
            SigHandler::Ignore => {}
            SigHandler::Default => match sig {
                SIGCHLD | SIGCONT | SIGWINCH => {}
                SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
                    self.procs.with_current(|t| t.state = TaskState::STOPPED);
                    self.task_wakeup(Chan::Child(parent));
                    self.schedule();
                }
                _ => self.do_exit(sig as i32),
            },
            SigHandler::Handler(entry) => {
                // A restartable interrupted syscall resumes after the
                // handler: rewind over the int $0x80 and re-arm eax.
                if action.flags.contains(SigFlags::RESTART)
                    && regs.eax == KernelError::Interrupted.to_ret() as u32
                {
                    regs.eax = orig_eax;
                    regs.eip = regs.eip.wrapping_sub(2);
                }

                let saved_mask = self.procs.with_current(|t| {
                    let saved = t.sigmask;
                    t.sigmask |= action.mask & !UNBLOCKABLE;
                    if !action.flags.contains(SigFlags::NODEFER) {
                        t.sigmask |= sigbit(sig) & !UNBLOCKABLE;
                    }
                    saved
                });

                let frame = SigFrame {
                    ret: if action.restorer != 0 {
                        action.restorer
                    } else {
                        SIGRETURN_TRAMPOLINE
                    },
                    signum: sig,
                    saved_mask,
                    saved_regs: *regs,
                };
                let sp = (regs.esp - core::mem::size_of::<SigFrame>() as u32) & !3;
                let pushed = self
                    .procs
                    .with_current(|t| t.mm.copy_out(sp, frame.as_bytes()));
                if pushed.is_err() {
                    // No stack to deliver on: fatal, like a bad stack at
                    // hardware fault time.
                    self.do_exit(SIGSEGV as i32);
                    return;
                }
                regs.esp = sp;
                regs.eip = entry;
            }
        }
    }

    /// Restore the frame pushed by `do_signal`. On entry, the trampoline
    /// has popped the return address, so the frame begins one word below
    /// the current stack pointer.
    pub fn sys_sigreturn(&self, regs: &mut UserRegs) -> Result<i32> {
        let frame_addr = regs.esp - 4;
        let mut frame = SigFrame {
            ret: 0,
            signum: 0,
            saved_mask: 0,
            saved_regs: UserRegs::default(),
        };
        self.procs
            .with_current(|t| t.mm.copy_in(frame_addr, frame.as_bytes_mut()))?;
        self.procs
            .with_current(|t| t.sigmask = frame.saved_mask & !UNBLOCKABLE);
        *regs = frame.saved_regs;
        Ok(regs.eax as i32)
    }

    /// Install a new disposition, returning the old one.
    pub fn sys_sigaction(&self, sig: u32, action: Option<SigAction>) -> Result<SigAction> {
        if sig == 0 || sig as usize > crate::param::NSIG || sig == SIGKILL || sig == SIGSTOP {
            return Err(KernelError::InvalidArg);
        }
        self.procs.with_current(|t| {
            let old = t.sig.actions[(sig - 1) as usize];
            if let Some(act) = action {
                t.sig.actions[(sig - 1) as usize] = act;
            }
            Ok(old)
        })
    }

    /// Adjust the signal mask, returning the old mask.
    pub fn sys_sigprocmask(&self, how: i32, set: Option<u32>) -> Result<u32> {
        self.procs.with_current(|t| {
            let old = t.sigmask;
            if let Some(set) = set {
                let set = set & !UNBLOCKABLE;
                match how {
                    SIG_BLOCK => t.sigmask |= set,
                    SIG_UNBLOCK => t.sigmask &= !set,
                    SIG_SETMASK => t.sigmask = set,
                    _ => return Err(KernelError::InvalidArg),
                }
            }
            Ok(old)
        })
    }

    /// Kill syscall: pid > 0 targets one task, pid < -1 a process group,
    /// -1 everything signalable.
    pub fn sys_kill(&self, pid: Pid, sig: u32) -> Result<i32> {
        match pid {
            p if p > 0 => self.task_signal(p, sig)?,
            -1 => self.task_signal_all(sig)?,
            p if p < -1 => self.task_signal_group(-p, sig)?,
            _ => {
                let pgid = self.procs.with_current(|t| t.pgid);
                self.task_signal_group(pgid, sig)?;
            }
        }
        Ok(0)
    }
}
