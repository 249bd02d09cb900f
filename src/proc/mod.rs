//! Tasks and the ambient task table.
//!
//! A task is the unit of scheduling. Exactly one task is current at any
//! time; the rest sit on the run order list in one of the lifecycle
//! states. Per-task resources (mm, fs, files, sig) are owned by the
//! task and cloned with the reference-raising discipline at fork.

use alloc::boxed::Box;

use array_macro::array;
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::{KernelError, Result},
    file::FileId,
    fs::IRef,
    param::{NPROC, NR_OPEN, NSIG, TASK_NAME_LEN},
    proc::signal::SigAction,
    vm::Mm,
};

pub mod sched;
pub mod signal;
pub mod task;
pub mod timer;

pub type Pid = i32;

/// Task lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// On the run queue.
    RUNNING,
    /// Waiting on a channel or timer.
    SLEEPING,
    /// Stopped until SIGCONT.
    STOPPED,
    /// Exited, awaiting reap by the parent.
    ZOMBIE,
    /// To be destroyed by the scheduler.
    TERMINATED,
}

/// Sleep channels. The C kernel sleeps on resource addresses; the typed
/// rendition names the resource instead, with identical matching rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Chan {
    /// A child of the named parent changed state.
    Child(Pid),
    /// Bytes became readable in a pipe inode slot.
    PipeRead(usize),
    /// Space became available in a pipe inode slot.
    PipeWrite(usize),
    /// A cooked byte arrived on the tty.
    TtyRead(usize),
    /// The tty write queue drained.
    TtyWrite(usize),
    /// A console activation completed.
    VtActivate,
    /// Plain timed or indefinite sleep of one task.
    Sleep(Pid),
    /// Activity on a socket slot.
    Socket(usize),
    /// Generic inode event.
    Inode(usize),
}

/// Saved user-mode register state, in the order the trap stub pushes it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct UserRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
}

/// Working directory, root and creation mask.
pub struct FsInfo {
    pub cwd: Option<IRef>,
    pub root: Option<IRef>,
    pub umask: u16,
}

impl FsInfo {
    pub fn new() -> Self {
        Self {
            cwd: None,
            root: None,
            umask: 0o022,
        }
    }
}

/// Open file descriptors plus the close-on-exec bitmask.
pub struct FilesInfo {
    pub fds: [Option<FileId>; NR_OPEN],
    pub close_on_exec: u32,
}

impl FilesInfo {
    pub fn new() -> Self {
        Self {
            fds: array![_ => None; NR_OPEN],
            close_on_exec: 0,
        }
    }

    /// Lowest unused descriptor slot.
    pub fn alloc_fd(&self) -> Result<usize> {
        self.fds
            .iter()
            .position(|f| f.is_none())
            .ok_or(KernelError::TooManyOpen)
    }

    pub fn get(&self, fd: i32) -> Result<FileId> {
        if fd < 0 || fd as usize >= NR_OPEN {
            return Err(KernelError::BadFd);
        }
        self.fds[fd as usize].ok_or(KernelError::BadFd)
    }
}

/// Signal dispositions, shared on clone.
pub struct SigInfo {
    pub actions: [SigAction; NSIG],
}

impl SigInfo {
    pub fn new() -> Self {
        Self {
            actions: [SigAction::default(); NSIG],
        }
    }
}

pub struct Task {
    pub pid: Pid,
    pub pgid: Pid,
    pub parent: Pid,
    pub state: TaskState,
    pub name: [u8; TASK_NAME_LEN],

    /// Top of the kernel stack, handed to the TSS on switch.
    pub kernel_stack: u32,
    /// Saved kernel stack pointer for the context switch.
    pub esp: u32,
    pub user_regs: UserRegs,
    pub exit_code: i32,

    /// Set while sleeping; wakeups match on it.
    pub chan: Option<Chan>,
    /// Jiffy deadline for timed sleeps, 0 when unarmed.
    pub timeout: u64,

    pub sigpend: u32,
    pub sigmask: u32,
    pub sig: Box<SigInfo>,
    pub mm: Box<Mm>,
    pub fs: Box<FsInfo>,
    pub files: Box<FilesInfo>,

    /// Controlling tty index.
    pub tty: Option<usize>,
    /// Interval timer event, if armed.
    pub itimer: Option<u64>,
    /// Syscall number saved at trap entry, for restart after a signal.
    pub orig_eax: u32,

    pub uid: u16,
    pub euid: u16,
    pub gid: u16,
    pub egid: u16,

    pub utime: u64,
    pub stime: u64,
    pub start_time: u64,
}

impl Task {
    pub fn signal_pending(&self) -> bool {
        self.sigpend & !self.sigmask != 0
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(TASK_NAME_LEN - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n..].fill(0);
    }
}

pub struct ProcsInner {
    slots: [Option<Box<Task>>; NPROC],
    /// Round-robin order; tasks keep their position for life.
    order: [Pid; NPROC],
    nr_order: usize,
    current: Pid,
    next_pid: Pid,
}

/// The ambient task table.
pub struct Procs {
    pub inner: Mutex<ProcsInner>,
}

impl Procs {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProcsInner {
                slots: array![_ => None; NPROC],
                order: [0; NPROC],
                nr_order: 0,
                current: 0,
                next_pid: 0,
            }),
        }
    }

    pub fn current(&self) -> Pid {
        self.inner.lock().current
    }

    pub fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(pid).ok_or(KernelError::NoProcess)?;
        Ok(f(task))
    }

    pub fn with_current<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut inner = self.inner.lock();
        let pid = inner.current;
        let task = inner.task_mut(pid).expect("current task missing");
        f(task)
    }

    /// Find a pid without touching the task.
    pub fn exists(&self, pid: Pid) -> bool {
        self.inner.lock().task_mut(pid).is_some()
    }
}

impl ProcsInner {
    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|t| t.pid == pid)
            .map(|t| &mut **t)
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .find(|t| t.pid == pid)
            .map(|t| &**t)
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    pub fn next_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Insert a task into a free slot and append it to the run order.
    pub fn insert(&mut self, task: Box<Task>) -> Result<()> {
        if self.nr_order >= NPROC {
            return Err(KernelError::NoMemory);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(KernelError::NoMemory)?;
        self.order[self.nr_order] = task.pid;
        self.nr_order += 1;
        *slot = Some(task);
        Ok(())
    }

    /// Drop a task slot entirely (reap or abort paths).
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Task>> {
        let pos = self.order[..self.nr_order].iter().position(|p| *p == pid)?;
        self.order.copy_within(pos + 1..self.nr_order, pos);
        self.nr_order -= 1;
        self.slots
            .iter_mut()
            .find(|s| s.as_ref().map_or(false, |t| t.pid == pid))?
            .take()
    }

    pub fn order(&self) -> &[Pid] {
        &self.order[..self.nr_order]
    }
}
