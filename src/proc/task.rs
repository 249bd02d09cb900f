//! Task creation, fork, exit and wait.

use alloc::boxed::Box;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    param::{NR_OPEN, TASK_NAME_LEN},
    proc::{
        signal::SIGCHLD, Chan, FilesInfo, FsInfo, Pid, SigInfo, Task, TaskState, UserRegs,
    },
    vm::Mm,
};

/// Options for `wait4`.
pub const WNOHANG: i32 = 1;
/// Also report stopped children.
pub const WUNTRACED: i32 = 2;

impl Kernel {
    fn new_task(&self, parent: Option<&Task>, pid: Pid) -> Box<Task> {
        let pgd = self.alloc_pgd();
        let mut task = Box::new(Task {
            pid,
            pgid: parent.map_or(pid, |p| p.pgid),
            parent: parent.map_or(0, |p| p.pid),
            state: TaskState::RUNNING,
            name: [0; TASK_NAME_LEN],
            kernel_stack: 0,
            esp: 0,
            user_regs: UserRegs::default(),
            exit_code: 0,
            chan: None,
            timeout: 0,
            sigpend: 0,
            sigmask: parent.map_or(0, |p| p.sigmask),
            sig: Box::new(SigInfo::new()),
            mm: Box::new(Mm::new(pgd)),
            fs: Box::new(FsInfo::new()),
            files: Box::new(FilesInfo::new()),
            tty: parent.and_then(|p| p.tty),
            itimer: None,
            orig_eax: 0,
            uid: parent.map_or(0, |p| p.uid),
            euid: parent.map_or(0, |p| p.euid),
            gid: parent.map_or(0, |p| p.gid),
            egid: parent.map_or(0, |p| p.egid),
            utime: 0,
            stime: 0,
            start_time: self.jiffies(),
        });
        if let Some(p) = parent {
            task.name = p.name;
        }
        task
    }

    /// Create the kernel idle task (pid 0) and make it current. Called
    /// once at boot before anything can sleep.
    pub fn task_bootstrap(&self) {
        let mut inner = self.procs.inner.lock();
        let pid = inner.next_pid();
        drop(inner);
        let mut task = self.new_task(None, pid);
        task.set_name(b"idle");
        let mut inner = self.procs.inner.lock();
        inner.insert(task).expect("task_bootstrap");
        inner.set_current(pid);
    }

    /// Create a fresh user task with empty address space, child of the
    /// current task. The boot path uses this for init (pid 1).
    pub fn task_create_user(&self, name: &[u8]) -> Result<Pid> {
        let (pid, mut task) = {
            let mut inner = self.procs.inner.lock();
            let pid = inner.next_pid();
            let cur = inner.current();
            let task = match inner.task(cur) {
                Some(parent) => {
                    let mut t = self.new_task(Some(parent), pid);
                    t.fs.umask = parent.fs.umask;
                    t.fs.cwd = parent.fs.cwd;
                    t.fs.root = parent.fs.root;
                    t
                }
                None => self.new_task(None, pid),
            };
            (pid, task)
        };
        task.set_name(name);
        // The spawned task holds its own directory references.
        if let Some(cwd) = task.fs.cwd {
            self.idup(cwd);
        }
        if let Some(root) = task.fs.root {
            self.idup(root);
        }
        self.procs.inner.lock().insert(task)?;
        Ok(pid)
    }

    /// Fork the current task. The child's saved context is arranged so
    /// its first dispatch returns to user mode with eax = 0; the parent
    /// gets the child pid.
    pub fn do_fork(&self, regs: &UserRegs) -> Result<Pid> {
        let mut child = {
            let mut inner = self.procs.inner.lock();
            let pid = inner.next_pid();
            let cur = inner.current();
            let parent = inner.task(cur).ok_or(KernelError::NoProcess)?;

            let mut child = self.new_task(Some(parent), pid);
            // mm: full duplicate; the paging layer clones page tables
            // with copy-on-write intent.
            child.mm = Box::new(parent.mm.duplicate(child.mm.pgd));
            // fs: same cwd/root/umask, one more reference each.
            child.fs.umask = parent.fs.umask;
            child.fs.cwd = parent.fs.cwd;
            child.fs.root = parent.fs.root;
            // files: share every open description.
            child.files.close_on_exec = parent.files.close_on_exec;
            child.files.fds = parent.files.fds;
            // sig: copy the handler table.
            child.sig.actions = parent.sig.actions;

            child.user_regs = *regs;
            child.user_regs.eax = 0;
            child
        };

        for fid in child.files.fds.iter().flatten() {
            self.file_dup(*fid);
        }
        if let Some(cwd) = child.fs.cwd {
            self.idup(cwd);
        }
        if let Some(root) = child.fs.root {
            self.idup(root);
        }

        let pid = child.pid;
        self.procs.inner.lock().insert(child)?;
        Ok(pid)
    }

    /// Terminate the current task. `status` is already encoded in wait
    /// status form: exit(n) passes (n & 0xff) << 8, a fatal signal
    /// passes the signal number.
    pub fn do_exit(&self, status: i32) {
        let pid = self.procs.current();

        // Close every open description first; this may write back
        // inodes and must run outside the task table lock.
        for fd in 0..NR_OPEN {
            let fid = self
                .procs
                .with_current(|t| t.files.fds[fd].take());
            if let Some(fid) = fid {
                self.file_put(fid);
            }
        }
        let (cwd, root) = self.procs.with_current(|t| (t.fs.cwd.take(), t.fs.root.take()));
        if let Some(cwd) = cwd {
            self.iput(cwd);
        }
        if let Some(root) = root {
            self.iput(root);
        }

        let (parent, itimer) = {
            let mut inner = self.procs.inner.lock();
            let cur = inner.current();
            // Orphans are re-parented to init.
            let children: alloc::vec::Vec<Pid> = inner
                .order()
                .iter()
                .copied()
                .filter(|p| inner.task(*p).map(|t| t.parent) == Some(cur))
                .collect();
            for c in children {
                if let Some(t) = inner.task_mut(c) {
                    t.parent = 1;
                }
            }
            let task = inner.task_mut(pid).expect("do_exit: current");
            task.exit_code = status;
            task.state = TaskState::ZOMBIE;
            (task.parent, task.itimer.take())
        };
        if let Some(id) = itimer {
            self.timers.del(id);
        }

        let _ = self.task_signal(parent, SIGCHLD);
        self.task_wakeup(Chan::Child(parent));
        self.schedule();
    }

    /// Reap a zombie child. Returns (pid, status).
    pub fn sys_wait4(&self, pid: Pid, options: i32) -> Result<(Pid, i32)> {
        let cur = self.procs.current();
        loop {
            let mut found_child = false;
            let zombie = {
                let mut inner = self.procs.inner.lock();
                let mut hit = None;
                for p in inner.order().iter().copied().collect::<alloc::vec::Vec<_>>() {
                    let t = match inner.task(p) {
                        Some(t) => t,
                        None => continue,
                    };
                    if t.parent != cur {
                        continue;
                    }
                    let wanted = match pid {
                        -1 => true,
                        0 => t.pgid == inner.task(cur).map(|c| c.pgid).unwrap_or(-1),
                        p if p > 0 => t.pid == p,
                        pg => t.pgid == -pg,
                    };
                    if !wanted {
                        continue;
                    }
                    found_child = true;
                    if t.state == TaskState::ZOMBIE {
                        hit = Some(p);
                        break;
                    }
                    if t.state == TaskState::STOPPED && options & WUNTRACED != 0 {
                        hit = Some(p);
                        break;
                    }
                }
                match hit {
                    Some(p) => {
                        let t = inner.task(p).expect("wait4: hit");
                        if t.state == TaskState::ZOMBIE {
                            let status = t.exit_code;
                            let task = inner.remove(p).expect("wait4: remove");
                            drop(task);
                            Some((p, status))
                        } else {
                            // Stopped: report without reaping.
                            Some((p, 0x7f))
                        }
                    }
                    None => None,
                }
            };

            if let Some(res) = zombie {
                return Ok(res);
            }
            if !found_child {
                return Err(KernelError::NoChild);
            }
            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }
            if self.procs.with_current(|t| t.signal_pending()) {
                return Err(KernelError::Interrupted);
            }
            self.task_sleep(Chan::Child(cur));
        }
    }

    /// Exit syscall: encode the status byte the Unix way. On hardware
    /// the zombie never runs again; the dispatcher discards the return.
    pub fn sys_exit(&self, status: i32) -> Result<i32> {
        self.do_exit((status & 0xff) << 8);
        Ok(0)
    }
}
