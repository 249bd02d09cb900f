//! Process-management system calls.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    param::NR_OPEN,
    proc::{
        sched::SleepOutcome,
        signal::{SigAction, SigFlags, SigHandler, SIGALRM},
        timer::{ms_to_jiffies, TimerAction},
        Chan, Pid,
    },
    vm::{VmFlags, MMAP_BASE, PAGE_SIZE_U32, USER_STACK_SIZE, USER_STACK_TOP},
};

/// Entry point the loader seam hands back for a valid image.
const USER_ENTRY: u32 = 0x0804_8000;

const MAP_FIXED: u32 = 0x10;
const MAP_ANONYMOUS: u32 = 0x20;

impl Kernel {
    /// execve(2). The ELF loader proper lives behind the arch seam;
    /// this validates the image, rebuilds the address space and stages
    /// the argument vector on the fresh stack.
    pub fn sys_execve(&self, path_addr: u32, argv_addr: u32, _envp_addr: u32) -> Result<i32> {
        let path = self.fetch_path(path_addr)?;

        // Stage argv out of the old address space first.
        let mut args: Vec<Vec<u8>> = Vec::new();
        if argv_addr != 0 {
            for i in 0..32u32 {
                let ptr = self
                    .procs
                    .with_current(|t| t.mm.copy_in_u32(argv_addr + i * 4))?;
                if ptr == 0 {
                    break;
                }
                args.push(self.fetch_path(ptr)?);
            }
        }

        let inode = self.namei(crate::fs::path::AT_FDCWD, &path, true)?;
        let check = (|| {
            let (mode, sb) = self.with_inode(inode, |d| (d.mode, d.sb));
            if !mode.is_reg() {
                return Err(KernelError::Access);
            }
            if mode.perms() & 0o111 == 0 {
                return Err(KernelError::Access);
            }
            let sb = sb.ok_or(KernelError::Access)?;
            let mut magic = [0u8; 4];
            let n = self.fs_of(sb)?.read(self, inode, 0, &mut magic)?;
            if n < 4 || magic != [0x7f, b'E', b'L', b'F'] {
                return Err(KernelError::NotSupported);
            }
            Ok(())
        })();
        self.iput(inode);
        check?;

        // Close-on-exec descriptors go first.
        let cloexec: Vec<(usize, crate::file::FileId)> = self.procs.with_current(|t| {
            let close_on_exec = t.files.close_on_exec;
            (0..NR_OPEN)
                .filter(|fd| close_on_exec & (1 << fd) != 0)
                .filter_map(|fd| t.files.fds[fd].take().map(|fid| (fd, fid)))
                .collect()
        });
        for (fd, fid) in cloexec {
            self.procs
                .with_current(|t| t.files.close_on_exec &= !(1 << fd));
            self.file_put(fid);
        }

        // Replace the image: new name, default signal handlers, fresh
        // address space with a stack.
        let base = path
            .rsplit(|c| *c == b'/')
            .next()
            .unwrap_or(&path)
            .to_vec();
        self.procs.with_current(|t| {
            t.set_name(&base);
            for action in t.sig.actions.iter_mut() {
                if let SigHandler::Handler(_) = action.handler {
                    *action = SigAction::default();
                }
            }
            t.mm.clear();
            t.mm.start_text = USER_ENTRY;
            t.mm.end_text = USER_ENTRY;
            t.mm.start_brk = USER_ENTRY + 0x0010_0000;
            t.mm.brk = t.mm.start_brk;
            t.mm.start_stack = USER_STACK_TOP;
        });

        // Build argc/argv on the stack.
        let mut sp = USER_STACK_TOP;
        let mut ptrs: Vec<u32> = Vec::new();
        for arg in args.iter().rev() {
            sp -= arg.len() as u32 + 1;
            self.procs.with_current(|t| {
                t.mm.copy_out(sp, arg)?;
                t.mm.copy_out(sp + arg.len() as u32, &[0])
            })?;
            ptrs.push(sp);
        }
        ptrs.reverse();
        sp &= !3;
        sp -= 4; // NULL argv terminator
        self.procs.with_current(|t| t.mm.copy_out_u32(sp, 0))?;
        for ptr in ptrs.iter().rev() {
            sp -= 4;
            self.procs.with_current(|t| t.mm.copy_out_u32(sp, *ptr))?;
        }
        let argv = sp;
        sp -= 4;
        self.procs.with_current(|t| t.mm.copy_out_u32(sp, argv))?;
        sp -= 4;
        self.procs
            .with_current(|t| t.mm.copy_out_u32(sp, args.len() as u32))?;

        self.procs.with_current(|t| {
            t.user_regs.eip = USER_ENTRY;
            t.user_regs.esp = sp;
            t.user_regs.eax = 0;
        });
        Ok(0)
    }

    pub fn sys_pause(&self) -> Result<i32> {
        let pid = self.procs.current();
        self.task_sleep(Chan::Sleep(pid));
        Err(KernelError::Interrupted)
    }

    /// nanosleep(2) over the jiffy clock.
    pub fn sys_nanosleep(&self, req_addr: u32, rem_addr: u32) -> Result<i32> {
        let mut raw = [0u8; 8];
        self.procs
            .with_current(|t| t.mm.copy_in(req_addr, &mut raw))?;
        let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let nsec = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if nsec >= 1_000_000_000 {
            return Err(KernelError::InvalidArg);
        }

        let ms = sec as u64 * 1000 + (nsec as u64 + 999_999) / 1_000_000;
        let pid = self.procs.current();
        let deadline = self.jiffies() + ms_to_jiffies(ms);
        match self.task_sleep_timeout(Chan::Sleep(pid), ms) {
            SleepOutcome::Expired => Ok(0),
            SleepOutcome::Woken => {
                if rem_addr != 0 {
                    let left = deadline.saturating_sub(self.jiffies());
                    let left_ms = crate::proc::timer::jiffies_to_ms(left);
                    let rem_sec = (left_ms / 1000) as u32;
                    let rem_nsec = ((left_ms % 1000) * 1_000_000) as u32;
                    self.procs.with_current(|t| {
                        t.mm.copy_out(rem_addr, &rem_sec.to_le_bytes())?;
                        t.mm.copy_out(rem_addr + 4, &rem_nsec.to_le_bytes())
                    })?;
                }
                Err(KernelError::Interrupted)
            }
        }
    }

    /// setitimer(2), real timer only: SIGALRM at expiry.
    pub fn sys_setitimer(&self, which: i32, new_addr: u32, _old_addr: u32) -> Result<i32> {
        if which != 0 {
            return Err(KernelError::NotSupported);
        }
        let mut raw = [0u8; 16];
        self.procs
            .with_current(|t| t.mm.copy_in(new_addr, &mut raw))?;
        let value_sec = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let value_usec = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);

        let pid = self.procs.current();
        let old = self.procs.with_current(|t| t.itimer.take());
        if let Some(id) = old {
            self.timers.del(id);
        }
        if value_sec != 0 || value_usec != 0 {
            let ms = value_sec as u64 * 1000 + value_usec as u64 / 1000;
            let id = self.timers.add(
                self.jiffies() + ms_to_jiffies(ms),
                TimerAction::Signal(pid, SIGALRM),
            );
            self.procs.with_current(|t| t.itimer = Some(id));
        }
        Ok(0)
    }

    pub fn sys_getpgid(&self, pid: Pid) -> Result<i32> {
        if pid == 0 {
            return Ok(self.procs.with_current(|t| t.pgid));
        }
        self.procs.with_task(pid, |t| t.pgid)
    }

    pub fn sys_setpgid(&self, pid: Pid, pgid: Pid) -> Result<i32> {
        let target = if pid == 0 { self.procs.current() } else { pid };
        let pgid = if pgid == 0 { target } else { pgid };
        self.procs.with_task(target, |t| t.pgid = pgid)?;
        Ok(0)
    }

    pub fn sys_setuid(&self, uid: u16) -> Result<i32> {
        self.procs.with_current(|t| {
            if t.euid != 0 && t.uid != uid {
                return Err(KernelError::PermissionDenied);
            }
            t.uid = uid;
            t.euid = uid;
            Ok(0)
        })
    }

    pub fn sys_setgid(&self, gid: u16) -> Result<i32> {
        self.procs.with_current(|t| {
            if t.euid != 0 && t.gid != gid {
                return Err(KernelError::PermissionDenied);
            }
            t.gid = gid;
            t.egid = gid;
            Ok(0)
        })
    }

    /// brk(2): returns the break, moved or not.
    pub fn sys_brk(&self, addr: u32) -> Result<i32> {
        let brk = self.procs.with_current(|t| {
            t.mm.set_brk(addr).unwrap_or(t.mm.brk)
        });
        Ok(brk as i32)
    }

    /// mmap2(2), anonymous mappings only.
    pub fn sys_mmap(&self, addr: u32, len: u32, prot: u32, flags: u32, fd: i32) -> Result<i32> {
        if len == 0 {
            return Err(KernelError::InvalidArg);
        }
        if flags & MAP_ANONYMOUS == 0 || fd >= 0 {
            return Err(KernelError::NotSupported);
        }
        let len = (len + PAGE_SIZE_U32 - 1) & !(PAGE_SIZE_U32 - 1);

        let mut vmflags = VmFlags::empty();
        if prot & 1 != 0 {
            vmflags |= VmFlags::READ;
        }
        if prot & 2 != 0 {
            vmflags |= VmFlags::WRITE;
        }
        if prot & 4 != 0 {
            vmflags |= VmFlags::EXEC;
        }

        self.procs.with_current(|t| {
            let start = if flags & MAP_FIXED != 0 {
                if addr == 0 || addr % PAGE_SIZE_U32 != 0 {
                    return Err(KernelError::InvalidArg);
                }
                addr
            } else if addr != 0 && t.mm.find_area(addr).is_none() && addr >= MMAP_BASE {
                addr & !(PAGE_SIZE_U32 - 1)
            } else {
                t.mm.find_free_range(len)?
            };
            if start >= USER_STACK_TOP - USER_STACK_SIZE {
                return Err(KernelError::NoMemory);
            }
            t.mm.map_area(start, start + len, vmflags)?;
            Ok(start as i32)
        })
    }

    pub fn sys_munmap(&self, addr: u32, len: u32) -> Result<i32> {
        if len == 0 {
            return Err(KernelError::InvalidArg);
        }
        let end = addr
            .checked_add((len + PAGE_SIZE_U32 - 1) & !(PAGE_SIZE_U32 - 1))
            .ok_or(KernelError::InvalidArg)?;
        self.procs.with_current(|t| t.mm.unmap(addr, end))?;
        Ok(0)
    }

    /// rt_sigaction with the classic four-word layout.
    pub fn sys_sigaction_user(&self, sig: u32, act_addr: u32, oldact_addr: u32) -> Result<i32> {
        let action = if act_addr != 0 {
            let mut raw = [0u8; 16];
            self.procs
                .with_current(|t| t.mm.copy_in(act_addr, &mut raw))?;
            let handler = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let flags = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            let restorer = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            let mask = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
            Some(SigAction {
                handler: match handler {
                    0 => SigHandler::Default,
                    1 => SigHandler::Ignore,
                    h => SigHandler::Handler(h),
                },
                flags: SigFlags::from_bits_truncate(flags),
                mask,
                restorer,
            })
        } else {
            None
        };

        let old = self.sys_sigaction(sig, action)?;
        if oldact_addr != 0 {
            let handler = match old.handler {
                SigHandler::Default => 0,
                SigHandler::Ignore => 1,
                SigHandler::Handler(h) => h,
            };
            self.procs.with_current(|t| {
                t.mm.copy_out_u32(oldact_addr, handler)?;
                t.mm.copy_out_u32(oldact_addr + 4, old.flags.bits())?;
                t.mm.copy_out_u32(oldact_addr + 8, old.restorer)?;
                t.mm.copy_out_u32(oldact_addr + 12, old.mask)
            })?;
        }
        Ok(0)
    }

    pub fn sys_sigprocmask_user(&self, how: i32, set_addr: u32, oldset_addr: u32) -> Result<i32> {
        let set = if set_addr != 0 {
            Some(
                self.procs
                    .with_current(|t| t.mm.copy_in_u32(set_addr))?,
            )
        } else {
            None
        };
        let old = self.sys_sigprocmask(how, set)?;
        if oldset_addr != 0 {
            self.procs
                .with_current(|t| t.mm.copy_out_u32(oldset_addr, old))?;
        }
        Ok(0)
    }
}
