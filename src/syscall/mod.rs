//! System call dispatch.
//!
//! The trap stub saves user registers and calls `Kernel::syscall` with
//! the frame; the number sits in eax, arguments in ebx..edi following
//! the i386 convention, and the result (or negated errno) goes back in
//! eax. Pointer arguments are marshalled through the task's user
//! memory here, so the inner layers only ever see kernel buffers.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    kprintln,
    param::MAX_PATH,
    proc::UserRegs,
};

pub mod file;
pub mod ioctl;
pub mod net;
pub mod proc;
pub mod sys;

pub const SYS_EXIT: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_CLOSE: u32 = 6;
pub const SYS_LINK: u32 = 9;
pub const SYS_UNLINK: u32 = 10;
pub const SYS_EXECVE: u32 = 11;
pub const SYS_CHDIR: u32 = 12;
pub const SYS_MKNOD: u32 = 14;
pub const SYS_CHMOD: u32 = 15;
pub const SYS_LSEEK: u32 = 19;
pub const SYS_GETPID: u32 = 20;
pub const SYS_MOUNT: u32 = 21;
pub const SYS_UMOUNT: u32 = 22;
pub const SYS_SETUID: u32 = 23;
pub const SYS_GETUID: u32 = 24;
pub const SYS_PAUSE: u32 = 29;
pub const SYS_ACCESS: u32 = 33;
pub const SYS_SYNC: u32 = 36;
pub const SYS_KILL: u32 = 37;
pub const SYS_RENAME: u32 = 38;
pub const SYS_MKDIR: u32 = 39;
pub const SYS_RMDIR: u32 = 40;
pub const SYS_DUP: u32 = 41;
pub const SYS_PIPE: u32 = 42;
pub const SYS_BRK: u32 = 45;
pub const SYS_SETGID: u32 = 46;
pub const SYS_GETGID: u32 = 47;
pub const SYS_IOCTL: u32 = 54;
pub const SYS_SETPGID: u32 = 57;
pub const SYS_UMASK: u32 = 60;
pub const SYS_CHROOT: u32 = 61;
pub const SYS_DUP2: u32 = 63;
pub const SYS_GETPPID: u32 = 64;
pub const SYS_SYMLINK: u32 = 83;
pub const SYS_READLINK: u32 = 85;
pub const SYS_REBOOT: u32 = 88;
pub const SYS_MUNMAP: u32 = 91;
pub const SYS_FTRUNCATE: u32 = 93;
pub const SYS_FCHMOD: u32 = 94;
pub const SYS_FCHOWN: u32 = 95;
pub const SYS_SETITIMER: u32 = 104;
pub const SYS_WAIT4: u32 = 114;
pub const SYS_SYSINFO: u32 = 116;
pub const SYS_UNAME: u32 = 122;
pub const SYS_GETPGID: u32 = 132;
pub const SYS_FSYNC: u32 = 118;
pub const SYS_NANOSLEEP: u32 = 162;
pub const SYS_SIGRETURN: u32 = 173;
pub const SYS_SIGACTION: u32 = 174;
pub const SYS_SIGPROCMASK: u32 = 175;
pub const SYS_GETCWD: u32 = 183;
pub const SYS_CHOWN: u32 = 182;
pub const SYS_MMAP2: u32 = 192;
pub const SYS_TRUNCATE: u32 = 92;
pub const SYS_STAT64: u32 = 195;
pub const SYS_LSTAT64: u32 = 196;
pub const SYS_FSTAT64: u32 = 197;
pub const SYS_GETDENTS64: u32 = 220;
pub const SYS_EXIT_GROUP: u32 = 252;
pub const SYS_STATFS64: u32 = 268;
pub const SYS_OPENAT: u32 = 295;
pub const SYS_UTIMENSAT: u32 = 320;
pub const SYS_DUP3: u32 = 330;
pub const SYS_PIPE2: u32 = 331;
pub const SYS_PRLIMIT64: u32 = 340;
pub const SYS_GETRANDOM: u32 = 355;
pub const SYS_SOCKET: u32 = 359;
pub const SYS_BIND: u32 = 361;
pub const SYS_CONNECT: u32 = 362;
pub const SYS_LISTEN: u32 = 363;
pub const SYS_ACCEPT4: u32 = 364;
pub const SYS_GETSOCKOPT: u32 = 365;
pub const SYS_SETSOCKOPT: u32 = 366;
pub const SYS_GETSOCKNAME: u32 = 367;
pub const SYS_GETPEERNAME: u32 = 368;
pub const SYS_SENDTO: u32 = 369;
pub const SYS_SENDMSG: u32 = 370;
pub const SYS_RECVFROM: u32 = 371;
pub const SYS_RECVMSG: u32 = 372;
pub const SYS_SHUTDOWN: u32 = 373;
pub const SYS_STATX: u32 = 383;
pub const SYS_CLOCK_GETTIME64: u32 = 403;

/// Largest single read/write the kernel stages in one go.
const IO_CHUNK: usize = 64 * 1024;
/// Staging cap for directory listings.
pub(crate) const IO_CHUNK_DENTS: usize = 16 * 1024;

impl Kernel {
    /// Copy a NUL-terminated path out of user memory.
    pub fn fetch_path(&self, addr: u32) -> Result<Vec<u8>> {
        let mut path = Vec::new();
        for i in 0..MAX_PATH as u32 + 1 {
            let mut byte = [0u8];
            self.procs
                .with_current(|t| t.mm.copy_in(addr + i, &mut byte))?;
            if byte[0] == 0 {
                return Ok(path);
            }
            path.push(byte[0]);
        }
        Err(KernelError::NameTooLong)
    }

    /// Entry from the trap stub. Decodes, dispatches, writes the result
    /// back into eax.
    pub fn syscall(&self, regs: &mut UserRegs) {
        let num = regs.eax;
        self.procs.with_current(|t| t.orig_eax = num);
        let ret = self.syscall_inner(num, regs);
        regs.eax = match ret {
            Ok(v) => v as u32,
            Err(e) => e.to_ret() as u32,
        };
    }

    fn syscall_inner(&self, num: u32, regs: &mut UserRegs) -> Result<i32> {
        let (b, c, d, s, di) = (regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi);
        match num {
            SYS_EXIT | SYS_EXIT_GROUP => self.sys_exit(b as i32),
            SYS_FORK => self.do_fork(regs).map(|pid| pid as i32),
            SYS_READ => {
                let fid = self.fd_to_file(b as i32)?;
                let len = (d as usize).min(IO_CHUNK);
                let mut buf = vec![0u8; len];
                let n = self.file_read(fid, &mut buf)?;
                self.procs
                    .with_current(|t| t.mm.copy_out(c, &buf[..n]))?;
                Ok(n as i32)
            }
            SYS_WRITE => {
                let fid = self.fd_to_file(b as i32)?;
                let len = (d as usize).min(IO_CHUNK);
                let mut buf = vec![0u8; len];
                self.procs.with_current(|t| t.mm.copy_in(c, &mut buf))?;
                let n = self.file_write(fid, &buf)?;
                Ok(n as i32)
            }
            SYS_OPEN => {
                let path = self.fetch_path(b)?;
                self.do_open(
                    crate::fs::path::AT_FDCWD,
                    &path,
                    crate::file::OpenFlags::from_bits_truncate(c),
                    crate::fs::Mode(d as u16),
                )
            }
            SYS_OPENAT => {
                let path = self.fetch_path(c)?;
                self.do_open(
                    b as i32,
                    &path,
                    crate::file::OpenFlags::from_bits_truncate(d),
                    crate::fs::Mode(s as u16),
                )
            }
            SYS_CLOSE => self.do_close(b as i32),
            SYS_LSEEK => {
                let fid = self.fd_to_file(b as i32)?;
                self.file_lseek(fid, c as i32, d as i32)
            }
            SYS_DUP => self.do_dup(b as i32, 0),
            SYS_DUP2 => self.do_dup2(b as i32, c as i32, false),
            SYS_DUP3 => self.do_dup2(b as i32, c as i32, d & 0o2000000 != 0),
            SYS_PIPE | SYS_PIPE2 => {
                let (rfd, wfd) = self.do_pipe()?;
                self.procs.with_current(|t| {
                    t.mm.copy_out_u32(b, rfd as u32)?;
                    t.mm.copy_out_u32(b + 4, wfd as u32)
                })?;
                Ok(0)
            }
            SYS_LINK => {
                let old = self.fetch_path(b)?;
                let new = self.fetch_path(c)?;
                self.do_link(
                    crate::fs::path::AT_FDCWD,
                    &old,
                    crate::fs::path::AT_FDCWD,
                    &new,
                )
            }
            SYS_UNLINK => {
                let path = self.fetch_path(b)?;
                self.do_unlink(crate::fs::path::AT_FDCWD, &path)
            }
            SYS_SYMLINK => {
                let target = self.fetch_path(b)?;
                let link = self.fetch_path(c)?;
                self.do_symlink(&target, crate::fs::path::AT_FDCWD, &link)
            }
            SYS_READLINK => {
                let path = self.fetch_path(b)?;
                let mut buf = vec![0u8; (d as usize).min(MAX_PATH)];
                let n = self.do_readlink(crate::fs::path::AT_FDCWD, &path, &mut buf)?;
                self.procs
                    .with_current(|t| t.mm.copy_out(c, &buf[..n]))?;
                Ok(n as i32)
            }
            SYS_MKDIR => {
                let path = self.fetch_path(b)?;
                self.do_mkdir(crate::fs::path::AT_FDCWD, &path, crate::fs::Mode(c as u16))
            }
            SYS_RMDIR => {
                let path = self.fetch_path(b)?;
                self.do_rmdir(crate::fs::path::AT_FDCWD, &path)
            }
            SYS_MKNOD => {
                let path = self.fetch_path(b)?;
                self.do_mknod(
                    crate::fs::path::AT_FDCWD,
                    &path,
                    crate::fs::Mode(c as u16),
                    crate::dev::DevT(d),
                )
            }
            SYS_RENAME => {
                let old = self.fetch_path(b)?;
                let new = self.fetch_path(c)?;
                self.do_rename(
                    crate::fs::path::AT_FDCWD,
                    &old,
                    crate::fs::path::AT_FDCWD,
                    &new,
                )
            }
            SYS_CHDIR => {
                let path = self.fetch_path(b)?;
                self.do_chdir(&path)
            }
            SYS_CHROOT => {
                let path = self.fetch_path(b)?;
                self.do_chroot(&path)
            }
            SYS_GETCWD => {
                let mut buf = vec![0u8; (c as usize).min(MAX_PATH)];
                let n = self.do_getcwd(&mut buf)?;
                self.procs
                    .with_current(|t| t.mm.copy_out(b, &buf[..n]))?;
                Ok(n as i32)
            }
            SYS_MOUNT => {
                let source = self.fetch_path(b)?;
                let target = self.fetch_path(c)?;
                let fstype = self.fetch_path(d)?;
                self.do_mount(&source, &target, &fstype)
            }
            SYS_UMOUNT => {
                let target = self.fetch_path(b)?;
                self.do_umount(&target)
            }
            SYS_CHMOD => {
                let path = self.fetch_path(b)?;
                self.do_chmod(&path, c as u16)
            }
            SYS_FCHMOD => self.do_fchmod(b as i32, c as u16),
            SYS_CHOWN => {
                let path = self.fetch_path(b)?;
                self.do_chown(&path, c as u16, d as u16)
            }
            SYS_FCHOWN => self.do_fchown(b as i32, c as u16, d as u16),
            SYS_UTIMENSAT => self.sys_utimensat(b as i32, c, d, s as i32),
            SYS_ACCESS => {
                let path = self.fetch_path(b)?;
                self.do_access(&path, c as i32)
            }
            SYS_TRUNCATE => {
                let path = self.fetch_path(b)?;
                self.do_truncate(&path)
            }
            SYS_FTRUNCATE => self.do_ftruncate(b as i32),
            SYS_STAT64 => self.sys_stat(b, c, true),
            SYS_LSTAT64 => self.sys_stat(b, c, false),
            SYS_FSTAT64 => self.sys_fstat(b as i32, c),
            SYS_STATX => self.sys_statx(b as i32, c, d, s, di),
            SYS_STATFS64 => self.sys_statfs(b, c),
            SYS_GETDENTS64 => self.sys_getdents64(b as i32, c, d as usize),
            SYS_SYNC | SYS_FSYNC => {
                self.sync_all();
                Ok(0)
            }
            SYS_EXECVE => {
                let ret = self.sys_execve(b, c, d)?;
                // The new image's entry state replaces the trap frame.
                *regs = self.procs.with_current(|t| t.user_regs);
                Ok(ret)
            }
            SYS_WAIT4 => {
                let (pid, status) = self.sys_wait4(b as i32, d as i32)?;
                if c != 0 {
                    self.procs
                        .with_current(|t| t.mm.copy_out_u32(c, status as u32))?;
                }
                Ok(pid as i32)
            }
            SYS_KILL => self.sys_kill(b as i32, c),
            SYS_SIGRETURN => self.sys_sigreturn(regs),
            SYS_SIGACTION => self.sys_sigaction_user(b, c, d),
            SYS_SIGPROCMASK => self.sys_sigprocmask_user(b as i32, c, d),
            SYS_PAUSE => self.sys_pause(),
            SYS_GETPID => Ok(self.procs.current()),
            SYS_GETPPID => Ok(self.procs.with_current(|t| t.parent)),
            SYS_GETPGID => self.sys_getpgid(b as i32),
            SYS_SETPGID => self.sys_setpgid(b as i32, c as i32),
            SYS_GETUID => Ok(self.procs.with_current(|t| t.uid as i32)),
            SYS_GETGID => Ok(self.procs.with_current(|t| t.gid as i32)),
            SYS_SETUID => self.sys_setuid(b as u16),
            SYS_SETGID => self.sys_setgid(b as u16),
            SYS_BRK => self.sys_brk(b),
            SYS_MMAP2 => self.sys_mmap(b, c, d, s, di as i32),
            SYS_MUNMAP => self.sys_munmap(b, c),
            SYS_NANOSLEEP => self.sys_nanosleep(b, c),
            SYS_SETITIMER => self.sys_setitimer(b as i32, c, d),
            SYS_IOCTL => self.sys_ioctl(b as i32, c, d),
            SYS_UMASK => self.sys_umask(b as u16),
            SYS_UNAME => self.sys_uname(b),
            SYS_SYSINFO => self.sys_sysinfo(b),
            SYS_PRLIMIT64 => self.sys_prlimit64(b as i32, c as i32, d, s),
            SYS_GETRANDOM => self.sys_getrandom(b, c as usize),
            SYS_REBOOT => self.sys_reboot(b, c, d as i32),
            SYS_CLOCK_GETTIME64 => self.sys_clock_gettime64(b as i32, c),
            SYS_SOCKET => self.sys_socket(b as i32, c as i32, d as i32),
            SYS_BIND => self.sys_bind_user(b as i32, c, d),
            SYS_CONNECT => self.sys_connect_user(b as i32, c, d),
            SYS_LISTEN => self.sys_listen(b as i32, c as i32),
            SYS_ACCEPT4 => self.sys_accept_user(b as i32, c, d),
            SYS_SENDTO => self.sys_sendto_user(b as i32, c, d as usize, s, di),
            SYS_SENDMSG => self.sys_sendmsg_user(b as i32, c, d),
            SYS_RECVFROM => self.sys_recvfrom_user(b as i32, c, d as usize, s, di),
            SYS_RECVMSG => self.sys_recvmsg_user(b as i32, c, d),
            SYS_SHUTDOWN => self.sys_shutdown(b as i32, c as i32),
            SYS_GETSOCKNAME => self.sys_sockname_user(b as i32, c, d, false),
            SYS_GETPEERNAME => self.sys_sockname_user(b as i32, c, d, true),
            SYS_GETSOCKOPT => self.sys_getsockopt_user(b as i32, c as i32, d as i32, s, di),
            SYS_SETSOCKOPT => self.sys_setsockopt_user(b as i32, c as i32, d as i32, s, di),
            _ => {
                let (pid, name) = self
                    .procs
                    .with_current(|t| (t.pid, t.name));
                let end = name.iter().position(|c| *c == 0).unwrap_or(name.len());
                kprintln!(
                    "{} {}: unknown sys call {}",
                    pid,
                    core::str::from_utf8(&name[..end]).unwrap_or("???"),
                    num
                );
                Err(KernelError::NotSupported)
            }
        }
    }
}
