//! Open file descriptions.
//!
//! A file descriptor indexes the per-task table; each entry points into
//! the system-wide open-description table. dup and fork share
//! descriptions by raising their reference count; the last close
//! releases the inode reference and runs the driver-specific teardown
//! (pipe end counts, pty hangup, socket release).

use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    dev::{self, DevT},
    error::{KernelError, Result},
    fs::{IRef, Special},
    kernel::Kernel,
    param::{NR_FILE, NR_OPEN},
    proc::Chan,
};

bitflags! {
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_ACCMODE = 0o3;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_NOCTTY = 0o400;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_NONBLOCK = 0o4000;
        const O_DIRECTORY = 0o200000;
        const O_NOFOLLOW = 0o400000;
        const O_CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        let acc = self.bits() & Self::O_ACCMODE.bits();
        acc == Self::O_RDONLY.bits() || acc == Self::O_RDWR.bits()
    }

    pub fn writable(self) -> bool {
        let acc = self.bits() & Self::O_ACCMODE.bits();
        acc == Self::O_WRONLY.bits() || acc == Self::O_RDWR.bits()
    }
}

/// Whence values for lseek.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Index handle into the open-description table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileId(pub usize);

pub struct File {
    pub flags: OpenFlags,
    pub pos: u32,
    /// Referenced inode; released on last close.
    pub inode: IRef,
    /// Pty master index for /dev/ptmx opens.
    pub priv_tty: Option<usize>,
}

struct FileSlot {
    refs: u32,
    file: Option<File>,
}

pub struct FileTable {
    inner: Mutex<Vec<FileSlot>>,
}

impl FileTable {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(NR_FILE);
        for _ in 0..NR_FILE {
            v.push(FileSlot {
                refs: 0,
                file: None,
            });
        }
        Self {
            inner: Mutex::new(v),
        }
    }

    /// Reference count of an open description; debug and test inspection.
    pub fn refs(&self, fid: FileId) -> u32 {
        self.inner.lock()[fid.0].refs
    }
}

impl Kernel {
    /// Allocate an open description holding one inode reference.
    pub fn falloc(&self, inode: IRef, flags: OpenFlags) -> Result<FileId> {
        let mut table = self.ftable.inner.lock();
        let idx = table
            .iter()
            .position(|s| s.refs == 0)
            .ok_or(KernelError::FileTableFull)?;
        table[idx].refs = 1;
        table[idx].file = Some(File {
            flags,
            pos: 0,
            inode,
            priv_tty: None,
        });
        Ok(FileId(idx))
    }

    pub fn file_dup(&self, fid: FileId) {
        let mut table = self.ftable.inner.lock();
        assert!(table[fid.0].refs > 0, "file_dup: dead file");
        table[fid.0].refs += 1;
    }

    /// Drop one reference; teardown runs exactly once, at zero.
    pub fn file_put(&self, fid: FileId) {
        let closed = {
            let mut table = self.ftable.inner.lock();
            assert!(table[fid.0].refs > 0, "file_put: refcnt underflow");
            table[fid.0].refs -= 1;
            if table[fid.0].refs == 0 {
                table[fid.0].file.take()
            } else {
                None
            }
        };
        let file = match closed {
            Some(f) => f,
            None => return,
        };

        let (mode, rdev, special_sock) = self.with_inode(file.inode, |d| {
            let sock = match d.special {
                Special::Socket(s) => Some(s),
                _ => None,
            };
            (d.mode, d.rdev(), sock)
        });

        if mode.is_fifo() {
            self.release_pipe_end(file.inode, file.flags.writable());
        } else if let Some(sock) = special_sock {
            self.sock_close(sock);
        } else if mode.is_chr() && rdev.major() == dev::TTYAUX_MAJOR {
            if let Some(master) = file.priv_tty {
                self.ptm_close(master);
            }
        }
        self.iput(file.inode);
    }

    pub fn with_file<R>(&self, fid: FileId, f: impl FnOnce(&mut File) -> R) -> Result<R> {
        let mut table = self.ftable.inner.lock();
        let slot = table.get_mut(fid.0).ok_or(KernelError::BadFd)?;
        match slot.file.as_mut() {
            Some(file) => Ok(f(file)),
            None => Err(KernelError::BadFd),
        }
    }

    /// Resolve a descriptor of the current task.
    pub fn fd_to_file(&self, fd: i32) -> Result<FileId> {
        self.procs.with_current(|t| t.files.get(fd))
    }

    /// Bind an open description to the lowest free descriptor slot.
    pub fn fd_install(&self, fid: FileId, cloexec: bool) -> Result<i32> {
        self.procs.with_current(|t| {
            let fd = t.files.alloc_fd()?;
            t.files.fds[fd] = Some(fid);
            if cloexec {
                t.files.close_on_exec |= 1 << fd;
            } else {
                t.files.close_on_exec &= !(1 << fd);
            }
            Ok(fd as i32)
        })
    }

    /// Generic read entry: dispatch on the inode kind.
    pub fn file_read(&self, fid: FileId, buf: &mut [u8]) -> Result<usize> {
        let (flags, pos, inode, priv_tty) =
            self.with_file(fid, |f| (f.flags, f.pos, f.inode, f.priv_tty))?;
        if !flags.readable() {
            return Err(KernelError::BadFd);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let nonblock = flags.contains(OpenFlags::O_NONBLOCK);
        let (mode, sock) = self.with_inode(inode, |d| {
            let sock = match d.special {
                Special::Socket(s) => Some(s),
                _ => None,
            };
            (d.mode, sock)
        });

        if mode.is_fifo() {
            return self.read_pipe(inode, buf, nonblock);
        }
        if let Some(sidx) = sock {
            return self.sock_read(sidx, buf, nonblock);
        }
        if mode.is_chr() {
            let rdev = self.with_inode(inode, |d| d.rdev());
            return self.chr_read(rdev, priv_tty, buf, nonblock);
        }
        if mode.is_blk() {
            let rdev = self.with_inode(inode, |d| d.rdev());
            let n = self.blk_read(rdev, pos, buf)?;
            self.with_file(fid, |f| f.pos = pos + n as u32)?;
            return Ok(n);
        }

        let sb = self
            .with_inode(inode, |d| d.sb)
            .ok_or(KernelError::InvalidArg)?;
        let n = self.fs_of(sb)?.read(self, inode, pos, buf)?;
        self.with_file(fid, |f| f.pos = pos + n as u32)?;
        Ok(n)
    }

    /// Generic write entry.
    pub fn file_write(&self, fid: FileId, data: &[u8]) -> Result<usize> {
        let (flags, pos, inode, priv_tty) =
            self.with_file(fid, |f| (f.flags, f.pos, f.inode, f.priv_tty))?;
        if !flags.writable() {
            return Err(KernelError::BadFd);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let nonblock = flags.contains(OpenFlags::O_NONBLOCK);
        let (mode, sock) = self.with_inode(inode, |d| {
            let sock = match d.special {
                Special::Socket(s) => Some(s),
                _ => None,
            };
            (d.mode, sock)
        });

        if mode.is_fifo() {
            return self.write_pipe(inode, data, nonblock);
        }
        if let Some(sidx) = sock {
            return self.sock_write(sidx, data, nonblock);
        }
        if mode.is_chr() {
            let rdev = self.with_inode(inode, |d| d.rdev());
            return self.chr_write(rdev, priv_tty, data);
        }
        if mode.is_blk() {
            let rdev = self.with_inode(inode, |d| d.rdev());
            let n = self.blk_write(rdev, pos, data)?;
            self.with_file(fid, |f| f.pos = pos + n as u32)?;
            return Ok(n);
        }

        let sb = self
            .with_inode(inode, |d| d.sb)
            .ok_or(KernelError::InvalidArg)?;
        let pos = if flags.contains(OpenFlags::O_APPEND) {
            self.with_inode(inode, |d| d.size)
        } else {
            pos
        };
        let n = self.fs_of(sb)?.write(self, inode, pos, data)?;
        self.with_file(fid, |f| f.pos = pos + n as u32)?;
        Ok(n)
    }

    /// Reposition the file offset.
    pub fn file_lseek(&self, fid: FileId, offset: i32, whence: i32) -> Result<i32> {
        let inode = self.with_file(fid, |f| f.inode)?;
        let mode = self.with_inode(inode, |d| d.mode);
        if mode.is_fifo() || mode.is_sock() {
            return Err(KernelError::IllegalSeek);
        }
        let size = self.with_inode(inode, |d| d.size);
        self.with_file(fid, |f| {
            let base = match whence {
                SEEK_SET => 0i64,
                SEEK_CUR => f.pos as i64,
                SEEK_END => size as i64,
                _ => return Err(KernelError::InvalidArg),
            };
            let new = base + offset as i64;
            if new < 0 || new > u32::MAX as i64 {
                return Err(KernelError::Range);
            }
            f.pos = new as u32;
            Ok(f.pos as i32)
        })?
    }

    /// Character-device read dispatch by major number.
    fn chr_read(
        &self,
        rdev: DevT,
        priv_tty: Option<usize>,
        buf: &mut [u8],
        nonblock: bool,
    ) -> Result<usize> {
        match rdev.major() {
            dev::MEM_MAJOR => match rdev.minor() {
                dev::NULL_MINOR => Ok(0),
                dev::ZERO_MINOR => {
                    buf.fill(0);
                    Ok(buf.len())
                }
                dev::RANDOM_MINOR => {
                    self.fill_random(buf);
                    Ok(buf.len())
                }
                _ => Err(KernelError::NoDevice),
            },
            dev::TTY_MAJOR => {
                let idx = self.console_of(rdev.minor())?;
                self.tty_read(idx, buf, nonblock)
            }
            dev::PTS_MAJOR => self.tty_read(self.pts_index(rdev.minor())?, buf, nonblock),
            dev::TTYAUX_MAJOR => {
                let idx = priv_tty.ok_or(KernelError::NoDevice)?;
                self.tty_read(idx, buf, nonblock)
            }
            _ => Err(KernelError::NoDevice),
        }
    }

    /// Character-device write dispatch by major number.
    fn chr_write(&self, rdev: DevT, priv_tty: Option<usize>, data: &[u8]) -> Result<usize> {
        match rdev.major() {
            dev::MEM_MAJOR => match rdev.minor() {
                dev::NULL_MINOR | dev::ZERO_MINOR | dev::RANDOM_MINOR => Ok(data.len()),
                _ => Err(KernelError::NoDevice),
            },
            dev::TTY_MAJOR => {
                let idx = self.console_of(rdev.minor())?;
                self.tty_opost(idx, data)
            }
            dev::PTS_MAJOR => self.tty_opost(self.pts_index(rdev.minor())?, data),
            dev::TTYAUX_MAJOR => {
                let idx = priv_tty.ok_or(KernelError::NoDevice)?;
                self.tty_opost(idx, data)
            }
            _ => Err(KernelError::NoDevice),
        }
    }

    /// Buffered block-device read through the block cache.
    fn blk_read(&self, rdev: DevT, pos: u32, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let block = (pos as usize + done) / crate::param::BLOCK_SIZE;
            let off = (pos as usize + done) % crate::param::BLOCK_SIZE;
            let chunk = (buf.len() - done).min(crate::param::BLOCK_SIZE - off);
            let b = match self.bcache.bread(&self.disks, rdev, block as u32) {
                Ok(b) => b,
                Err(_) if done > 0 => break,
                Err(e) => return Err(e),
            };
            self.bcache.with_data(b, |data| {
                buf[done..done + chunk].copy_from_slice(&data[off..off + chunk]);
            });
            self.bcache.brelse(&self.disks, b);
            done += chunk;
        }
        Ok(done)
    }

    /// Buffered block-device write through the block cache.
    fn blk_write(&self, rdev: DevT, pos: u32, data: &[u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < data.len() {
            let block = (pos as usize + done) / crate::param::BLOCK_SIZE;
            let off = (pos as usize + done) % crate::param::BLOCK_SIZE;
            let chunk = (data.len() - done).min(crate::param::BLOCK_SIZE - off);
            let b = self.bcache.bread(&self.disks, rdev, block as u32)?;
            self.bcache.with_data_mut(b, |bd| {
                bd[off..off + chunk].copy_from_slice(&data[done..done + chunk]);
            });
            self.bcache.mark_dirty(b);
            self.bcache.brelse(&self.disks, b);
            done += chunk;
        }
        Ok(done)
    }

    /// Console tty index for a /dev/tty minor: 0 means the task's
    /// controlling tty, 1..=NR_CONSOLES name a console.
    fn console_of(&self, minor: u32) -> Result<usize> {
        match minor {
            0 => self
                .procs
                .with_current(|t| t.tty)
                .ok_or(KernelError::NotTty),
            m if (m as usize) <= crate::param::NR_CONSOLES => Ok(m as usize - 1),
            _ => Err(KernelError::NoDevice),
        }
    }

    fn pts_index(&self, minor: u32) -> Result<usize> {
        if (minor as usize) < crate::param::NR_PTYS {
            Ok(crate::param::NR_CONSOLES + minor as usize)
        } else {
            Err(KernelError::NoDevice)
        }
    }

    /// Duplicate `oldfd` into the lowest free slot at or above `least`.
    pub fn do_dup(&self, oldfd: i32, least: usize) -> Result<i32> {
        let fid = self.fd_to_file(oldfd)?;
        let newfd = self.procs.with_current(|t| {
            let slot = t.files.fds[least..NR_OPEN]
                .iter()
                .position(|f| f.is_none())
                .map(|p| p + least)
                .ok_or(KernelError::TooManyOpen)?;
            t.files.fds[slot] = Some(fid);
            t.files.close_on_exec &= !(1 << slot);
            Ok(slot as i32)
        })?;
        self.file_dup(fid);
        Ok(newfd)
    }

    /// dup2/dup3: close `newfd` first if it is open.
    pub fn do_dup2(&self, oldfd: i32, newfd: i32, cloexec: bool) -> Result<i32> {
        let fid = self.fd_to_file(oldfd)?;
        if newfd < 0 || newfd as usize >= NR_OPEN {
            return Err(KernelError::BadFd);
        }
        if oldfd == newfd {
            return Ok(newfd);
        }
        let old = self.procs.with_current(|t| {
            let old = t.files.fds[newfd as usize].take();
            t.files.fds[newfd as usize] = Some(fid);
            if cloexec {
                t.files.close_on_exec |= 1 << newfd;
            } else {
                t.files.close_on_exec &= !(1 << newfd);
            }
            old
        });
        self.file_dup(fid);
        if let Some(old) = old {
            self.file_put(old);
        }
        Ok(newfd)
    }

    /// Close one descriptor of the current task.
    pub fn do_close(&self, fd: i32) -> Result<i32> {
        let fid = self.procs.with_current(|t| {
            let fid = t.files.get(fd)?;
            t.files.fds[fd as usize] = None;
            t.files.close_on_exec &= !(1 << fd);
            Ok(fid)
        })?;
        self.file_put(fid);
        Ok(0)
    }

    /// Create both ends of a pipe; returns (read fd, write fd).
    pub fn do_pipe(&self) -> Result<(i32, i32)> {
        let inode = self.get_pipe_inode()?;
        self.idup(inode);

        let rf = match self.falloc(inode, OpenFlags::O_RDONLY) {
            Ok(rf) => rf,
            Err(e) => {
                self.iput(inode);
                self.iput(inode);
                return Err(e);
            }
        };
        let wf = match self.falloc(inode, OpenFlags::O_WRONLY) {
            Ok(wf) => wf,
            Err(e) => {
                self.file_put(rf);
                self.iput(inode);
                return Err(e);
            }
        };

        let rfd = match self.fd_install(rf, false) {
            Ok(fd) => fd,
            Err(e) => {
                self.file_put(rf);
                self.file_put(wf);
                return Err(e);
            }
        };
        let wfd = match self.fd_install(wf, false) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = self.do_close(rfd);
                self.file_put(wf);
                return Err(e);
            }
        };
        Ok((rfd, wfd))
    }

    /// Wake anyone polling the inode; used by drivers after state
    /// changes visible through the VFS.
    pub fn inode_event(&self, i: IRef) {
        self.task_wakeup_all(Chan::Inode(i.0));
    }
}
