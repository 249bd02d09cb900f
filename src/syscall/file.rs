//! File-attribute and metadata system calls.

use alloc::vec;
use core::convert::TryInto;

use zerocopy::AsBytes;

use crate::{
    error::{KernelError, Result},
    file::OpenFlags,
    fs::{path::AT_FDCWD, path::AT_SYMLINK_NOFOLLOW, S_IALLUGO},
    kernel::Kernel,
};

/// stat64 as copied to userspace.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes)]
pub struct UserStat {
    pub st_dev: u32,
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u32,
    pub st_size: u32,
    pub st_blksize: u32,
    pub st_blocks: u32,
    pub st_atime: u32,
    pub st_mtime: u32,
    pub st_ctime: u32,
}

/// statfs64 as copied to userspace.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes)]
pub struct UserStatFs {
    pub f_type: u32,
    pub f_bsize: u32,
    pub f_blocks: u32,
    pub f_bfree: u32,
    pub f_bavail: u32,
    pub f_files: u32,
    pub f_ffree: u32,
    pub f_namelen: u32,
}

impl Kernel {
    pub fn do_chmod(&self, path: &[u8], mode: u16) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        let now = self.current_time();
        self.with_inode(inode, |d| {
            d.mode = crate::fs::Mode((mode & S_IALLUGO) | (d.mode.0 & !S_IALLUGO));
            d.ctime = now;
            d.dirty = true;
        });
        self.iput(inode);
        Ok(0)
    }

    pub fn do_fchmod(&self, fd: i32, mode: u16) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let inode = self.with_file(fid, |f| f.inode)?;
        let now = self.current_time();
        self.with_inode(inode, |d| {
            d.mode = crate::fs::Mode((mode & S_IALLUGO) | (d.mode.0 & !S_IALLUGO));
            d.ctime = now;
            d.dirty = true;
        });
        Ok(0)
    }

    pub fn do_chown(&self, path: &[u8], owner: u16, group: u16) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        let now = self.current_time();
        self.with_inode(inode, |d| {
            d.uid = owner;
            d.gid = group;
            d.ctime = now;
            d.dirty = true;
        });
        self.iput(inode);
        Ok(0)
    }

    pub fn do_fchown(&self, fd: i32, owner: u16, group: u16) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let inode = self.with_file(fid, |f| f.inode)?;
        let now = self.current_time();
        self.with_inode(inode, |d| {
            d.uid = owner;
            d.gid = group;
            d.ctime = now;
            d.dirty = true;
        });
        Ok(0)
    }

    /// utimensat(2). `times_addr` points at two timespec64 records; a
    /// null pointer means "now".
    pub fn sys_utimensat(
        &self,
        dirfd: i32,
        path_addr: u32,
        times_addr: u32,
        flags: i32,
    ) -> Result<i32> {
        let path = self.fetch_path(path_addr)?;
        let follow = flags & AT_SYMLINK_NOFOLLOW == 0;
        let inode = self.namei(dirfd, &path, follow)?;

        let (atime, mtime) = if times_addr == 0 {
            let now = self.current_time();
            (now, now)
        } else {
            let mut raw = [0u8; 32];
            let read = self
                .procs
                .with_current(|t| t.mm.copy_in(times_addr, &mut raw));
            if let Err(e) = read {
                self.iput(inode);
                return Err(e);
            }
            let atime = u64::from_le_bytes(raw[0..8].try_into().unwrap_or_default()) as u32;
            let mtime = u64::from_le_bytes(raw[16..24].try_into().unwrap_or_default()) as u32;
            (atime, mtime)
        };

        self.with_inode(inode, |d| {
            d.atime = atime;
            d.mtime = mtime;
            d.dirty = true;
        });
        self.iput(inode);
        Ok(0)
    }

    pub fn do_access(&self, path: &[u8], _mode: i32) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        self.iput(inode);
        Ok(0)
    }

    pub fn do_truncate(&self, path: &[u8]) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        let res = (|| {
            let (sb, is_reg) = self.with_inode(inode, |d| (d.sb, d.mode.is_reg()));
            if !is_reg {
                return Err(KernelError::InvalidArg);
            }
            let sb = sb.ok_or(KernelError::InvalidArg)?;
            self.fs_of(sb)?.truncate(self, inode)
        })();
        self.iput(inode);
        res.map(|_| 0)
    }

    pub fn do_ftruncate(&self, fd: i32) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let (flags, inode) = self.with_file(fid, |f| (f.flags, f.inode))?;
        if !flags.writable() {
            return Err(KernelError::BadFd);
        }
        let (sb, is_reg) = self.with_inode(inode, |d| (d.sb, d.mode.is_reg()));
        if !is_reg {
            return Err(KernelError::InvalidArg);
        }
        let sb = sb.ok_or(KernelError::InvalidArg)?;
        self.fs_of(sb)?.truncate(self, inode)?;
        Ok(0)
    }

    fn stat_to_user(&self, stat: crate::fs::stat::Stat, addr: u32) -> Result<i32> {
        let us = UserStat {
            st_dev: stat.dev,
            st_ino: stat.ino,
            st_mode: stat.mode as u32,
            st_nlink: stat.nlink,
            st_uid: stat.uid as u32,
            st_gid: stat.gid as u32,
            st_rdev: stat.rdev,
            st_size: stat.size,
            st_blksize: stat.blksize,
            st_blocks: stat.blocks,
            st_atime: stat.atime,
            st_mtime: stat.mtime,
            st_ctime: stat.ctime,
        };
        self.procs
            .with_current(|t| t.mm.copy_out(addr, us.as_bytes()))?;
        Ok(0)
    }

    pub fn sys_stat(&self, path_addr: u32, stat_addr: u32, follow: bool) -> Result<i32> {
        let path = self.fetch_path(path_addr)?;
        let inode = self.namei(AT_FDCWD, &path, follow)?;
        let stat = self.stat_inode(inode);
        self.iput(inode);
        self.stat_to_user(stat, stat_addr)
    }

    pub fn sys_fstat(&self, fd: i32, stat_addr: u32) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let inode = self.with_file(fid, |f| f.inode)?;
        let stat = self.stat_inode(inode);
        self.stat_to_user(stat, stat_addr)
    }

    /// statx(2), reduced to the classic fields. The mask argument is
    /// accepted and echoed back as what was filled.
    pub fn sys_statx(
        &self,
        dirfd: i32,
        path_addr: u32,
        flags: u32,
        _mask: u32,
        statx_addr: u32,
    ) -> Result<i32> {
        let path = self.fetch_path(path_addr)?;
        let follow = flags & AT_SYMLINK_NOFOLLOW as u32 == 0;
        let inode = if path.is_empty() {
            // AT_EMPTY_PATH form: stat the dirfd itself.
            let fid = self.fd_to_file(dirfd)?;
            let inode = self.with_file(fid, |f| f.inode)?;
            self.idup(inode);
            inode
        } else {
            self.namei(dirfd, &path, follow)?
        };
        let stat = self.stat_inode(inode);
        self.iput(inode);
        self.stat_to_user(stat, statx_addr)
    }

    pub fn sys_statfs(&self, path_addr: u32, buf_addr: u32) -> Result<i32> {
        let path = self.fetch_path(path_addr)?;
        let inode = self.namei(AT_FDCWD, &path, true)?;
        let sb = self.with_inode(inode, |d| d.sb);
        self.iput(inode);
        let sb = sb.ok_or(KernelError::InvalidArg)?;
        let st = self.fs_of(sb)?.statfs(self)?;
        let us = UserStatFs {
            f_type: st.f_type,
            f_bsize: st.bsize,
            f_blocks: st.blocks,
            f_bfree: st.bfree,
            f_bavail: st.bavail,
            f_files: st.files,
            f_ffree: st.ffree,
            f_namelen: st.namelen,
        };
        self.procs
            .with_current(|t| t.mm.copy_out(buf_addr, us.as_bytes()))?;
        Ok(0)
    }

    /// getdents64(2): pack as many records as fit into `count` bytes.
    pub fn sys_getdents64(&self, fd: i32, dirp: u32, count: usize) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let (flags, pos, inode) = self.with_file(fid, |f| (f.flags, f.pos, f.inode))?;
        let _ = flags;
        let (sb, is_dir) = self.with_inode(inode, |d| (d.sb, d.mode.is_dir()));
        if !is_dir {
            return Err(KernelError::NotDir);
        }
        let sb = sb.ok_or(KernelError::InvalidArg)?;

        let mut out = vec![0u8; count.min(crate::syscall::IO_CHUNK_DENTS)];
        let mut filled = 0usize;
        let new_pos = self.fs_of(sb)?.getdents(self, inode, pos, &mut |ino, dtype, name| {
            // dirent64: ino, off, reclen, type, name NUL, padded to 8.
            let reclen = (8 + 8 + 2 + 1 + name.len() + 1 + 7) & !7;
            if filled + reclen > out.len() {
                return false;
            }
            out[filled..filled + 8].copy_from_slice(&(ino as u64).to_le_bytes());
            out[filled + 8..filled + 16].copy_from_slice(&0u64.to_le_bytes());
            out[filled + 16..filled + 18].copy_from_slice(&(reclen as u16).to_le_bytes());
            out[filled + 18] = dtype;
            out[filled + 19..filled + 19 + name.len()].copy_from_slice(name);
            out[filled + 19 + name.len()] = 0;
            filled += reclen;
            true
        })?;

        self.with_file(fid, |f| f.pos = new_pos)?;
        self.procs
            .with_current(|t| t.mm.copy_out(dirp, &out[..filled]))?;
        Ok(filled as i32)
    }

    /// fcntl-style flag query used by the ioctl layer for O_NONBLOCK.
    pub fn fd_flags(&self, fd: i32) -> Result<OpenFlags> {
        let fid = self.fd_to_file(fd)?;
        self.with_file(fid, |f| f.flags)
    }
}
