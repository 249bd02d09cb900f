//! Path resolution.
//!
//! `namei` walks a path component by component through the driver
//! `lookup` op, following symlinks to a fixed depth and crossing mount
//! points transparently. `open_namei` adds the open(2) flag semantics
//! on the final component.

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    file::OpenFlags,
    fs::{IRef, Mode, S_IALLUGO, S_IFDIR, S_IFREG},
    kernel::Kernel,
    param::{MAX_NAME, MAX_PATH, MAX_SYMLINKS},
};

/// Openat dirfd value naming the current working directory.
pub const AT_FDCWD: i32 = -100;
/// utimensat/fstatat flag: do not follow a final symlink.
pub const AT_SYMLINK_NOFOLLOW: i32 = 0x100;

fn skip_slashes(p: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < p.len() && p[i] == b'/' {
        i += 1;
    }
    &p[i..]
}

fn next_component(p: &[u8]) -> (&[u8], &[u8]) {
    match p.iter().position(|c| *c == b'/') {
        Some(pos) => (&p[..pos], &p[pos..]),
        None => (p, &p[p.len()..]),
    }
}

impl Kernel {
    /// Starting inode of a walk: the task root for absolute paths, the
    /// cwd or the dirfd directory otherwise. Returns a held reference.
    fn walk_start(&self, dirfd: i32, path: &[u8]) -> Result<IRef> {
        let start = if path.first() == Some(&b'/') {
            self.procs
                .with_current(|t| t.fs.root)
                .or_else(|| self.root_inode().ok())
        } else if dirfd == AT_FDCWD {
            self.procs.with_current(|t| t.fs.cwd)
        } else {
            let fid = self.fd_to_file(dirfd)?;
            Some(self.with_file(fid, |f| f.inode)?)
        };
        let start = start.ok_or(KernelError::NoEntry)?;
        self.idup(start);
        Ok(start)
    }

    /// Walk `path` from `cur` (owned reference). `follow_last` gates
    /// following a symlink in the final component.
    fn resolve(&self, mut cur: IRef, path: &[u8], follow_last: bool, depth: usize) -> Result<IRef> {
        if path.len() > MAX_PATH {
            self.iput(cur);
            return Err(KernelError::NameTooLong);
        }
        let mut rest = skip_slashes(path);

        loop {
            if rest.is_empty() {
                return Ok(cur);
            }
            let (name, after) = next_component(rest);
            let after_trimmed = skip_slashes(after);
            let is_last = after_trimmed.is_empty();

            if name.len() > MAX_NAME {
                self.iput(cur);
                return Err(KernelError::NameTooLong);
            }
            let (is_dir, sb) = self.with_inode(cur, |d| (d.mode.is_dir(), d.sb));
            if !is_dir {
                self.iput(cur);
                return Err(KernelError::NotDir);
            }
            let sb = match sb {
                Some(sb) => sb,
                None => {
                    self.iput(cur);
                    return Err(KernelError::NoEntry);
                }
            };

            let fs = match self.fs_of(sb) {
                Ok(fs) => fs,
                Err(e) => {
                    self.iput(cur);
                    return Err(e);
                }
            };
            let ino = match fs.lookup(self, cur, name) {
                Ok(ino) => ino,
                Err(e) => {
                    self.iput(cur);
                    return Err(e);
                }
            };
            let next = match self.iget(sb, ino) {
                Ok(next) => next,
                Err(e) => {
                    self.iput(cur);
                    return Err(e);
                }
            };
            let next = self.cross_mount(next);

            let next_is_link = self.with_inode(next, |d| d.mode.is_lnk());
            if next_is_link && (!is_last || follow_last) {
                if depth >= MAX_SYMLINKS {
                    self.iput(cur);
                    self.iput(next);
                    return Err(KernelError::Loop);
                }
                let mut target = [0u8; MAX_PATH];
                let next_sb = self.with_inode(next, |d| d.sb).unwrap_or(sb);
                let n = {
                    let fs = match self.fs_of(next_sb) {
                        Ok(fs) => fs,
                        Err(e) => {
                            self.iput(cur);
                            self.iput(next);
                            return Err(e);
                        }
                    };
                    match fs.readlink(self, next, &mut target) {
                        Ok(n) => n,
                        Err(e) => {
                            self.iput(cur);
                            self.iput(next);
                            return Err(e);
                        }
                    }
                };
                self.iput(next);

                let start = if target.first() == Some(&b'/') {
                    self.iput(cur);
                    let root = self
                        .procs
                        .with_current(|t| t.fs.root)
                        .or_else(|| self.root_inode().ok())
                        .ok_or(KernelError::NoEntry)?;
                    self.idup(root);
                    root
                } else {
                    cur
                };
                cur = self.resolve(start, &target[..n], true, depth + 1)?;
                rest = after_trimmed;
                continue;
            }

            self.iput(cur);
            cur = next;
            rest = after_trimmed;
        }
    }

    /// Name-to-inode resolution. Returns a held reference.
    pub fn namei(&self, dirfd: i32, path: &[u8], follow_links: bool) -> Result<IRef> {
        if path.is_empty() {
            return Err(KernelError::NoEntry);
        }
        let start = self.walk_start(dirfd, path)?;
        self.resolve(start, path, follow_links, 0)
    }

    /// Resolve everything but the last component. Returns the parent
    /// directory (held) and the final name within `path`.
    pub fn namei_parent<'p>(&self, dirfd: i32, path: &'p [u8]) -> Result<(IRef, &'p [u8])> {
        if path.is_empty() {
            return Err(KernelError::NoEntry);
        }
        // Strip trailing slashes; "mkdir /a/" names "a".
        let mut end = path.len();
        while end > 0 && path[end - 1] == b'/' {
            end -= 1;
        }
        let trimmed = &path[..end];
        let split = trimmed
            .iter()
            .rposition(|c| *c == b'/')
            .map(|p| p + 1)
            .unwrap_or(0);
        let (dirpart, name) = (&path[..split], &trimmed[split..]);

        let start = self.walk_start(dirfd, path)?;
        let dir = self.resolve(start, dirpart, true, 0)?;
        let is_dir = self.with_inode(dir, |d| d.mode.is_dir());
        if !is_dir {
            self.iput(dir);
            return Err(KernelError::NotDir);
        }
        Ok((dir, name))
    }

    /// Resolve a path for open(2): creation, exclusivity, truncation
    /// and symlink handling on the final component.
    pub fn open_namei(&self, dirfd: i32, path: &[u8], flags: OpenFlags, mode: Mode) -> Result<IRef> {
        let (dir, name) = self.namei_parent(dirfd, path)?;
        if name.is_empty() || name == b"." || name == b".." {
            // Opening a directory by its own name.
            let inode = if name.is_empty() {
                dir
            } else {
                let resolved = self.resolve(dir, name, true, 0)?;
                resolved
            };
            if flags.writable() {
                self.iput(inode);
                return Err(KernelError::IsDir);
            }
            return Ok(inode);
        }

        let sb = match self.with_inode(dir, |d| d.sb) {
            Some(sb) => sb,
            None => {
                self.iput(dir);
                return Err(KernelError::NoEntry);
            }
        };
        let fs = self.fs_of(sb)?;

        let inode = match fs.lookup(self, dir, name) {
            Ok(ino) => {
                if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
                    self.iput(dir);
                    return Err(KernelError::Exists);
                }
                let next = match self.iget(sb, ino) {
                    Ok(next) => next,
                    Err(e) => {
                        self.iput(dir);
                        return Err(e);
                    }
                };
                let next = self.cross_mount(next);
                let is_link = self.with_inode(next, |d| d.mode.is_lnk());
                if is_link {
                    if flags.contains(OpenFlags::O_NOFOLLOW) {
                        self.iput(dir);
                        self.iput(next);
                        return Err(KernelError::Loop);
                    }
                    // Re-resolve through the link; `resolve` consumes dir.
                    self.iput(next);
                    return self.resolve(dir, name, true, 0);
                }
                next
            }
            Err(KernelError::NoEntry) if flags.contains(OpenFlags::O_CREAT) => {
                let umask = self.procs.with_current(|t| t.fs.umask);
                let perms = mode.perms() & !umask;
                match fs.create(self, dir, name, Mode(S_IFREG | perms), DevT(0)) {
                    Ok(ino) => match self.iget(sb, ino) {
                        Ok(next) => next,
                        Err(e) => {
                            self.iput(dir);
                            return Err(e);
                        }
                    },
                    Err(e) => {
                        self.iput(dir);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.iput(dir);
                return Err(e);
            }
        };
        self.iput(dir);

        let imode = self.with_inode(inode, |d| d.mode);
        if flags.contains(OpenFlags::O_DIRECTORY) && !imode.is_dir() {
            self.iput(inode);
            return Err(KernelError::NotDir);
        }
        if imode.is_dir() && flags.writable() {
            self.iput(inode);
            return Err(KernelError::IsDir);
        }
        if flags.contains(OpenFlags::O_TRUNC) && flags.writable() && imode.is_reg() {
            let sb = self.with_inode(inode, |d| d.sb);
            if let Some(sb) = sb {
                self.fs_of(sb)?.truncate(self, inode)?;
            }
        }
        Ok(inode)
    }

    /// Open a file on the lowest free descriptor of the current task.
    pub fn do_open(&self, dirfd: i32, path: &[u8], flags: OpenFlags, mode: Mode) -> Result<i32> {
        // Reserve the descriptor slot first, as the original does: a
        // full table fails before any allocation.
        self.procs
            .with_current(|t| t.files.alloc_fd().map(|_| ()))?;

        let inode = self.open_namei(dirfd, path, flags, mode)?;

        // FIFOs opened through the file system get their ring on first
        // use.
        let is_fifo = self.with_inode(inode, |d| {
            if d.mode.is_fifo() {
                if let crate::fs::Special::None = d.special {
                    d.special = crate::fs::Special::Pipe(alloc::boxed::Box::new(
                        crate::pipe::Pipe::new(),
                    ));
                }
                true
            } else {
                false
            }
        });
        if is_fifo {
            self.with_inode(inode, |d| {
                if let crate::fs::Special::Pipe(p) = &mut d.special {
                    if flags.readable() {
                        p.readers += 1;
                    }
                    if flags.writable() {
                        p.writers += 1;
                    }
                }
            });
        }

        let fid = match self.falloc(inode, flags) {
            Ok(fid) => fid,
            Err(e) => {
                self.iput(inode);
                return Err(e);
            }
        };
        // The description owns the inode reference now; drop it on any
        // failure below.
        let fid = scopeguard::guard(fid, |fid| self.file_put(fid));

        // Opening a pty master allocates a fresh pair.
        let rdev = self.with_inode(inode, |d| {
            if d.mode.is_chr() {
                d.rdev()
            } else {
                DevT(0)
            }
        });
        if rdev == crate::dev::DEV_PTMX {
            let master = self.ptmx_open()?;
            self.with_file(*fid, |f| f.priv_tty = Some(master))?;
        }

        let fd = self.fd_install(*fid, flags.contains(OpenFlags::O_CLOEXEC))?;
        let _ = scopeguard::ScopeGuard::into_inner(fid);
        Ok(fd)
    }

    pub fn do_mkdir(&self, dirfd: i32, path: &[u8], mode: Mode) -> Result<i32> {
        let (dir, name) = self.namei_parent(dirfd, path)?;
        if name.is_empty() {
            self.iput(dir);
            return Err(KernelError::Exists);
        }
        let res = (|| {
            let sb = self.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
            let umask = self.procs.with_current(|t| t.fs.umask);
            self.fs_of(sb)?
                .mkdir(self, dir, name, Mode(S_IFDIR | (mode.perms() & !umask)))
        })();
        self.iput(dir);
        res.map(|_| 0)
    }

    pub fn do_rmdir(&self, dirfd: i32, path: &[u8]) -> Result<i32> {
        let (dir, name) = self.namei_parent(dirfd, path)?;
        let res = (|| {
            let sb = self.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?.rmdir(self, dir, name)
        })();
        self.iput(dir);
        res.map(|_| 0)
    }

    pub fn do_unlink(&self, dirfd: i32, path: &[u8]) -> Result<i32> {
        let (dir, name) = self.namei_parent(dirfd, path)?;
        let res = (|| {
            let sb = self.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?.unlink(self, dir, name)
        })();
        self.iput(dir);
        res.map(|_| 0)
    }

    pub fn do_link(
        &self,
        olddirfd: i32,
        oldpath: &[u8],
        newdirfd: i32,
        newpath: &[u8],
    ) -> Result<i32> {
        let target = self.namei(olddirfd, oldpath, false)?;
        let (dir, name) = match self.namei_parent(newdirfd, newpath) {
            Ok(x) => x,
            Err(e) => {
                self.iput(target);
                return Err(e);
            }
        };
        let res = (|| {
            let (tsb, is_dir) = self.with_inode(target, |d| (d.sb, d.mode.is_dir()));
            if is_dir {
                return Err(KernelError::PermissionDenied);
            }
            let dsb = self.with_inode(dir, |d| d.sb);
            if tsb != dsb {
                return Err(KernelError::CrossDevice);
            }
            let sb = dsb.ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?.link(self, dir, name, target)
        })();
        self.iput(dir);
        self.iput(target);
        res.map(|_| 0)
    }

    pub fn do_symlink(&self, target: &[u8], newdirfd: i32, linkpath: &[u8]) -> Result<i32> {
        if target.is_empty() || target.len() > MAX_PATH {
            return Err(KernelError::InvalidArg);
        }
        let (dir, name) = self.namei_parent(newdirfd, linkpath)?;
        let res = (|| {
            let sb = self.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?.symlink(self, dir, name, target)
        })();
        self.iput(dir);
        res.map(|_| 0)
    }

    pub fn do_readlink(&self, dirfd: i32, path: &[u8], buf: &mut [u8]) -> Result<usize> {
        let inode = self.namei(dirfd, path, false)?;
        let res = (|| {
            let (sb, is_lnk) = self.with_inode(inode, |d| (d.sb, d.mode.is_lnk()));
            if !is_lnk {
                return Err(KernelError::InvalidArg);
            }
            let sb = sb.ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?.readlink(self, inode, buf)
        })();
        self.iput(inode);
        res
    }

    pub fn do_mknod(&self, dirfd: i32, path: &[u8], mode: Mode, rdev: DevT) -> Result<i32> {
        let (dir, name) = self.namei_parent(dirfd, path)?;
        let res = (|| {
            let sb = self.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
            let umask = self.procs.with_current(|t| t.fs.umask);
            let mode = Mode((mode.0 & !S_IALLUGO) | (mode.perms() & !umask));
            self.fs_of(sb)?
                .create(self, dir, name, mode, rdev)
                .map(|_| ())
        })();
        self.iput(dir);
        res.map(|_| 0)
    }

    pub fn do_rename(
        &self,
        olddirfd: i32,
        oldpath: &[u8],
        newdirfd: i32,
        newpath: &[u8],
    ) -> Result<i32> {
        let (olddir, oldname) = self.namei_parent(olddirfd, oldpath)?;
        let (newdir, newname) = match self.namei_parent(newdirfd, newpath) {
            Ok(x) => x,
            Err(e) => {
                self.iput(olddir);
                return Err(e);
            }
        };
        let res = (|| {
            let osb = self.with_inode(olddir, |d| d.sb);
            let nsb = self.with_inode(newdir, |d| d.sb);
            if osb != nsb {
                return Err(KernelError::CrossDevice);
            }
            let sb = osb.ok_or(KernelError::NoEntry)?;
            self.fs_of(sb)?
                .rename(self, olddir, oldname, newdir, newname)
        })();
        self.iput(newdir);
        self.iput(olddir);
        res.map(|_| 0)
    }

    pub fn do_chdir(&self, path: &[u8]) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        if !self.with_inode(inode, |d| d.mode.is_dir()) {
            self.iput(inode);
            return Err(KernelError::NotDir);
        }
        let old = self.procs.with_current(|t| t.fs.cwd.replace(inode));
        if let Some(old) = old {
            self.iput(old);
        }
        Ok(0)
    }

    pub fn do_chroot(&self, path: &[u8]) -> Result<i32> {
        let inode = self.namei(AT_FDCWD, path, true)?;
        if !self.with_inode(inode, |d| d.mode.is_dir()) {
            self.iput(inode);
            return Err(KernelError::NotDir);
        }
        let old = self.procs.with_current(|t| t.fs.root.replace(inode));
        if let Some(old) = old {
            self.iput(old);
        }
        Ok(0)
    }

    /// Rebuild the cwd path by walking `..` upward and scanning each
    /// parent for the child's inode number.
    pub fn do_getcwd(&self, buf: &mut [u8]) -> Result<usize> {
        let cwd = self
            .procs
            .with_current(|t| t.fs.cwd)
            .ok_or(KernelError::NoEntry)?;
        let root = self
            .procs
            .with_current(|t| t.fs.root)
            .or_else(|| self.root_inode().ok())
            .ok_or(KernelError::NoEntry)?;

        let mut names: alloc::vec::Vec<alloc::vec::Vec<u8>> = alloc::vec::Vec::new();
        self.idup(cwd);
        let mut cur = cwd;

        while cur != root {
            let sb = match self.with_inode(cur, |d| d.sb) {
                Some(sb) => sb,
                None => break,
            };
            let fs = self.fs_of(sb)?;
            let my_ino = self.ino_of(cur);
            let parent_ino = match fs.lookup(self, cur, b"..") {
                Ok(ino) => ino,
                Err(_) => break,
            };
            let parent = self.iget(sb, parent_ino)?;
            if parent == cur {
                // Filesystem root that is not the task root.
                self.iput(parent);
                break;
            }
            let mut name: alloc::vec::Vec<u8> = alloc::vec::Vec::new();
            let _ = fs.getdents(self, parent, 0, &mut |ino, _t, n| {
                if ino == my_ino {
                    name = n.to_vec();
                    false
                } else {
                    true
                }
            });
            names.push(name);
            self.iput(cur);
            cur = parent;
        }
        self.iput(cur);

        let mut out = alloc::vec::Vec::new();
        if names.is_empty() {
            out.push(b'/');
        }
        for name in names.iter().rev() {
            out.push(b'/');
            out.extend_from_slice(name);
        }
        if out.len() + 1 > buf.len() {
            return Err(KernelError::Range);
        }
        buf[..out.len()].copy_from_slice(&out);
        buf[out.len()] = 0;
        Ok(out.len() + 1)
    }
}
