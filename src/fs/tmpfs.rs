//! In-memory file system.
//!
//! Nodes live entirely in kernel memory: regular files keep their
//! contents in a growable byte vector, directories keep an explicit
//! (name, ino) list. The /dev tree is an instance of this driver with
//! device nodes created over mknod.

use alloc::{vec, vec::Vec};

use spin::Mutex;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    fs::{stat::StatFs, FileSystem, IRef, InodeData, Mode, S_IFDIR, S_IFLNK},
    kernel::Kernel,
    param::{BLOCK_SIZE, MAX_NAME},
};

pub const TMPFS_MAGIC: u32 = 0x0102_1994;

struct TmpNode {
    mode: Mode,
    uid: u16,
    gid: u16,
    nlinks: u8,
    rdev: u32,
    atime: u32,
    mtime: u32,
    ctime: u32,
    data: Vec<u8>,
    /// Directory entries; empty for other kinds.
    children: Vec<(Vec<u8>, u32)>,
}

impl TmpNode {
    fn new(mode: Mode, uid: u16, gid: u16, now: u32) -> Self {
        Self {
            mode,
            uid,
            gid,
            nlinks: 1,
            rdev: 0,
            atime: now,
            mtime: now,
            ctime: now,
            data: Vec::new(),
            children: Vec::new(),
        }
    }
}

pub struct TmpFs {
    nodes: Mutex<Vec<Option<TmpNode>>>,
}

impl TmpFs {
    pub fn new() -> Self {
        let mut root = TmpNode::new(Mode(S_IFDIR | 0o755), 0, 0, 0);
        root.nlinks = 2;
        Self {
            nodes: Mutex::new(vec![Some(root)]),
        }
    }

    fn alloc_node(&self, node: TmpNode) -> u32 {
        let mut nodes = self.nodes.lock();
        match nodes.iter().position(|n| n.is_none()) {
            Some(idx) => {
                nodes[idx] = Some(node);
                idx as u32 + 1
            }
            None => {
                nodes.push(Some(node));
                nodes.len() as u32
            }
        }
    }

    fn with_node<R>(&self, ino: u32, f: impl FnOnce(&mut TmpNode) -> R) -> Result<R> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(ino.wrapping_sub(1) as usize)
            .and_then(|n| n.as_mut())
            .ok_or(KernelError::NoEntry)?;
        Ok(f(node))
    }

    fn find_child(&self, dir: u32, name: &[u8]) -> Result<Option<u32>> {
        self.with_node(dir, |n| {
            if !n.mode.is_dir() {
                return Err(KernelError::NotDir);
            }
            Ok(n.children
                .iter()
                .find(|(cname, _)| cname.as_slice() == name)
                .map(|(_, ino)| *ino))
        })?
    }

    fn make_node(
        &self,
        k: &Kernel,
        dir: IRef,
        name: &[u8],
        mode: Mode,
        rdev: DevT,
    ) -> Result<u32> {
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(KernelError::NameTooLong);
        }
        let dir_ino = k.ino_of(dir);
        if self.find_child(dir_ino, name)?.is_some() {
            return Err(KernelError::Exists);
        }
        let (uid, gid) = k.procs.with_current(|t| (t.euid, t.egid));
        let mut node = TmpNode::new(mode, uid, gid, k.current_time());
        node.rdev = rdev.0;
        if mode.is_dir() {
            node.nlinks = 2;
        }
        let ino = self.alloc_node(node);
        self.with_node(dir_ino, |n| {
            n.children.push((name.to_vec(), ino));
            if mode.is_dir() {
                n.nlinks += 1;
            }
        })?;
        // The cached parent inode mirrors the link count.
        if mode.is_dir() {
            k.with_inode(dir, |d| d.nlinks += 1);
        }
        Ok(ino)
    }
}

impl FileSystem for TmpFs {
    fn kind(&self) -> &'static str {
        "tmpfs"
    }

    fn magic(&self) -> u32 {
        TMPFS_MAGIC
    }

    fn root_ino(&self) -> u32 {
        1
    }

    fn read_inode(&self, _k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        self.with_node(ino, |n| {
            d.mode = n.mode;
            d.uid = n.uid;
            d.gid = n.gid;
            d.size = n.data.len() as u32;
            d.atime = n.atime;
            d.mtime = n.mtime;
            d.ctime = n.ctime;
            d.nlinks = n.nlinks;
            d.zones = [0; 12];
            d.zones[0] = n.rdev;
            d.dirty = false;
        })
    }

    fn write_inode(&self, _k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        self.with_node(ino, |n| {
            n.mode = d.mode;
            n.uid = d.uid;
            n.gid = d.gid;
            n.nlinks = d.nlinks;
            n.rdev = d.zones[0];
            n.atime = d.atime;
            n.mtime = d.mtime;
            n.ctime = d.ctime;
        })
    }

    fn free_inode(&self, _k: &Kernel, ino: u32, _d: &mut InodeData) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if let Some(slot) = nodes.get_mut(ino.wrapping_sub(1) as usize) {
            *slot = None;
        }
        Ok(())
    }

    fn statfs(&self, _k: &Kernel) -> Result<StatFs> {
        let nodes = self.nodes.lock();
        let used: u32 = nodes
            .iter()
            .flatten()
            .map(|n| ((n.data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32)
            .sum();
        Ok(StatFs {
            f_type: TMPFS_MAGIC,
            bsize: BLOCK_SIZE as u32,
            blocks: used,
            bfree: 0,
            bavail: 0,
            files: nodes.iter().flatten().count() as u32,
            ffree: 0,
            namelen: MAX_NAME as u32,
        })
    }

    fn lookup(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<u32> {
        let dir_ino = k.ino_of(dir);
        if name == b"." {
            return Ok(dir_ino);
        }
        if name == b".." {
            // Parent scan; the root is its own parent.
            let nodes = self.nodes.lock();
            for (idx, node) in nodes.iter().enumerate() {
                if let Some(n) = node {
                    if n.children.iter().any(|(_, ino)| *ino == dir_ino) {
                        return Ok(idx as u32 + 1);
                    }
                }
            }
            return Ok(1);
        }
        self.find_child(dir_ino, name)?.ok_or(KernelError::NoEntry)
    }

    fn create(&self, k: &Kernel, dir: IRef, name: &[u8], mode: Mode, rdev: DevT) -> Result<u32> {
        self.make_node(k, dir, name, mode, rdev)
    }

    fn link(&self, k: &Kernel, dir: IRef, name: &[u8], target: IRef) -> Result<()> {
        let dir_ino = k.ino_of(dir);
        if self.find_child(dir_ino, name)?.is_some() {
            return Err(KernelError::Exists);
        }
        let target_ino = k.ino_of(target);
        self.with_node(target_ino, |n| n.nlinks += 1)?;
        self.with_node(dir_ino, |n| n.children.push((name.to_vec(), target_ino)))?;
        k.with_inode(target, |d| {
            d.nlinks += 1;
            d.dirty = true;
        });
        Ok(())
    }

    fn unlink(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
        let dir_ino = k.ino_of(dir);
        let ino = self
            .find_child(dir_ino, name)?
            .ok_or(KernelError::NoEntry)?;
        if self.with_node(ino, |n| n.mode.is_dir())? {
            return Err(KernelError::IsDir);
        }
        self.with_node(dir_ino, |n| {
            n.children.retain(|(cname, _)| cname.as_slice() != name)
        })?;
        let nlinks = self.with_node(ino, |n| {
            n.nlinks = n.nlinks.saturating_sub(1);
            n.nlinks
        })?;
        // If the inode is cached, mirror the new link count there.
        if let Some(sb) = k.with_inode(dir, |d| d.sb) {
            if let Ok(cached) = k.iget(sb, ino) {
                k.with_inode(cached, |d| d.nlinks = nlinks);
                k.iput(cached);
            }
        }
        Ok(())
    }

    fn symlink(&self, k: &Kernel, dir: IRef, name: &[u8], target: &[u8]) -> Result<()> {
        let ino = self.make_node(k, dir, name, Mode(S_IFLNK | 0o777), DevT(0))?;
        self.with_node(ino, |n| n.data = target.to_vec())?;
        Ok(())
    }

    fn mkdir(&self, k: &Kernel, dir: IRef, name: &[u8], mode: Mode) -> Result<()> {
        self.make_node(k, dir, name, Mode(S_IFDIR | mode.perms()), DevT(0))
            .map(|_| ())
    }

    fn rmdir(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
        let dir_ino = k.ino_of(dir);
        let ino = self
            .find_child(dir_ino, name)?
            .ok_or(KernelError::NoEntry)?;
        let (is_dir, empty) = self.with_node(ino, |n| (n.mode.is_dir(), n.children.is_empty()))?;
        if !is_dir {
            return Err(KernelError::NotDir);
        }
        if !empty {
            return Err(KernelError::NotEmpty);
        }
        self.with_node(dir_ino, |n| {
            n.children.retain(|(cname, _)| cname.as_slice() != name);
            n.nlinks = n.nlinks.saturating_sub(1);
        })?;
        self.with_node(ino, |n| n.nlinks = 0)?;
        k.with_inode(dir, |d| d.nlinks = d.nlinks.saturating_sub(1));
        Ok(())
    }

    fn rename(
        &self,
        k: &Kernel,
        olddir: IRef,
        oldname: &[u8],
        newdir: IRef,
        newname: &[u8],
    ) -> Result<()> {
        let old_ino = k.ino_of(olddir);
        let new_ino = k.ino_of(newdir);
        let ino = self
            .find_child(old_ino, oldname)?
            .ok_or(KernelError::NoEntry)?;
        if let Some(existing) = self.find_child(new_ino, newname)? {
            if existing == ino {
                return Ok(());
            }
            self.unlink(k, newdir, newname)?;
        }
        self.with_node(old_ino, |n| {
            n.children.retain(|(cname, _)| cname.as_slice() != oldname)
        })?;
        self.with_node(new_ino, |n| n.children.push((newname.to_vec(), ino)))?;
        Ok(())
    }

    fn readlink(&self, k: &Kernel, i: IRef, buf: &mut [u8]) -> Result<usize> {
        let ino = k.ino_of(i);
        self.with_node(ino, |n| {
            if !n.mode.is_lnk() {
                return Err(KernelError::InvalidArg);
            }
            let count = buf.len().min(n.data.len());
            buf[..count].copy_from_slice(&n.data[..count]);
            Ok(count)
        })?
    }

    fn truncate(&self, k: &Kernel, i: IRef) -> Result<()> {
        let ino = k.ino_of(i);
        self.with_node(ino, |n| n.data.clear())?;
        k.with_inode(i, |d| {
            d.size = 0;
            d.dirty = true;
        });
        Ok(())
    }

    fn read(&self, k: &Kernel, i: IRef, off: u32, buf: &mut [u8]) -> Result<usize> {
        let ino = k.ino_of(i);
        self.with_node(ino, |n| {
            let off = off as usize;
            if off >= n.data.len() {
                return 0;
            }
            let count = buf.len().min(n.data.len() - off);
            buf[..count].copy_from_slice(&n.data[off..off + count]);
            count
        })
    }

    fn write(&self, k: &Kernel, i: IRef, off: u32, data: &[u8]) -> Result<usize> {
        let ino = k.ino_of(i);
        let now = k.current_time();
        let new_size = self.with_node(ino, |n| {
            let off = off as usize;
            if n.data.len() < off + data.len() {
                n.data.resize(off + data.len(), 0);
            }
            n.data[off..off + data.len()].copy_from_slice(data);
            n.mtime = now;
            n.data.len() as u32
        })?;
        k.with_inode(i, |d| {
            d.size = new_size;
            d.mtime = now;
        });
        Ok(data.len())
    }

    fn getdents(
        &self,
        k: &Kernel,
        i: IRef,
        pos: u32,
        emit: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
    ) -> Result<u32> {
        let dir_ino = k.ino_of(i);
        // Positions 0 and 1 are the synthetic dot entries.
        let entries: Vec<(Vec<u8>, u32)> = self.with_node(dir_ino, |n| {
            if !n.mode.is_dir() {
                return Err(KernelError::NotDir);
            }
            Ok(n.children.clone())
        })??;

        let mut index = pos;
        loop {
            let i = index as usize;
            let (name, ino): (&[u8], u32) = match i {
                0 => (b".", dir_ino),
                1 => (b"..", dir_ino),
                n if n - 2 < entries.len() => {
                    (entries[n - 2].0.as_slice(), entries[n - 2].1)
                }
                _ => break,
            };
            index += 1;
            if !emit(ino, 0, name) {
                break;
            }
        }
        Ok(index)
    }
}
