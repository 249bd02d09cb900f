//! Virtual file system core.
//!
//! In-memory inodes live in a fixed cache keyed by (mount, ino). A
//! mounted file system is a `FileSystem` trait object plus a held
//! reference to its root inode; the trait is the operations vtable, and
//! every default method body answers NotSupported, which is how a
//! driver leaves a slot empty.
//!
//! `iget` returns a referenced inode, reading it through the owning
//! driver on a miss. `iput` undoes one reference; the last put writes a
//! dirty inode back, frees the disk inode when its link count dropped
//! to zero, and keeps the slot cached otherwise for future hits.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    fs::stat::{Stat, StatFs},
    kernel::Kernel,
    param::{BLOCK_SIZE, NR_INODE, NR_MOUNT},
    pipe::Pipe,
};

pub mod devfs;
pub mod minix;
pub mod path;
pub mod procfs;
pub mod stat;
pub mod tmpfs;

/// File mode: type bits in the top nibble, permissions below.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Mode(pub u16);

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IALLUGO: u16 = 0o7777;

impl Mode {
    pub const fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub fn is_dir(self) -> bool {
        self.0 & S_IFMT == S_IFDIR
    }

    pub fn is_reg(self) -> bool {
        self.0 & S_IFMT == S_IFREG
    }

    pub fn is_chr(self) -> bool {
        self.0 & S_IFMT == S_IFCHR
    }

    pub fn is_blk(self) -> bool {
        self.0 & S_IFMT == S_IFBLK
    }

    pub fn is_lnk(self) -> bool {
        self.0 & S_IFMT == S_IFLNK
    }

    pub fn is_fifo(self) -> bool {
        self.0 & S_IFMT == S_IFIFO
    }

    pub fn is_sock(self) -> bool {
        self.0 & S_IFMT == S_IFSOCK
    }

    pub fn perms(self) -> u16 {
        self.0 & S_IALLUGO
    }
}

/// Anything fs-drivers don't describe with plain fields.
pub enum Special {
    None,
    /// FIFO storage; also used by the pipe syscall pair.
    Pipe(Box<Pipe>),
    /// Bound socket slot.
    Socket(usize),
}

/// In-memory inode contents. The `zones` array is the driver-private
/// union: Minix block pointers, or the packed device id in slot 0 for
/// device nodes.
pub struct InodeData {
    pub mode: Mode,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub nlinks: u8,
    pub zones: [u32; 12],
    pub dirty: bool,
    /// Owning mount index; None for anonymous inodes (pipes, sockets).
    pub sb: Option<usize>,
    /// Device the file system lives on.
    pub dev: DevT,
    pub special: Special,
}

impl InodeData {
    pub(crate) fn empty() -> Self {
        Self {
            mode: Mode(0),
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlinks: 0,
            zones: [0; 12],
            dirty: false,
            sb: None,
            dev: DevT(0),
            special: Special::None,
        }
    }

    /// Device id of a character/block device node.
    pub fn rdev(&self) -> DevT {
        DevT(self.zones[0])
    }

    pub fn set_rdev(&mut self, dev: DevT) {
        self.zones[0] = dev.0;
    }
}

/// Index handle into the inode cache. Holders own one reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IRef(pub usize);

struct SlotMeta {
    refs: u32,
    used: bool,
    /// (mount index, inode number); None while anonymous.
    key: Option<(usize, u32)>,
    ino: u32,
}

pub struct InodeCache {
    table: Mutex<Vec<SlotMeta>>,
    slots: Vec<Mutex<InodeData>>,
}

impl InodeCache {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(NR_INODE);
        let mut slots = Vec::with_capacity(NR_INODE);
        for _ in 0..NR_INODE {
            table.push(SlotMeta {
                refs: 0,
                used: false,
                key: None,
                ino: 0,
            });
            slots.push(Mutex::new(InodeData::empty()));
        }
        Self {
            table: Mutex::new(table),
            slots,
        }
    }

    /// Reference count of a cached inode; debug and test inspection.
    pub fn refs(&self, i: IRef) -> u32 {
        self.table.lock()[i.0].refs
    }
}

/// Operations vtable of one file system driver. Directory entry names
/// arrive as byte slices without NUL. Default bodies report the missing
/// slot.
pub trait FileSystem: Send + Sync {
    fn kind(&self) -> &'static str;

    fn magic(&self) -> u32 {
        0
    }

    fn root_ino(&self) -> u32;

    fn read_inode(&self, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()>;

    fn write_inode(&self, _k: &Kernel, _ino: u32, _d: &mut InodeData) -> Result<()> {
        Ok(())
    }

    /// Release pinned resources at unmount.
    fn put_super(&self, _k: &Kernel) {}

    /// Release the on-disk inode once its link count and reference count
    /// both reached zero.
    fn free_inode(&self, _k: &Kernel, _ino: u32, _d: &mut InodeData) -> Result<()> {
        Ok(())
    }

    fn statfs(&self, _k: &Kernel) -> Result<StatFs> {
        Err(KernelError::NotSupported)
    }

    /// Name lookup in a directory; returns the inode number.
    fn lookup(&self, _k: &Kernel, _dir: IRef, _name: &[u8]) -> Result<u32> {
        Err(KernelError::NotSupported)
    }

    fn create(
        &self,
        _k: &Kernel,
        _dir: IRef,
        _name: &[u8],
        _mode: Mode,
        _rdev: DevT,
    ) -> Result<u32> {
        Err(KernelError::NotSupported)
    }

    fn link(&self, _k: &Kernel, _dir: IRef, _name: &[u8], _target: IRef) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn unlink(&self, _k: &Kernel, _dir: IRef, _name: &[u8]) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn symlink(&self, _k: &Kernel, _dir: IRef, _name: &[u8], _target: &[u8]) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn mkdir(&self, _k: &Kernel, _dir: IRef, _name: &[u8], _mode: Mode) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn rmdir(&self, _k: &Kernel, _dir: IRef, _name: &[u8]) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn rename(
        &self,
        _k: &Kernel,
        _olddir: IRef,
        _oldname: &[u8],
        _newdir: IRef,
        _newname: &[u8],
    ) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn readlink(&self, _k: &Kernel, _i: IRef, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn truncate(&self, _k: &Kernel, _i: IRef) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    /// Map a file-relative block to a device block, optionally creating.
    fn bmap(&self, _k: &Kernel, _i: IRef, _block: u32, _create: bool) -> Result<u32> {
        Err(KernelError::NotSupported)
    }

    fn read(&self, _k: &Kernel, _i: IRef, _off: u32, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _k: &Kernel, _i: IRef, _off: u32, _data: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    /// Iterate directory entries from `pos`; `emit` returns false to
    /// stop. Returns the next position.
    fn getdents(
        &self,
        _k: &Kernel,
        _i: IRef,
        _pos: u32,
        _emit: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
    ) -> Result<u32> {
        Err(KernelError::NotSupported)
    }
}

pub struct MountEntry {
    pub dev: DevT,
    pub fs: Arc<dyn FileSystem>,
    /// Held reference to the mounted root.
    pub root: IRef,
    /// The inode this mount covers; None for the root mount.
    pub covered: Option<IRef>,
}

pub struct Mounts {
    pub inner: Mutex<Vec<Option<MountEntry>>>,
}

impl Mounts {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(NR_MOUNT);
        for _ in 0..NR_MOUNT {
            v.push(None);
        }
        Self {
            inner: Mutex::new(v),
        }
    }
}

impl Kernel {
    /// Driver vtable of a mounted file system.
    pub fn fs_of(&self, sb: usize) -> Result<Arc<dyn FileSystem>> {
        let mounts = self.mounts.inner.lock();
        mounts
            .get(sb)
            .and_then(|m| m.as_ref())
            .map(|m| m.fs.clone())
            .ok_or(KernelError::NoDevice)
    }

    /// Root inode of the root mount (mount index 0).
    pub fn root_inode(&self) -> Result<IRef> {
        let mounts = self.mounts.inner.lock();
        mounts
            .get(0)
            .and_then(|m| m.as_ref())
            .map(|m| m.root)
            .ok_or(KernelError::NoDevice)
    }

    /// Get a referenced in-memory inode, reading from the driver on a
    /// cache miss.
    pub fn iget(&self, sb: usize, ino: u32) -> Result<IRef> {
        {
            let mut table = self.icache.table.lock();
            if let Some(idx) = table
                .iter()
                .position(|m| m.used && m.key == Some((sb, ino)))
            {
                table[idx].refs += 1;
                return Ok(IRef(idx));
            }
        }

        let fs = self.fs_of(sb)?;
        let idx = self.alloc_slot(Some((sb, ino)))?;
        {
            let mut data = self.icache.slots[idx].lock();
            *data = InodeData::empty();
            data.sb = Some(sb);
            if let Err(e) = fs.read_inode(self, ino, &mut data) {
                drop(data);
                let mut table = self.icache.table.lock();
                table[idx].used = false;
                table[idx].key = None;
                table[idx].refs = 0;
                return Err(e);
            }
        }
        Ok(IRef(idx))
    }

    /// Allocate an anonymous in-memory inode (pipe, socket).
    pub fn get_empty_inode(&self) -> Result<IRef> {
        let idx = self.alloc_slot(None)?;
        let mut data = self.icache.slots[idx].lock();
        *data = InodeData::empty();
        data.ctime = self.current_time();
        data.atime = data.ctime;
        data.mtime = data.ctime;
        Ok(IRef(idx))
    }

    fn alloc_slot(&self, key: Option<(usize, u32)>) -> Result<usize> {
        let mut table = self.icache.table.lock();
        // Prefer a never-used slot, else reclaim a clean cached one.
        let idx = table
            .iter()
            .position(|m| !m.used)
            .or_else(|| table.iter().position(|m| m.used && m.refs == 0))
            .ok_or(KernelError::NoMemory)?;
        table[idx].used = true;
        table[idx].refs = 1;
        table[idx].key = key;
        table[idx].ino = key.map_or(0, |(_, ino)| ino);
        Ok(idx)
    }

    /// Raise the reference count of a held inode.
    pub fn idup(&self, i: IRef) {
        let mut table = self.icache.table.lock();
        table[i.0].refs += 1;
    }

    /// Drop one inode reference. The last put writes back dirty state,
    /// frees unlinked disk inodes, and releases anonymous slots.
    pub fn iput(&self, i: IRef) {
        let (last, key) = {
            let mut table = self.icache.table.lock();
            assert!(table[i.0].refs > 0, "iput: refcnt underflow");
            table[i.0].refs -= 1;
            (table[i.0].refs == 0, table[i.0].key)
        };
        if !last {
            return;
        }

        match key {
            None => {
                // Anonymous inodes die with their last reference.
                let mut table = self.icache.table.lock();
                table[i.0].used = false;
                let mut data = self.icache.slots[i.0].lock();
                *data = InodeData::empty();
            }
            Some((sb, ino)) => {
                let fs = match self.fs_of(sb) {
                    Ok(fs) => fs,
                    Err(_) => return,
                };
                let (nlinks, dirty) = {
                    let data = self.icache.slots[i.0].lock();
                    (data.nlinks, data.dirty)
                };
                if nlinks == 0 {
                    let _ = fs.truncate(self, i);
                    let mut data = self.icache.slots[i.0].lock();
                    let _ = fs.free_inode(self, ino, &mut data);
                    *data = InodeData::empty();
                    drop(data);
                    let mut table = self.icache.table.lock();
                    table[i.0].used = false;
                    table[i.0].key = None;
                } else if dirty {
                    let mut data = self.icache.slots[i.0].lock();
                    if fs.write_inode(self, ino, &mut data).is_ok() {
                        data.dirty = false;
                    }
                }
            }
        }
    }

    /// Inspect inode contents.
    pub fn with_inode<R>(&self, i: IRef, f: impl FnOnce(&mut InodeData) -> R) -> R {
        let mut data = self.icache.slots[i.0].lock();
        f(&mut data)
    }

    /// The inode number a handle refers to (0 for anonymous inodes).
    pub fn ino_of(&self, i: IRef) -> u32 {
        self.icache.table.lock()[i.0].ino
    }

    pub fn stat_inode(&self, i: IRef) -> Stat {
        let ino = self.ino_of(i);
        self.with_inode(i, |d| Stat {
            dev: d.dev.0,
            ino,
            mode: d.mode.0,
            nlink: d.nlinks as u32,
            uid: d.uid,
            gid: d.gid,
            rdev: if d.mode.is_chr() || d.mode.is_blk() {
                d.zones[0]
            } else {
                0
            },
            size: d.size,
            blksize: BLOCK_SIZE as u32,
            blocks: (d.size + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32,
            atime: d.atime,
            mtime: d.mtime,
            ctime: d.ctime,
        })
    }

    /// Attach a file system. `covered` is the mount point (None for the
    /// root mount); the mount holds references to both inodes.
    pub fn mount_fs(&self, fs: Box<dyn FileSystem>, dev: DevT, covered: Option<IRef>) -> Result<usize> {
        let fs: Arc<dyn FileSystem> = Arc::from(fs);
        let sb = {
            let mut mounts = self.mounts.inner.lock();
            let sb = mounts
                .iter()
                .position(|m| m.is_none())
                .ok_or(KernelError::NoMemory)?;
            mounts[sb] = Some(MountEntry {
                dev,
                fs: fs.clone(),
                root: IRef(usize::MAX),
                covered,
            });
            sb
        };

        let root = match self.iget(sb, fs.root_ino()) {
            Ok(root) => root,
            Err(e) => {
                self.mounts.inner.lock()[sb] = None;
                return Err(e);
            }
        };
        if let Some(cov) = covered {
            let is_dir = self.with_inode(cov, |d| d.mode.is_dir());
            if !is_dir {
                self.iput(root);
                self.mounts.inner.lock()[sb] = None;
                return Err(KernelError::NotDir);
            }
        }
        let mut mounts = self.mounts.inner.lock();
        if let Some(entry) = mounts[sb].as_mut() {
            entry.root = root;
        }
        Ok(sb)
    }

    /// Detach a mounted file system. Busy inodes keep it mounted.
    pub fn umount_fs(&self, sb: usize) -> Result<()> {
        if sb == 0 {
            // The root mount never goes away.
            return Err(KernelError::InvalidArg);
        }
        let root = {
            let mounts = self.mounts.inner.lock();
            let entry = mounts
                .get(sb)
                .and_then(|m| m.as_ref())
                .ok_or(KernelError::NoDevice)?;
            entry.root
        };
        {
            let table = self.icache.table.lock();
            let busy = table.iter().enumerate().any(|(idx, m)| {
                m.used
                    && m.key.map_or(false, |(s, _)| s == sb)
                    && (m.refs > if IRef(idx) == root { 1 } else { 0 })
            });
            if busy {
                return Err(KernelError::WouldBlock);
            }
        }
        self.bcache.sync_all(&self.disks);
        self.iput(root);
        // Stale cached inodes must not alias a future mount in this
        // table slot.
        {
            let mut table = self.icache.table.lock();
            for meta in table.iter_mut() {
                if meta.used && meta.refs == 0 && meta.key.map_or(false, |(s, _)| s == sb) {
                    meta.used = false;
                    meta.key = None;
                }
            }
        }
        let entry = {
            let mut mounts = self.mounts.inner.lock();
            mounts[sb].take()
        };
        if let Some(entry) = entry {
            entry.fs.put_super(self);
            if let Some(cov) = entry.covered {
                self.iput(cov);
            }
        }
        Ok(())
    }

    /// If `i` is covered by a mount, swap to the mounted root.
    pub fn cross_mount(&self, i: IRef) -> IRef {
        let root = {
            let mounts = self.mounts.inner.lock();
            mounts
                .iter()
                .flatten()
                .find(|m| m.covered == Some(i))
                .map(|m| m.root)
        };
        match root {
            Some(root) => {
                self.idup(root);
                self.iput(i);
                root
            }
            None => i,
        }
    }

    /// mount(2): attach a named file system type at a target directory.
    pub fn do_mount(&self, source: &[u8], target: &[u8], fstype: &[u8]) -> Result<i32> {
        let covered = self.namei(crate::fs::path::AT_FDCWD, target, true)?;
        let res = (|| match fstype {
            b"minix" => {
                let src = self.namei(crate::fs::path::AT_FDCWD, source, true)?;
                let (is_blk, dev) = self.with_inode(src, |d| (d.mode.is_blk(), d.rdev()));
                self.iput(src);
                if !is_blk {
                    return Err(KernelError::NoDevice);
                }
                let fs = crate::fs::minix::MinixFs::mount(self, dev)?;
                self.mount_fs(fs, dev, Some(covered))
            }
            b"tmpfs" => self.mount_fs(
                Box::new(crate::fs::tmpfs::TmpFs::new()),
                DevT(0),
                Some(covered),
            ),
            b"proc" => self.mount_fs(
                Box::new(crate::fs::procfs::ProcFs::new()),
                DevT(0),
                Some(covered),
            ),
            _ => Err(KernelError::NoDevice),
        })();
        match res {
            Ok(_) => Ok(0),
            Err(e) => {
                self.iput(covered);
                Err(e)
            }
        }
    }

    /// umount(2) by mount point path.
    pub fn do_umount(&self, target: &[u8]) -> Result<i32> {
        let inode = self.namei(crate::fs::path::AT_FDCWD, target, true)?;
        let sb = {
            let mounts = self.mounts.inner.lock();
            mounts
                .iter()
                .position(|m| m.as_ref().map_or(false, |e| e.root == inode))
        };
        self.iput(inode);
        let sb = sb.ok_or(KernelError::InvalidArg)?;
        self.umount_fs(sb)?;
        Ok(0)
    }

    /// Write every dirty cached inode back through its driver.
    pub fn isync(&self) {
        for idx in 0..NR_INODE {
            let key = {
                let table = self.icache.table.lock();
                if table[idx].used {
                    table[idx].key
                } else {
                    None
                }
            };
            let (sb, ino) = match key {
                Some(k) => k,
                None => continue,
            };
            let fs = match self.fs_of(sb) {
                Ok(fs) => fs,
                Err(_) => continue,
            };
            let mut data = self.icache.slots[idx].lock();
            if data.dirty && fs.write_inode(self, ino, &mut data).is_ok() {
                data.dirty = false;
            }
        }
    }

    /// Seconds since the epoch, from the boot clock plus jiffies.
    pub fn current_time(&self) -> u32 {
        self.startup_time + (self.jiffies() / crate::param::HZ) as u32
    }
}
