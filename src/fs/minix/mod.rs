//! Minix file system (v1, 30-character names).
//!
//! Disk layout: block 0 boot, block 1 super block, inode bitmap, zone
//! bitmap, inode table, data zones. Inodes are 32 bytes with 7 direct
//! zones, one indirect and one double indirect. Directory entries are
//! 32 bytes: a u16 inode number and a NUL-padded name.

use alloc::boxed::Box;

use arrayvec::ArrayVec;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    bio::BufRef,
    dev::DevT,
    error::{KernelError, Result},
    fs::{stat::StatFs, FileSystem, IRef, InodeData, Mode},
    hal::DiskTable,
    kernel::Kernel,
    param::BLOCK_SIZE,
};

mod bitmap;
mod dir;
mod inode;

pub const MINIX_SUPER_MAGIC: u16 = 0x138f;
pub const MINIX_ROOT_INO: u32 = 1;
pub const MINIX_FILENAME_LEN: usize = 30;
pub const MINIX_IMAP_SLOTS: usize = 8;
pub const MINIX_ZMAP_SLOTS: usize = 8;

/// Bits per bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<DInode>();
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<DDirEntry>();
/// Zone pointers per indirect block.
pub const ZONES_PER_BLOCK: u32 = (BLOCK_SIZE / 2) as u32;

/// Largest mappable file, in blocks.
pub const MAX_FILE_BLOCKS: u32 = 7 + ZONES_PER_BLOCK + ZONES_PER_BLOCK * ZONES_PER_BLOCK;

/// On-disk super block.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DSuperBlock {
    pub s_ninodes: u16,
    pub s_nzones: u16,
    pub s_imap_blocks: u16,
    pub s_zmap_blocks: u16,
    pub s_firstdatazone: u16,
    pub s_log_zone_size: u16,
    pub s_max_size: u32,
    pub s_magic: u16,
    pub s_state: u16,
}

const_assert_eq!(core::mem::size_of::<DSuperBlock>(), 20);

impl DSuperBlock {
    pub fn zeroed() -> Self {
        Self {
            s_ninodes: 0,
            s_nzones: 0,
            s_imap_blocks: 0,
            s_zmap_blocks: 0,
            s_firstdatazone: 0,
            s_log_zone_size: 0,
            s_max_size: 0,
            s_magic: 0,
            s_state: 0,
        }
    }
}

/// On-disk inode.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DInode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_time: u32,
    pub i_gid: u8,
    pub i_nlinks: u8,
    pub i_zone: [u16; 9],
}

const_assert_eq!(core::mem::size_of::<DInode>(), 32);

impl DInode {
    pub fn zeroed() -> Self {
        Self {
            i_mode: 0,
            i_uid: 0,
            i_size: 0,
            i_time: 0,
            i_gid: 0,
            i_nlinks: 0,
            i_zone: [0; 9],
        }
    }
}

/// On-disk directory entry.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DDirEntry {
    pub inode: u16,
    pub name: [u8; MINIX_FILENAME_LEN],
}

const_assert_eq!(core::mem::size_of::<DDirEntry>(), 32);

impl DDirEntry {
    pub fn zeroed() -> Self {
        Self {
            inode: 0,
            name: [0; MINIX_FILENAME_LEN],
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(MINIX_FILENAME_LEN);
        &self.name[..len]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(MINIX_FILENAME_LEN);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n..].fill(0);
    }
}

/// In-memory super block info; fixed after mount.
pub struct SbInfo {
    pub ninodes: u32,
    pub nzones: u32,
    pub imap_blocks: u32,
    pub zmap_blocks: u32,
    pub firstdatazone: u32,
    pub max_size: u32,
    /// Bitmap blocks pinned in the buffer cache for the mount lifetime.
    pub imap: ArrayVec<BufRef, MINIX_IMAP_SLOTS>,
    pub zmap: ArrayVec<BufRef, MINIX_ZMAP_SLOTS>,
}

impl SbInfo {
    /// First block of the inode table.
    pub fn inode_table_block(&self) -> u32 {
        2 + self.imap_blocks + self.zmap_blocks
    }

    /// Disk block holding inode `ino`.
    pub fn inode_block(&self, ino: u32) -> u32 {
        self.inode_table_block() + (ino - 1) / INODES_PER_BLOCK as u32
    }
}

pub struct MinixFs {
    pub dev: DevT,
    pub sbi: SbInfo,
}

impl MinixFs {
    /// Read and validate the super block, pinning the bitmap blocks.
    pub fn mount(k: &Kernel, dev: DevT) -> Result<Box<MinixFs>> {
        let buf = k.bcache.bread(&k.disks, dev, 1)?;
        let mut dsb = DSuperBlock::zeroed();
        k.bcache.with_data(buf, |data| {
            dsb.as_bytes_mut()
                .copy_from_slice(&data[..core::mem::size_of::<DSuperBlock>()]);
        });
        k.bcache.brelse(&k.disks, buf);

        if dsb.s_magic != MINIX_SUPER_MAGIC {
            return Err(KernelError::InvalidArg);
        }
        if dsb.s_imap_blocks as usize > MINIX_IMAP_SLOTS
            || dsb.s_zmap_blocks as usize > MINIX_ZMAP_SLOTS
        {
            return Err(KernelError::InvalidArg);
        }

        let mut sbi = SbInfo {
            ninodes: dsb.s_ninodes as u32,
            nzones: dsb.s_nzones as u32,
            imap_blocks: dsb.s_imap_blocks as u32,
            zmap_blocks: dsb.s_zmap_blocks as u32,
            firstdatazone: dsb.s_firstdatazone as u32,
            max_size: dsb.s_max_size,
            imap: ArrayVec::new(),
            zmap: ArrayVec::new(),
        };
        for i in 0..sbi.imap_blocks {
            sbi.imap.push(k.bcache.bread(&k.disks, dev, 2 + i)?);
        }
        for i in 0..sbi.zmap_blocks {
            sbi.zmap
                .push(k.bcache.bread(&k.disks, dev, 2 + sbi.imap_blocks + i)?);
        }

        Ok(Box::new(MinixFs { dev, sbi }))
    }

    /// Build an empty file system on a device. The boot path and the
    /// test harness format ram disks with it.
    pub fn mkfs(disks: &DiskTable, dev: DevT, ninodes: u32, nzones: u32) -> Result<()> {
        let imap_blocks = (ninodes + 1 + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        let zmap_blocks = (nzones + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        let itable_blocks =
            (ninodes + INODES_PER_BLOCK as u32 - 1) / INODES_PER_BLOCK as u32;
        let firstdatazone = 2 + imap_blocks + zmap_blocks + itable_blocks;
        if firstdatazone >= nzones {
            return Err(KernelError::InvalidArg);
        }

        let mut block = [0u8; BLOCK_SIZE];

        // Super block.
        let dsb = DSuperBlock {
            s_ninodes: ninodes as u16,
            s_nzones: nzones as u16,
            s_imap_blocks: imap_blocks as u16,
            s_zmap_blocks: zmap_blocks as u16,
            s_firstdatazone: firstdatazone as u16,
            s_log_zone_size: 0,
            s_max_size: MAX_FILE_BLOCKS.saturating_mul(BLOCK_SIZE as u32),
            s_magic: MINIX_SUPER_MAGIC,
            s_state: 1,
        };
        block[..core::mem::size_of::<DSuperBlock>()].copy_from_slice(dsb.as_bytes());
        disks.write_block(dev, 1, &block)?;

        // Inode bitmap: bit 0 reserved, bit 1 the root inode.
        block.fill(0);
        block[0] = 0b11;
        disks.write_block(dev, 2, &block)?;
        block.fill(0);
        for b in 1..imap_blocks {
            disks.write_block(dev, 2 + b, &block)?;
        }

        // Zone bitmap: bit 0 reserved, bit 1 the root directory block.
        block[0] = 0b11;
        disks.write_block(dev, 2 + imap_blocks, &block)?;
        block.fill(0);
        for b in 1..zmap_blocks {
            disks.write_block(dev, 2 + imap_blocks + b, &block)?;
        }

        // Inode table with the root directory inode.
        let mut root = DInode::zeroed();
        root.i_mode = crate::fs::S_IFDIR | 0o755;
        root.i_nlinks = 2;
        root.i_size = 2 * core::mem::size_of::<DDirEntry>() as u32;
        root.i_zone[0] = firstdatazone as u16;
        block[..core::mem::size_of::<DInode>()].copy_from_slice(root.as_bytes());
        disks.write_block(dev, 2 + imap_blocks + zmap_blocks, &block)?;
        block.fill(0);
        for b in 1..itable_blocks {
            disks.write_block(dev, 2 + imap_blocks + zmap_blocks + b, &block)?;
        }

        // Root directory data: "." and "..".
        let mut dot = DDirEntry::zeroed();
        dot.inode = MINIX_ROOT_INO as u16;
        dot.set_name(b".");
        let mut dotdot = DDirEntry::zeroed();
        dotdot.inode = MINIX_ROOT_INO as u16;
        dotdot.set_name(b"..");
        let esz = core::mem::size_of::<DDirEntry>();
        block[..esz].copy_from_slice(dot.as_bytes());
        block[esz..2 * esz].copy_from_slice(dotdot.as_bytes());
        disks.write_block(dev, firstdatazone, &block)?;

        Ok(())
    }
}

impl FileSystem for MinixFs {
    fn kind(&self) -> &'static str {
        "minix"
    }

    fn magic(&self) -> u32 {
        MINIX_SUPER_MAGIC as u32
    }

    fn root_ino(&self) -> u32 {
        MINIX_ROOT_INO
    }

    fn read_inode(&self, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        inode::read_inode(self, k, ino, d)
    }

    fn write_inode(&self, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        inode::write_inode(self, k, ino, d)
    }

    fn free_inode(&self, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        bitmap::free_inode(self, k, ino, d)
    }

    fn put_super(&self, k: &Kernel) {
        for buf in self.sbi.imap.iter().chain(self.sbi.zmap.iter()) {
            k.bcache.brelse(&k.disks, *buf);
        }
    }

    fn statfs(&self, k: &Kernel) -> Result<StatFs> {
        Ok(StatFs {
            f_type: MINIX_SUPER_MAGIC as u32,
            bsize: BLOCK_SIZE as u32,
            blocks: self.sbi.nzones,
            bfree: bitmap::count_free(k, &self.sbi.zmap, self.sbi.nzones),
            bavail: bitmap::count_free(k, &self.sbi.zmap, self.sbi.nzones),
            files: self.sbi.ninodes,
            ffree: bitmap::count_free(k, &self.sbi.imap, self.sbi.ninodes),
            namelen: MINIX_FILENAME_LEN as u32,
        })
    }

    fn lookup(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<u32> {
        dir::lookup(self, k, dir, name)
    }

    fn create(&self, k: &Kernel, dir: IRef, name: &[u8], mode: Mode, rdev: DevT) -> Result<u32> {
        dir::create(self, k, dir, name, mode, rdev)
    }

    fn link(&self, k: &Kernel, dir: IRef, name: &[u8], target: IRef) -> Result<()> {
        dir::link(self, k, dir, name, target)
    }

    fn unlink(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
        dir::unlink(self, k, dir, name)
    }

    fn symlink(&self, k: &Kernel, dir: IRef, name: &[u8], target: &[u8]) -> Result<()> {
        dir::symlink(self, k, dir, name, target)
    }

    fn mkdir(&self, k: &Kernel, dir: IRef, name: &[u8], mode: Mode) -> Result<()> {
        dir::mkdir(self, k, dir, name, mode)
    }

    fn rmdir(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
        dir::rmdir(self, k, dir, name)
    }

    fn rename(
        &self,
        k: &Kernel,
        olddir: IRef,
        oldname: &[u8],
        newdir: IRef,
        newname: &[u8],
    ) -> Result<()> {
        dir::rename(self, k, olddir, oldname, newdir, newname)
    }

    fn readlink(&self, k: &Kernel, i: IRef, buf: &mut [u8]) -> Result<usize> {
        inode::readlink(self, k, i, buf)
    }

    fn truncate(&self, k: &Kernel, i: IRef) -> Result<()> {
        inode::truncate(self, k, i)
    }

    fn bmap(&self, k: &Kernel, i: IRef, block: u32, create: bool) -> Result<u32> {
        inode::bmap(self, k, i, block, create)
    }

    fn read(&self, k: &Kernel, i: IRef, off: u32, buf: &mut [u8]) -> Result<usize> {
        inode::file_read(self, k, i, off, buf)
    }

    fn write(&self, k: &Kernel, i: IRef, off: u32, data: &[u8]) -> Result<usize> {
        inode::file_write(self, k, i, off, data)
    }

    fn getdents(
        &self,
        k: &Kernel,
        i: IRef,
        pos: u32,
        emit: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
    ) -> Result<u32> {
        dir::getdents(self, k, i, pos, emit)
    }
}
