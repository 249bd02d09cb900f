//! On-disk inode handling, the block map and file contents.

use zerocopy::AsBytes;

use crate::{
    error::{KernelError, Result},
    fs::{IRef, InodeData, Mode},
    kernel::Kernel,
    param::BLOCK_SIZE,
};

use super::{bitmap, DInode, MinixFs, INODES_PER_BLOCK, MAX_FILE_BLOCKS, ZONES_PER_BLOCK};

fn inode_offset(ino: u32) -> usize {
    ((ino - 1) as usize % INODES_PER_BLOCK) * core::mem::size_of::<DInode>()
}

/// Copy the on-disk inode into the in-memory form.
pub fn read_inode(fs: &MinixFs, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
    if ino == 0 || ino > fs.sbi.ninodes {
        return Err(KernelError::NoEntry);
    }
    let buf = k.bcache.bread(&k.disks, fs.dev, fs.sbi.inode_block(ino))?;
    let mut dinode = DInode::zeroed();
    let off = inode_offset(ino);
    k.bcache.with_data(buf, |data| {
        dinode
            .as_bytes_mut()
            .copy_from_slice(&data[off..off + core::mem::size_of::<DInode>()]);
    });
    k.bcache.brelse(&k.disks, buf);

    d.mode = Mode(dinode.i_mode);
    d.uid = dinode.i_uid;
    d.gid = dinode.i_gid as u16;
    d.size = dinode.i_size;
    d.atime = dinode.i_time;
    d.mtime = dinode.i_time;
    d.ctime = dinode.i_time;
    d.nlinks = dinode.i_nlinks;
    d.zones = [0; 12];
    for (slot, zone) in d.zones.iter_mut().zip(dinode.i_zone.iter()) {
        *slot = *zone as u32;
    }
    d.dev = fs.dev;
    d.dirty = false;
    Ok(())
}

/// Write the in-memory inode back to its table slot.
pub fn write_inode(fs: &MinixFs, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
    if ino == 0 || ino > fs.sbi.ninodes {
        return Err(KernelError::InvalidArg);
    }
    let mut dinode = DInode::zeroed();
    dinode.i_mode = d.mode.0;
    dinode.i_uid = d.uid;
    dinode.i_gid = d.gid as u8;
    dinode.i_size = d.size;
    dinode.i_time = d.mtime;
    dinode.i_nlinks = d.nlinks;
    for (zone, slot) in dinode.i_zone.iter_mut().zip(d.zones.iter()) {
        *zone = *slot as u16;
    }

    let buf = k.bcache.bread(&k.disks, fs.dev, fs.sbi.inode_block(ino))?;
    let off = inode_offset(ino);
    k.bcache.with_data_mut(buf, |data| {
        data[off..off + core::mem::size_of::<DInode>()].copy_from_slice(dinode.as_bytes());
    });
    k.bcache.mark_dirty(buf);
    k.bcache.brelse(&k.disks, buf);
    d.dirty = false;
    Ok(())
}

/// Initialise a brand new disk inode directly in the table.
pub fn init_disk_inode(
    fs: &MinixFs,
    k: &Kernel,
    ino: u32,
    mode: Mode,
    uid: u16,
    gid: u16,
    rdev: u32,
) -> Result<()> {
    let mut dinode = DInode::zeroed();
    dinode.i_mode = mode.0;
    dinode.i_uid = uid;
    dinode.i_gid = gid as u8;
    dinode.i_time = k.current_time();
    dinode.i_nlinks = 1;
    dinode.i_zone[0] = rdev as u16;
    if !mode.is_chr() && !mode.is_blk() {
        dinode.i_zone[0] = 0;
    }

    let buf = k.bcache.bread(&k.disks, fs.dev, fs.sbi.inode_block(ino))?;
    let off = inode_offset(ino);
    k.bcache.with_data_mut(buf, |data| {
        data[off..off + core::mem::size_of::<DInode>()].copy_from_slice(dinode.as_bytes());
    });
    k.bcache.mark_dirty(buf);
    k.bcache.brelse(&k.disks, buf);
    Ok(())
}

fn read_zone_entry(k: &Kernel, fs: &MinixFs, block: u32, idx: u32) -> Result<u32> {
    let buf = k.bcache.bread(&k.disks, fs.dev, block)?;
    let entry = k.bcache.with_data(buf, |data| {
        let off = (idx * 2) as usize;
        u16::from_le_bytes([data[off], data[off + 1]]) as u32
    });
    k.bcache.brelse(&k.disks, buf);
    Ok(entry)
}

fn write_zone_entry(k: &Kernel, fs: &MinixFs, block: u32, idx: u32, val: u32) -> Result<()> {
    let buf = k.bcache.bread(&k.disks, fs.dev, block)?;
    k.bcache.with_data_mut(buf, |data| {
        let off = (idx * 2) as usize;
        data[off..off + 2].copy_from_slice(&(val as u16).to_le_bytes());
    });
    k.bcache.mark_dirty(buf);
    k.bcache.brelse(&k.disks, buf);
    Ok(())
}

/// Translate a file-relative block into a device block. With `create`,
/// missing levels are allocated and their parents persisted; the call
/// is idempotent. Returns 0 when the block does not exist and `create`
/// is off.
pub fn bmap(fs: &MinixFs, k: &Kernel, i: IRef, block: u32, create: bool) -> Result<u32> {
    if block >= MAX_FILE_BLOCKS {
        return Ok(0);
    }

    // Direct zones.
    if block < 7 {
        let cur = k.with_inode(i, |d| d.zones[block as usize]);
        if cur != 0 || !create {
            return Ok(cur);
        }
        let new = bitmap::new_block(fs, k)?;
        k.with_inode(i, |d| {
            d.zones[block as usize] = new;
            d.dirty = true;
        });
        return Ok(new);
    }

    // Single indirect.
    let block = block - 7;
    if block < ZONES_PER_BLOCK {
        let mut ind = k.with_inode(i, |d| d.zones[7]);
        if ind == 0 {
            if !create {
                return Ok(0);
            }
            ind = bitmap::new_block(fs, k)?;
            k.with_inode(i, |d| {
                d.zones[7] = ind;
                d.dirty = true;
            });
        }
        let mut entry = read_zone_entry(k, fs, ind, block)?;
        if entry == 0 && create {
            entry = bitmap::new_block(fs, k)?;
            write_zone_entry(k, fs, ind, block, entry)?;
        }
        return Ok(entry);
    }

    // Double indirect.
    let block = block - ZONES_PER_BLOCK;
    let mut dbl = k.with_inode(i, |d| d.zones[8]);
    if dbl == 0 {
        if !create {
            return Ok(0);
        }
        dbl = bitmap::new_block(fs, k)?;
        k.with_inode(i, |d| {
            d.zones[8] = dbl;
            d.dirty = true;
        });
    }
    let mut mid = read_zone_entry(k, fs, dbl, block / ZONES_PER_BLOCK)?;
    if mid == 0 {
        if !create {
            return Ok(0);
        }
        mid = bitmap::new_block(fs, k)?;
        write_zone_entry(k, fs, dbl, block / ZONES_PER_BLOCK, mid)?;
    }
    let mut entry = read_zone_entry(k, fs, mid, block % ZONES_PER_BLOCK)?;
    if entry == 0 && create {
        entry = bitmap::new_block(fs, k)?;
        write_zone_entry(k, fs, mid, block % ZONES_PER_BLOCK, entry)?;
    }
    Ok(entry)
}

/// Read file contents. Holes read back as zeroes.
pub fn file_read(fs: &MinixFs, k: &Kernel, i: IRef, off: u32, buf: &mut [u8]) -> Result<usize> {
    let size = k.with_inode(i, |d| d.size);
    if off >= size {
        return Ok(0);
    }
    let end = size.min(off.saturating_add(buf.len() as u32));
    let mut pos = off;
    let mut done = 0usize;

    while pos < end {
        let blk = pos / BLOCK_SIZE as u32;
        let boff = (pos % BLOCK_SIZE as u32) as usize;
        let chunk = ((end - pos) as usize).min(BLOCK_SIZE - boff);

        let device_block = bmap(fs, k, i, blk, false)?;
        if device_block == 0 {
            buf[done..done + chunk].fill(0);
        } else {
            let b = k.bcache.bread(&k.disks, fs.dev, device_block)?;
            k.bcache.with_data(b, |data| {
                buf[done..done + chunk].copy_from_slice(&data[boff..boff + chunk]);
            });
            k.bcache.brelse(&k.disks, b);
        }
        pos += chunk as u32;
        done += chunk;
    }
    Ok(done)
}

/// Write file contents, extending the size as needed. A write that
/// would cross the file size limit fails with NoSpace up front.
pub fn file_write(fs: &MinixFs, k: &Kernel, i: IRef, off: u32, data: &[u8]) -> Result<usize> {
    let end = off
        .checked_add(data.len() as u32)
        .ok_or(KernelError::FileTooBig)?;
    if end > fs.sbi.max_size {
        return Err(KernelError::NoSpace);
    }

    let mut pos = off;
    let mut done = 0usize;
    while done < data.len() {
        let blk = pos / BLOCK_SIZE as u32;
        let boff = (pos % BLOCK_SIZE as u32) as usize;
        let chunk = (data.len() - done).min(BLOCK_SIZE - boff);

        let device_block = bmap(fs, k, i, blk, true)?;
        if device_block == 0 {
            return Err(KernelError::NoSpace);
        }
        let b = k.bcache.bread(&k.disks, fs.dev, device_block)?;
        k.bcache.with_data_mut(b, |bd| {
            bd[boff..boff + chunk].copy_from_slice(&data[done..done + chunk]);
        });
        k.bcache.mark_dirty(b);
        k.bcache.brelse(&k.disks, b);
        pos += chunk as u32;
        done += chunk;
    }

    let now = k.current_time();
    k.with_inode(i, |d| {
        if end > d.size {
            d.size = end;
        }
        d.mtime = now;
        d.dirty = true;
    });
    Ok(done)
}

/// Free every data block and reset the size to zero.
pub fn truncate(fs: &MinixFs, k: &Kernel, i: IRef) -> Result<()> {
    let (zones, mode) = k.with_inode(i, |d| (d.zones, d.mode));
    if mode.is_chr() || mode.is_blk() {
        // Device nodes keep their device id in the zone slot.
        return Ok(());
    }

    for z in zones.iter().take(7) {
        if *z != 0 {
            let _ = bitmap::free_block(fs, k, *z);
        }
    }
    if zones[7] != 0 {
        free_indirect(fs, k, zones[7])?;
    }
    if zones[8] != 0 {
        for idx in 0..ZONES_PER_BLOCK {
            let mid = read_zone_entry(k, fs, zones[8], idx)?;
            if mid != 0 {
                free_indirect(fs, k, mid)?;
            }
        }
        let _ = bitmap::free_block(fs, k, zones[8]);
    }

    let now = k.current_time();
    k.with_inode(i, |d| {
        d.zones = [0; 12];
        d.size = 0;
        d.mtime = now;
        d.dirty = true;
    });
    Ok(())
}

fn free_indirect(fs: &MinixFs, k: &Kernel, block: u32) -> Result<()> {
    for idx in 0..ZONES_PER_BLOCK {
        let entry = read_zone_entry(k, fs, block, idx)?;
        if entry != 0 {
            let _ = bitmap::free_block(fs, k, entry);
        }
    }
    let _ = bitmap::free_block(fs, k, block);
    Ok(())
}

/// Symlink target, stored in the first data block.
pub fn readlink(fs: &MinixFs, k: &Kernel, i: IRef, buf: &mut [u8]) -> Result<usize> {
    let (size, zone) = k.with_inode(i, |d| (d.size, d.zones[0]));
    if zone == 0 {
        return Ok(0);
    }
    let n = (size as usize).min(buf.len()).min(BLOCK_SIZE);
    let b = k.bcache.bread(&k.disks, fs.dev, zone)?;
    k.bcache.with_data(b, |data| buf[..n].copy_from_slice(&data[..n]));
    k.bcache.brelse(&k.disks, b);
    Ok(n)
}
