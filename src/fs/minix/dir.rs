//! Directory entries and name-space operations.

use zerocopy::AsBytes;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    fs::{IRef, Mode, S_IFDIR, S_IFLNK},
    kernel::Kernel,
    param::BLOCK_SIZE,
};

use super::{bitmap, inode, DDirEntry, MinixFs, MINIX_FILENAME_LEN};

const ENTRY_SIZE: usize = core::mem::size_of::<DDirEntry>();

fn read_entry(fs: &MinixFs, k: &Kernel, dir: IRef, index: u32) -> Result<DDirEntry> {
    let blk = index / (BLOCK_SIZE / ENTRY_SIZE) as u32;
    let off = (index as usize % (BLOCK_SIZE / ENTRY_SIZE)) * ENTRY_SIZE;
    let device_block = inode::bmap(fs, k, dir, blk, false)?;
    let mut entry = DDirEntry::zeroed();
    if device_block == 0 {
        return Ok(entry);
    }
    let b = k.bcache.bread(&k.disks, fs.dev, device_block)?;
    k.bcache.with_data(b, |data| {
        entry
            .as_bytes_mut()
            .copy_from_slice(&data[off..off + ENTRY_SIZE]);
    });
    k.bcache.brelse(&k.disks, b);
    Ok(entry)
}

fn write_entry(fs: &MinixFs, k: &Kernel, dir: IRef, index: u32, entry: &DDirEntry) -> Result<()> {
    let blk = index / (BLOCK_SIZE / ENTRY_SIZE) as u32;
    let off = (index as usize % (BLOCK_SIZE / ENTRY_SIZE)) * ENTRY_SIZE;
    let device_block = inode::bmap(fs, k, dir, blk, true)?;
    if device_block == 0 {
        return Err(KernelError::NoSpace);
    }
    let b = k.bcache.bread(&k.disks, fs.dev, device_block)?;
    k.bcache.with_data_mut(b, |data| {
        data[off..off + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
    });
    k.bcache.mark_dirty(b);
    k.bcache.brelse(&k.disks, b);
    Ok(())
}

fn nr_entries(k: &Kernel, dir: IRef) -> u32 {
    k.with_inode(dir, |d| d.size) / ENTRY_SIZE as u32
}

/// Locate `name`; returns (entry index, inode number).
fn find_entry(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8]) -> Result<Option<(u32, u32)>> {
    if name.is_empty() || name.len() > MINIX_FILENAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    for index in 0..nr_entries(k, dir) {
        let entry = read_entry(fs, k, dir, index)?;
        if entry.inode != 0 && entry.name_bytes() == name {
            return Ok(Some((index, entry.inode as u32)));
        }
    }
    Ok(None)
}

/// Add a (name, ino) entry, reusing a hole or growing the directory.
fn add_entry(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8], ino: u32) -> Result<()> {
    if name.is_empty() || name.len() > MINIX_FILENAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    let count = nr_entries(k, dir);
    let mut slot = count;
    for index in 0..count {
        if read_entry(fs, k, dir, index)?.inode == 0 {
            slot = index;
            break;
        }
    }

    let mut entry = DDirEntry::zeroed();
    entry.inode = ino as u16;
    entry.set_name(name);
    write_entry(fs, k, dir, slot, &entry)?;

    let now = k.current_time();
    k.with_inode(dir, |d| {
        if slot == count {
            d.size += ENTRY_SIZE as u32;
        }
        d.mtime = now;
        d.dirty = true;
    });
    Ok(())
}

fn clear_entry(fs: &MinixFs, k: &Kernel, dir: IRef, index: u32) -> Result<()> {
    let entry = DDirEntry::zeroed();
    write_entry(fs, k, dir, index, &entry)?;
    let now = k.current_time();
    k.with_inode(dir, |d| {
        d.mtime = now;
        d.dirty = true;
    });
    Ok(())
}

pub fn lookup(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8]) -> Result<u32> {
    match find_entry(fs, k, dir, name)? {
        Some((_, ino)) => Ok(ino),
        None => Err(KernelError::NoEntry),
    }
}

pub fn create(
    fs: &MinixFs,
    k: &Kernel,
    dir: IRef,
    name: &[u8],
    mode: Mode,
    rdev: DevT,
) -> Result<u32> {
    if find_entry(fs, k, dir, name)?.is_some() {
        return Err(KernelError::Exists);
    }
    let (uid, gid) = k.procs.with_current(|t| (t.euid, t.egid));
    let ino = bitmap::new_inode_num(fs, k)?;
    inode::init_disk_inode(fs, k, ino, mode, uid, gid, rdev.0)?;
    if let Err(e) = add_entry(fs, k, dir, name, ino) {
        let mut scratch = crate::fs::InodeData::empty();
        let _ = bitmap::free_inode(fs, k, ino, &mut scratch);
        return Err(e);
    }
    Ok(ino)
}

pub fn link(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8], target: IRef) -> Result<()> {
    if find_entry(fs, k, dir, name)?.is_some() {
        return Err(KernelError::Exists);
    }
    let ino = k.ino_of(target);
    add_entry(fs, k, dir, name, ino)?;
    let now = k.current_time();
    k.with_inode(target, |d| {
        d.nlinks += 1;
        d.ctime = now;
        d.dirty = true;
    });
    Ok(())
}

pub fn unlink(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
    if name == b"." || name == b".." {
        return Err(KernelError::InvalidArg);
    }
    let (index, ino) = find_entry(fs, k, dir, name)?.ok_or(KernelError::NoEntry)?;
    let sb = k.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
    let child = k.iget(sb, ino)?;
    let is_dir = k.with_inode(child, |d| d.mode.is_dir());
    if is_dir {
        k.iput(child);
        return Err(KernelError::IsDir);
    }
    clear_entry(fs, k, dir, index)?;
    let now = k.current_time();
    k.with_inode(child, |d| {
        d.nlinks = d.nlinks.saturating_sub(1);
        d.ctime = now;
        d.dirty = true;
    });
    k.iput(child);
    Ok(())
}

pub fn symlink(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8], target: &[u8]) -> Result<()> {
    if target.len() >= BLOCK_SIZE {
        return Err(KernelError::NameTooLong);
    }
    if find_entry(fs, k, dir, name)?.is_some() {
        return Err(KernelError::Exists);
    }
    let (uid, gid) = k.procs.with_current(|t| (t.euid, t.egid));
    let ino = bitmap::new_inode_num(fs, k)?;
    inode::init_disk_inode(fs, k, ino, Mode(S_IFLNK | 0o777), uid, gid, 0)?;

    // Store the target in the first data block.
    let sb = k.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
    let li = k.iget(sb, ino)?;
    let res = (|| {
        let block = inode::bmap(fs, k, li, 0, true)?;
        if block == 0 {
            return Err(KernelError::NoSpace);
        }
        let b = k.bcache.bread(&k.disks, fs.dev, block)?;
        k.bcache.with_data_mut(b, |data| {
            data[..target.len()].copy_from_slice(target);
        });
        k.bcache.mark_dirty(b);
        k.bcache.brelse(&k.disks, b);
        k.with_inode(li, |d| {
            d.size = target.len() as u32;
            d.dirty = true;
        });
        add_entry(fs, k, dir, name, ino)
    })();
    if res.is_err() {
        k.with_inode(li, |d| d.nlinks = 0);
    }
    k.iput(li);
    res
}

pub fn mkdir(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8], mode: Mode) -> Result<()> {
    if find_entry(fs, k, dir, name)?.is_some() {
        return Err(KernelError::Exists);
    }
    let (uid, gid) = k.procs.with_current(|t| (t.euid, t.egid));
    let ino = bitmap::new_inode_num(fs, k)?;
    inode::init_disk_inode(fs, k, ino, Mode(S_IFDIR | mode.perms()), uid, gid, 0)?;

    let sb = k.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
    let child = k.iget(sb, ino)?;
    let res = (|| {
        k.with_inode(child, |d| {
            d.nlinks = 2;
            d.dirty = true;
        });
        add_entry(fs, k, child, b".", ino)?;
        add_entry(fs, k, child, b"..", k.ino_of(dir))?;
        add_entry(fs, k, dir, name, ino)?;
        k.with_inode(dir, |d| {
            d.nlinks += 1;
            d.dirty = true;
        });
        Ok(())
    })();
    if res.is_err() {
        k.with_inode(child, |d| d.nlinks = 0);
    }
    k.iput(child);
    res
}

/// True when only "." and ".." remain.
fn dir_is_empty(fs: &MinixFs, k: &Kernel, dir: IRef) -> Result<bool> {
    for index in 0..nr_entries(k, dir) {
        let entry = read_entry(fs, k, dir, index)?;
        if entry.inode != 0 && entry.name_bytes() != b"." && entry.name_bytes() != b".." {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn rmdir(fs: &MinixFs, k: &Kernel, dir: IRef, name: &[u8]) -> Result<()> {
    if name == b"." || name == b".." {
        return Err(KernelError::InvalidArg);
    }
    let (index, ino) = find_entry(fs, k, dir, name)?.ok_or(KernelError::NoEntry)?;
    let sb = k.with_inode(dir, |d| d.sb).ok_or(KernelError::NoEntry)?;
    let child = k.iget(sb, ino)?;
    let res = (|| {
        if !k.with_inode(child, |d| d.mode.is_dir()) {
            return Err(KernelError::NotDir);
        }
        if !dir_is_empty(fs, k, child)? {
            return Err(KernelError::NotEmpty);
        }
        clear_entry(fs, k, dir, index)?;
        let now = k.current_time();
        k.with_inode(child, |d| {
            d.nlinks = 0;
            d.ctime = now;
            d.dirty = true;
        });
        k.with_inode(dir, |d| {
            d.nlinks = d.nlinks.saturating_sub(1);
            d.mtime = now;
            d.dirty = true;
        });
        Ok(())
    })();
    k.iput(child);
    res
}

pub fn rename(
    fs: &MinixFs,
    k: &Kernel,
    olddir: IRef,
    oldname: &[u8],
    newdir: IRef,
    newname: &[u8],
) -> Result<()> {
    let (old_index, ino) =
        find_entry(fs, k, olddir, oldname)?.ok_or(KernelError::NoEntry)?;
    let sb = k.with_inode(olddir, |d| d.sb).ok_or(KernelError::NoEntry)?;
    let moving = k.iget(sb, ino)?;
    let moving_is_dir = k.with_inode(moving, |d| d.mode.is_dir());

    let res = (|| {
        if let Some((_, existing)) = find_entry(fs, k, newdir, newname)? {
            if existing == ino {
                return Ok(());
            }
            // Replace a plain file; directories must be removed first.
            let target = k.iget(sb, existing)?;
            let target_is_dir = k.with_inode(target, |d| d.mode.is_dir());
            k.iput(target);
            if target_is_dir {
                return Err(KernelError::IsDir);
            }
            unlink(fs, k, newdir, newname)?;
        }

        add_entry(fs, k, newdir, newname, ino)?;
        clear_entry(fs, k, olddir, old_index)?;

        if moving_is_dir && olddir != newdir {
            // The moved directory's ".." now names the new parent.
            if let Some((dotdot, _)) = find_entry(fs, k, moving, b"..")? {
                let mut entry = DDirEntry::zeroed();
                entry.inode = k.ino_of(newdir) as u16;
                entry.set_name(b"..");
                write_entry(fs, k, moving, dotdot, &entry)?;
            }
            k.with_inode(olddir, |d| {
                d.nlinks = d.nlinks.saturating_sub(1);
                d.dirty = true;
            });
            k.with_inode(newdir, |d| {
                d.nlinks += 1;
                d.dirty = true;
            });
        }
        Ok(())
    })();
    k.iput(moving);
    res
}

/// Walk entries from `pos` (an entry index); emit returns false to
/// stop. Returns the next position.
pub fn getdents(
    fs: &MinixFs,
    k: &Kernel,
    dir: IRef,
    pos: u32,
    emit: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
) -> Result<u32> {
    let count = nr_entries(k, dir);
    let mut index = pos;
    while index < count {
        let entry = read_entry(fs, k, dir, index)?;
        index += 1;
        if entry.inode == 0 {
            continue;
        }
        if !emit(entry.inode as u32, 0, entry.name_bytes()) {
            break;
        }
    }
    Ok(index)
}
