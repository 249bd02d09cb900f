//! Inode and zone bitmaps.
//!
//! Allocation scans the cached bitmap blocks a 32-bit word at a time;
//! the first word that is not all ones is searched for its lowest clear
//! bit. Bit 0 of each map is reserved at mkfs time, so a zero return
//! means no space. Freeing refuses to clear a bit that is not set.

use itertools::Itertools;

use crate::{
    bio::BufRef,
    error::{KernelError, Result},
    fs::InodeData,
    kernel::Kernel,
    param::BLOCK_SIZE,
};

use super::{MinixFs, BITS_PER_BLOCK};

/// Lowest clear bit of one bitmap block, or None if it is full: scan
/// whole words first, then the bits of the first non-full word.
fn find_free_bit(k: &Kernel, buf: BufRef) -> Option<u32> {
    k.bcache.with_data(buf, |data| {
        data.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .find_position(|word| *word != u32::MAX)
            .map(|(w, word)| w as u32 * 32 + word.trailing_zeros())
    })
}

fn test_bit(k: &Kernel, buf: BufRef, bit: u32) -> bool {
    k.bcache
        .with_data(buf, |data| data[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
}

fn set_bit(k: &Kernel, buf: BufRef, bit: u32) {
    k.bcache
        .with_data_mut(buf, |data| data[(bit / 8) as usize] |= 1 << (bit % 8));
    k.bcache.mark_dirty(buf);
}

fn clear_bit(k: &Kernel, buf: BufRef, bit: u32) {
    k.bcache
        .with_data_mut(buf, |data| data[(bit / 8) as usize] &= !(1 << (bit % 8)));
    k.bcache.mark_dirty(buf);
}

/// Clear bits counted across a bitmap, capped at `total` tracked items.
pub fn count_free(k: &Kernel, bufs: &[BufRef], total: u32) -> u32 {
    let mut free = 0;
    let mut seen = 0;
    for buf in bufs {
        k.bcache.with_data(*buf, |data| {
            for byte in data.iter().take(BLOCK_SIZE) {
                for bit in 0..8 {
                    if seen >= total {
                        return;
                    }
                    if byte & (1 << bit) == 0 {
                        free += 1;
                    }
                    seen += 1;
                }
            }
        });
    }
    free
}

/// Allocate a data block: pick the bit, mark the bitmap dirty, then
/// hand back the zeroed block.
pub fn new_block(fs: &MinixFs, k: &Kernel) -> Result<u32> {
    for (i, buf) in fs.sbi.zmap.iter().enumerate() {
        let bit = match find_free_bit(k, *buf) {
            Some(bit) => bit,
            None => continue,
        };
        let block = i as u32 * BITS_PER_BLOCK + bit + fs.sbi.firstdatazone - 1;
        if block >= fs.sbi.nzones {
            return Err(KernelError::NoSpace);
        }
        set_bit(k, *buf, bit);

        // A reused block must not leak its previous contents.
        let data = k.bcache.getblk(&k.disks, fs.dev, block)?;
        k.bcache.bzero(data);
        k.bcache.brelse(&k.disks, data);
        return Ok(block);
    }
    Err(KernelError::NoSpace)
}

/// Release a data block. A clear bit means a double free, refused.
pub fn free_block(fs: &MinixFs, k: &Kernel, block: u32) -> Result<()> {
    if block < fs.sbi.firstdatazone || block >= fs.sbi.nzones {
        return Err(KernelError::InvalidArg);
    }
    let bit_index = block - fs.sbi.firstdatazone + 1;
    let buf = fs.sbi.zmap[(bit_index / BITS_PER_BLOCK) as usize];
    let bit = bit_index % BITS_PER_BLOCK;
    if !test_bit(k, buf, bit) {
        return Err(KernelError::InvalidArg);
    }
    clear_bit(k, buf, bit);
    Ok(())
}

/// Allocate an inode number.
pub fn new_inode_num(fs: &MinixFs, k: &Kernel) -> Result<u32> {
    for (i, buf) in fs.sbi.imap.iter().enumerate() {
        let bit = match find_free_bit(k, *buf) {
            Some(bit) => bit,
            None => continue,
        };
        let ino = i as u32 * BITS_PER_BLOCK + bit;
        if ino > fs.sbi.ninodes {
            return Err(KernelError::NoSpace);
        }
        set_bit(k, *buf, bit);
        return Ok(ino);
    }
    Err(KernelError::NoSpace)
}

/// Release a disk inode once link and reference counts are both zero.
pub fn free_inode(fs: &MinixFs, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
    if ino == 0 || ino > fs.sbi.ninodes {
        return Err(KernelError::InvalidArg);
    }
    let buf = fs.sbi.imap[(ino / BITS_PER_BLOCK) as usize];
    let bit = ino % BITS_PER_BLOCK;
    if !test_bit(k, buf, bit) {
        return Err(KernelError::InvalidArg);
    }
    clear_bit(k, buf, bit);
    d.nlinks = 0;
    Ok(())
}
