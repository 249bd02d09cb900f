//! User address-space model.
//!
//! Paging proper lives in the arch layer; the core tracks the virtual
//! memory areas of each task and a sparse page map standing in for the
//! frames the page tables would reference. `copy_in`/`copy_out` are the
//! only ways kernel code touches user memory.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};

use bitflags::bitflags;

use crate::{
    error::{KernelError, Result},
    param::{NR_VMA, PAGE_SIZE},
};

bitflags! {
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
        const GROWSDOWN = 1 << 4;
    }
}

/// A half-open byte range of the address space.
#[derive(Clone, Debug)]
pub struct VmArea {
    pub start: u32,
    pub end: u32,
    pub flags: VmFlags,
}

/// Page size as the u32 the address math wants.
pub const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;
/// Lowest mmap address; the text segment convention puts code below.
pub const MMAP_BASE: u32 = 0x4000_0000;
/// Top of the user stack.
pub const USER_STACK_TOP: u32 = 0xc000_0000;
/// Default stack reservation.
pub const USER_STACK_SIZE: u32 = 0x0080_0000;

/// Per-task memory state: the page-directory token handed to the arch
/// layer, segment bounds, the VM area list and the demand-zero pages.
pub struct Mm {
    pub pgd: u32,
    pub start_text: u32,
    pub end_text: u32,
    pub start_brk: u32,
    pub brk: u32,
    pub start_stack: u32,
    areas: Vec<VmArea>,
    pages: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl Mm {
    pub fn new(pgd: u32) -> Self {
        Self {
            pgd,
            start_text: 0,
            end_text: 0,
            start_brk: 0,
            brk: 0,
            start_stack: USER_STACK_TOP,
            areas: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    /// Duplicate for fork. Pages are copied eagerly here; the paging
    /// layer records the copy-on-write intent for the real frames.
    pub fn duplicate(&self, pgd: u32) -> Self {
        Self {
            pgd,
            start_text: self.start_text,
            end_text: self.end_text,
            start_brk: self.start_brk,
            brk: self.brk,
            start_stack: self.start_stack,
            areas: self.areas.clone(),
            pages: self
                .pages
                .iter()
                .map(|(a, p)| (*a, Box::new(**p)))
                .collect(),
        }
    }

    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    pub fn find_area(&self, addr: u32) -> Option<&VmArea> {
        self.areas.iter().find(|a| a.start <= addr && addr < a.end)
    }

    /// Attach `[start, end)`. Overlaps with an existing area are refused.
    pub fn map_area(&mut self, start: u32, end: u32, flags: VmFlags) -> Result<()> {
        if start >= end || start % PAGE_SIZE as u32 != 0 {
            return Err(KernelError::InvalidArg);
        }
        if self.areas.len() >= NR_VMA {
            return Err(KernelError::NoMemory);
        }
        if self.areas.iter().any(|a| start < a.end && a.start < end) {
            return Err(KernelError::Exists);
        }
        self.areas.push(VmArea { start, end, flags });
        self.areas.sort_by_key(|a| a.start);
        Ok(())
    }

    /// Detach every page of `[start, end)` and shrink or split the areas
    /// covering it.
    pub fn unmap(&mut self, start: u32, end: u32) -> Result<()> {
        if start >= end || start % PAGE_SIZE as u32 != 0 {
            return Err(KernelError::InvalidArg);
        }
        let mut split = Vec::new();
        self.areas.retain_mut(|a| {
            if end <= a.start || a.end <= start {
                return true;
            }
            if start <= a.start && a.end <= end {
                return false;
            }
            if a.start < start && end < a.end {
                split.push(VmArea {
                    start: end,
                    end: a.end,
                    flags: a.flags,
                });
                a.end = start;
                return true;
            }
            if a.start < start {
                a.end = start;
            } else {
                a.start = end;
            }
            true
        });
        self.areas.extend(split);
        self.areas.sort_by_key(|a| a.start);

        let first = start & !(PAGE_SIZE as u32 - 1);
        let mut page = first;
        while page < end {
            self.pages.remove(&page);
            match page.checked_add(PAGE_SIZE as u32) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Find a free gap of `len` bytes at or above `MMAP_BASE`.
    pub fn find_free_range(&self, len: u32) -> Result<u32> {
        let mut addr = MMAP_BASE;
        for a in self.areas.iter().filter(|a| a.end > MMAP_BASE) {
            if a.start.saturating_sub(addr) >= len {
                return Ok(addr);
            }
            addr = addr.max(a.end);
        }
        if USER_STACK_TOP - USER_STACK_SIZE - addr >= len {
            Ok(addr)
        } else {
            Err(KernelError::NoMemory)
        }
    }

    /// Move the program break. Shrinking discards pages above the new
    /// break; growing is demand-zero.
    pub fn set_brk(&mut self, new_brk: u32) -> Result<u32> {
        if new_brk == 0 {
            return Ok(self.brk);
        }
        if new_brk < self.start_brk {
            return Err(KernelError::NoMemory);
        }
        if new_brk < self.brk {
            let first = (new_brk + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1);
            let mut page = first;
            while page < self.brk {
                self.pages.remove(&page);
                page += PAGE_SIZE as u32;
            }
        }
        self.brk = new_brk;
        Ok(self.brk)
    }

    fn readable(&self, addr: u32) -> bool {
        if self.find_area(addr).is_some() {
            return true;
        }
        // brk and stack regions are implicitly mapped.
        (self.start_brk <= addr && addr < self.brk)
            || (self.start_stack - USER_STACK_SIZE <= addr && addr < self.start_stack)
    }

    /// Copy kernel bytes out to user memory.
    pub fn copy_out(&mut self, addr: u32, src: &[u8]) -> Result<()> {
        let end = addr
            .checked_add(src.len() as u32)
            .ok_or(KernelError::BadAddress)?;
        for a in addr..end {
            if !self.readable(a) {
                return Err(KernelError::BadAddress);
            }
        }
        for (i, byte) in src.iter().enumerate() {
            let a = addr + i as u32;
            let base = a & !(PAGE_SIZE as u32 - 1);
            let page = self
                .pages
                .entry(base)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[(a - base) as usize] = *byte;
        }
        Ok(())
    }

    /// Copy user memory into a kernel buffer. Unwritten pages of a valid
    /// mapping read back as zeroes.
    pub fn copy_in(&self, addr: u32, dst: &mut [u8]) -> Result<()> {
        let end = addr
            .checked_add(dst.len() as u32)
            .ok_or(KernelError::BadAddress)?;
        for a in addr..end {
            if !self.readable(a) {
                return Err(KernelError::BadAddress);
            }
        }
        for (i, byte) in dst.iter_mut().enumerate() {
            let a = addr + i as u32;
            let base = a & !(PAGE_SIZE as u32 - 1);
            *byte = match self.pages.get(&base) {
                Some(page) => page[(a - base) as usize],
                None => 0,
            };
        }
        Ok(())
    }

    pub fn copy_out_u32(&mut self, addr: u32, val: u32) -> Result<()> {
        self.copy_out(addr, &val.to_le_bytes())
    }

    pub fn copy_in_u32(&self, addr: u32) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.copy_in(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Wipe everything; exec calls this before loading the new image.
    pub fn clear(&mut self) {
        self.areas.clear();
        self.pages.clear();
        self.start_text = 0;
        self.end_text = 0;
        self.start_brk = 0;
        self.brk = 0;
        self.start_stack = USER_STACK_TOP;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mm_with_area() -> Mm {
        let mut mm = Mm::new(1);
        mm.map_area(0x1000_0000, 0x1000_4000, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        mm
    }

    #[test]
    fn copy_round_trip() {
        let mut mm = mm_with_area();
        mm.copy_out(0x1000_0ffe, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        // Crosses a page boundary.
        mm.copy_in(0x1000_0ffe, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn unmapped_access_faults() {
        let mut mm = mm_with_area();
        assert_eq!(
            mm.copy_out(0x2000_0000, b"x"),
            Err(KernelError::BadAddress)
        );
        let mut buf = [0u8; 1];
        assert_eq!(mm.copy_in(0x0, &mut buf), Err(KernelError::BadAddress));
    }

    #[test]
    fn untouched_pages_read_zero() {
        let mm = mm_with_area();
        let mut buf = [0xffu8; 8];
        mm.copy_in(0x1000_2000, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn overlapping_map_is_refused() {
        let mut mm = mm_with_area();
        assert_eq!(
            mm.map_area(0x1000_2000, 0x1000_5000, VmFlags::READ),
            Err(KernelError::Exists)
        );
    }

    #[test]
    fn unmap_splits_areas() {
        let mut mm = mm_with_area();
        mm.unmap(0x1000_1000, 0x1000_2000).unwrap();
        assert!(mm.find_area(0x1000_0000).is_some());
        assert!(mm.find_area(0x1000_1000).is_none());
        assert!(mm.find_area(0x1000_2000).is_some());
    }

    #[test]
    fn fork_copies_pages() {
        let mut mm = mm_with_area();
        mm.copy_out(0x1000_0000, b"parent").unwrap();
        let mut child = mm.duplicate(2);
        child.copy_out(0x1000_0000, b"child!").unwrap();

        let mut buf = [0u8; 6];
        mm.copy_in(0x1000_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let mut mm = Mm::new(1);
        mm.start_brk = 0x0800_0000;
        mm.brk = 0x0800_0000;
        assert_eq!(mm.set_brk(0x0800_2000).unwrap(), 0x0800_2000);
        mm.copy_out(0x0800_1000, b"heap").unwrap();
        assert_eq!(mm.set_brk(0x0800_0000).unwrap(), 0x0800_0000);
        assert_eq!(mm.set_brk(0x0700_0000), Err(KernelError::NoMemory));
    }
}
