//! Hardware abstraction seams.
//!
//! The kernel core is machine-independent; everything that touches real
//! hardware sits behind these traits. The production build wires ATA,
//! the EGA/RGB framebuffer and the x86 context switch here; the host
//! test harness substitutes a ram disk, a recording video target and a
//! no-op switch.

use alloc::{boxed::Box, vec, vec::Vec};

use spin::Mutex;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    param::BLOCK_SIZE,
};

/// One block device. Offsets are in blocks of `BLOCK_SIZE` bytes.
pub trait Disk: Send + Sync {
    fn read_block(&self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;
    fn write_block(&self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;
    /// Device capacity in blocks.
    fn nr_blocks(&self) -> u32;
}

/// Bottom half of the console: receives cell updates for the active
/// framebuffer and renders them to the screen.
pub trait VideoOut: Send + Sync {
    fn update_region(&self, origin: usize, cells: &[u16]);
    fn update_cursor(&self, x: u32, y: u32);
    fn show_cursor(&self, on: bool);
}

/// Context-switch and reset hooks supplied by the arch layer.
pub trait ArchOps: Send + Sync {
    /// Switch kernel stacks from `prev` to `next`. Returns when `prev`
    /// is scheduled again.
    fn switch_to(&self, prev: u32, next: u32);
    /// Point the TSS at the incoming task's kernel stack.
    fn set_kernel_stack(&self, esp0: u32);
    /// Install the incoming task's page directory.
    fn switch_page_directory(&self, pgd: u32);
    /// Pulse the CPU reset line.
    fn restart(&self) -> !;
}

/// Memory-backed block device, used for the root image under the test
/// harness and for tmpfs-style scratch devices.
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
}

impl RamDisk {
    pub fn new(nr_blocks: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; nr_blocks as usize]),
        }
    }
}

impl Disk for RamDisk {
    fn read_block(&self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let blocks = self.blocks.lock();
        let src = blocks.get(block as usize).ok_or(KernelError::Io)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let dst = blocks.get_mut(block as usize).ok_or(KernelError::Io)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn nr_blocks(&self) -> u32 {
        self.blocks.lock().len() as u32
    }
}

/// Registered block devices, indexed by major/minor.
pub struct DiskTable {
    disks: Mutex<Vec<(DevT, Box<dyn Disk>)>>,
}

impl DiskTable {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, dev: DevT, disk: Box<dyn Disk>) {
        self.disks.lock().push((dev, disk));
    }

    pub fn read_block(&self, dev: DevT, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let disks = self.disks.lock();
        let (_, disk) = disks
            .iter()
            .find(|(d, _)| *d == dev)
            .ok_or(KernelError::NoDevice)?;
        disk.read_block(block, buf)
    }

    pub fn write_block(&self, dev: DevT, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let disks = self.disks.lock();
        let (_, disk) = disks
            .iter()
            .find(|(d, _)| *d == dev)
            .ok_or(KernelError::NoDevice)?;
        disk.write_block(block, buf)
    }
}

/// Video target that drops everything; consoles still keep their cell
/// buffers, so tests inspect those instead.
pub struct NullVideo;

impl VideoOut for NullVideo {
    fn update_region(&self, _origin: usize, _cells: &[u16]) {}
    fn update_cursor(&self, _x: u32, _y: u32) {}
    fn show_cursor(&self, _on: bool) {}
}

/// Arch hooks for the host harness: the switch is a no-op and switches
/// are recorded so scheduler tests can assert on them.
pub struct NullArch {
    pub switches: Mutex<Vec<(u32, u32)>>,
}

impl NullArch {
    pub fn new() -> Self {
        Self {
            switches: Mutex::new(Vec::new()),
        }
    }
}

impl ArchOps for NullArch {
    fn switch_to(&self, prev: u32, next: u32) {
        self.switches.lock().push((prev, next));
    }

    fn set_kernel_stack(&self, _esp0: u32) {}

    fn switch_page_directory(&self, _pgd: u32) {}

    fn restart(&self) -> ! {
        panic!("machine restart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trip() {
        let disk = RamDisk::new(8);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xaa;
        block[BLOCK_SIZE - 1] = 0x55;
        disk.write_block(3, &block).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        disk.read_block(3, &mut out).unwrap();
        assert_eq!(out[0], 0xaa);
        assert_eq!(out[BLOCK_SIZE - 1], 0x55);
    }

    #[test]
    fn ramdisk_out_of_range_is_io_error() {
        let disk = RamDisk::new(2);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read_block(2, &mut buf), Err(KernelError::Io));
    }
}
