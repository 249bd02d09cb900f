//! The kernel object.
//!
//! Every process-wide table lives here, allocated once at boot and
//! never destroyed. Nothing is reached through hidden globals: traps
//! and drivers receive `&Kernel` and go through it, which also lets
//! the host test harness build as many independent kernels as it
//! wants.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    bio::Bcache,
    dev::DevT,
    error::Result,
    file::FileTable,
    fs::{minix::MinixFs, InodeCache, Mounts},
    hal::{ArchOps, DiskTable, VideoOut},
    net::SocketTable,
    proc::{timer::Timers, Procs},
    syscall::ioctl::KeyMaps,
    tty::{pty::PtyTable, TtyTable},
};

pub struct Kernel {
    /// Monotonic tick counter.
    pub ticks: AtomicU64,
    /// Wall-clock seconds at boot, from the RTC.
    pub startup_time: u32,

    pub timers: Timers,
    pub disks: DiskTable,
    pub bcache: Bcache,
    pub icache: InodeCache,
    pub mounts: Mounts,
    pub ftable: FileTable,
    pub procs: Procs,
    pub ttys: TtyTable,
    pub ptys: PtyTable,
    pub sockets: SocketTable,
    pub keymaps: KeyMaps,

    pub video: Box<dyn VideoOut>,
    pub arch: Box<dyn ArchOps>,

    /// Entropy pool behind /dev/random and getrandom.
    random: Mutex<u64>,
    /// Page-directory token allocator; the paging layer maps tokens to
    /// real directories.
    next_pgd: AtomicU32,
}

impl Kernel {
    pub fn new(video: Box<dyn VideoOut>, arch: Box<dyn ArchOps>, startup_time: u32) -> Box<Kernel> {
        Box::new(Kernel {
            ticks: AtomicU64::new(0),
            startup_time,
            timers: Timers::new(),
            disks: DiskTable::new(),
            bcache: Bcache::new(),
            icache: InodeCache::new(),
            mounts: Mounts::new(),
            ftable: FileTable::new(),
            procs: Procs::new(),
            ttys: TtyTable::new(),
            ptys: PtyTable::new(),
            sockets: SocketTable::new(),
            keymaps: KeyMaps::new(),
            video,
            arch,
            random: Mutex::new(0x853c_49e6_748f_ea9bu64 ^ startup_time as u64),
            next_pgd: AtomicU32::new(1),
        })
    }

    /// Bring the core up: the idle task becomes current and the first
    /// console becomes the display.
    pub fn boot(
        video: Box<dyn VideoOut>,
        arch: Box<dyn ArchOps>,
        startup_time: u32,
    ) -> Box<Kernel> {
        let kernel = Kernel::new(video, arch, startup_time);
        kernel.task_bootstrap();
        {
            let mut tty = kernel.ttys.ttys[0].lock();
            if let Some(fb) = tty.fb.as_mut() {
                fb.active = true;
            }
        }
        kernel
    }

    /// Mount the root Minix file system and point the current task's
    /// root and cwd at it.
    pub fn mount_root(&self, dev: DevT) -> Result<()> {
        let fs = MinixFs::mount(self, dev)?;
        self.mount_fs(fs, dev, None)?;
        let root = self.root_inode()?;
        self.idup(root);
        self.idup(root);
        let (old_cwd, old_root) = self.procs.with_current(|t| {
            let old = (t.fs.cwd.replace(root), t.fs.root.replace(root));
            old
        });
        if let Some(old) = old_cwd {
            self.iput(old);
        }
        if let Some(old) = old_root {
            self.iput(old);
        }
        Ok(())
    }

    pub fn alloc_pgd(&self) -> u32 {
        self.next_pgd.fetch_add(1, Ordering::SeqCst)
    }

    /// xorshift64 pool; reseeded by the timer interrupt jitter on real
    /// hardware.
    pub fn fill_random(&self, buf: &mut [u8]) {
        let mut state = self.random.lock();
        for chunk in buf.chunks_mut(8) {
            let mut x = *state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *state = x;
            let bytes = x.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Mix an interrupt timestamp into the pool.
    pub fn add_entropy(&self, sample: u64) {
        let mut state = self.random.lock();
        *state ^= sample.rotate_left(17).wrapping_mul(0x2545_f491_4f6c_dd1d);
    }

    /// Flush all file system state to disk.
    pub fn sync_all(&self) {
        self.isync();
        self.bcache.sync_all(&self.disks);
    }
}
