/// Maximum number of tasks.
pub const NPROC: usize = 64;

/// Open files per task.
pub const NR_OPEN: usize = 32;

/// Open files per system.
pub const NR_FILE: usize = 256;

/// Maximum number of in-memory inodes.
pub const NR_INODE: usize = 128;

/// Size of the disk block cache.
pub const NR_BUFFER: usize = 64;

/// Buffer hash buckets, next power of two >= NR_BUFFER / 4.
pub const BUFFER_HASH_SIZE: usize = (NR_BUFFER / 4).next_power_of_two();

/// Block size.
pub const BLOCK_SIZE: usize = 1024;

/// Page size of the user address space model.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of mounted file systems.
pub const NR_MOUNT: usize = 8;

/// Maximum number of block/char device majors.
pub const NR_DEV: usize = 16;

/// Virtual consoles.
pub const NR_CONSOLES: usize = 4;

/// PTY pairs.
pub const NR_PTYS: usize = 4;

/// TTY table size: consoles, then pty slaves, then pty masters.
pub const NR_TTYS: usize = NR_CONSOLES + 2 * NR_PTYS;

/// Sockets per system.
pub const NR_SOCKETS: usize = 32;

/// Maximum path length.
pub const MAX_PATH: usize = 128;

/// Maximum length of one path component.
pub const MAX_NAME: usize = 30;

/// Symbolic links followed before LOOP is reported.
pub const MAX_SYMLINKS: usize = 8;

/// Maximum number of tracked virtual memory areas per task.
pub const NR_VMA: usize = 32;

/// TTY ring queue size.
pub const TTY_BUF_SIZE: usize = 1024;

/// CSI parameter slots.
pub const NPARS: usize = 16;

/// Signals.
pub const NSIG: usize = 32;

/// Maximum length of a task name.
pub const TASK_NAME_LEN: usize = 16;

/// Timer ticks per second.
pub const HZ: u64 = 100;

/// Socket receive queue cap, in datagrams.
pub const SKB_QUEUE_LEN: usize = 64;

/// Default screen geometry for virtual consoles.
pub const SCREEN_WIDTH: usize = 80;
pub const SCREEN_HEIGHT: usize = 25;
