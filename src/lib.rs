//! rux: a small Unix-like x86 kernel core in Rust.
//!
//! The machine-independent heart of the kernel: buffer and inode
//! caches, the VFS with its Minix/tmp/dev/proc drivers, a round-robin
//! scheduler with channel sleeps and signals, the tty line discipline
//! with virtual consoles and ptys, a loopback socket layer, and the
//! system-call surface tying them together. Hardware sits behind the
//! `hal` traits; the host test harness plugs in ram disks and a
//! recording video target, the boot crate plugs in the real drivers.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

#[macro_use]
pub mod klog;

pub mod bio;
pub mod dev;
pub mod error;
pub mod fb;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod net;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod syscall;
pub mod tty;
pub mod vm;
