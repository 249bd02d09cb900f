//! /dev population.
//!
//! The device tree is a tmpfs instance mounted at /dev; the standard
//! nodes are created here at boot and pty code adds and removes
//! /dev/pts/<n> entries at run time.

use alloc::{boxed::Box, vec::Vec};

use crate::{
    dev::{self, DevT},
    error::Result,
    fs::{path::AT_FDCWD, tmpfs::TmpFs, Mode, S_IFCHR, S_IFDIR},
    kernel::Kernel,
    param::NR_CONSOLES,
};

impl Kernel {
    /// Mount a fresh tmpfs at /dev and create the standard nodes.
    pub fn init_dev(&self) -> Result<()> {
        let target = self.namei(AT_FDCWD, b"/dev", true)?;
        self.mount_fs(Box::new(TmpFs::new()), DevT(0), Some(target))?;

        let chr = Mode(S_IFCHR | 0o666);
        self.do_mknod(AT_FDCWD, b"/dev/null", chr, dev::DEV_NULL)?;
        self.do_mknod(AT_FDCWD, b"/dev/zero", chr, dev::DEV_ZERO)?;
        self.do_mknod(AT_FDCWD, b"/dev/random", chr, dev::DEV_RANDOM)?;
        self.do_mknod(AT_FDCWD, b"/dev/ptmx", chr, dev::DEV_PTMX)?;

        // tty0 is the currently active console.
        self.do_mknod(
            AT_FDCWD,
            b"/dev/tty0",
            Mode(S_IFCHR | 0o620),
            DevT::new(dev::TTY_MAJOR, 0),
        )?;
        for n in 0..NR_CONSOLES as u32 {
            let mut name: Vec<u8> = b"/dev/tty".to_vec();
            push_decimal(&mut name, n + 1);
            self.do_mknod(
                AT_FDCWD,
                &name,
                Mode(S_IFCHR | 0o620),
                DevT::new(dev::TTY_MAJOR, n + 1),
            )?;
        }

        self.do_mkdir(AT_FDCWD, b"/dev/pts", Mode(S_IFDIR | 0o755))?;
        Ok(())
    }

    /// Create the /dev/pts/<n> node for a freshly opened pty pair.
    pub fn pts_mknod(&self, n: u32) -> Result<()> {
        let mut name: Vec<u8> = b"/dev/pts/".to_vec();
        push_decimal(&mut name, n);
        self.do_mknod(
            AT_FDCWD,
            &name,
            Mode(S_IFCHR | 0o620),
            DevT::new(dev::PTS_MAJOR, n),
        )
        .map(|_| ())
    }

    /// Remove the slave node when the master closes.
    pub fn pts_unlink(&self, n: u32) -> Result<()> {
        let mut name: Vec<u8> = b"/dev/pts/".to_vec();
        push_decimal(&mut name, n);
        self.do_unlink(AT_FDCWD, &name).map(|_| ())
    }
}

pub fn push_decimal(out: &mut Vec<u8>, mut n: u32) {
    let mut digits = [0u8; 10];
    let mut i = 0;
    loop {
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        i += 1;
        if n == 0 {
            break;
        }
    }
    while i > 0 {
        i -= 1;
        out.push(digits[i]);
    }
}
