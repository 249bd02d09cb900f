//! Miscellaneous system calls: identity, time, limits, reboot.

use alloc::vec;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    param::HZ,
};

const UTSNAME_LEN: usize = 65;

const LINUX_REBOOT_MAGIC1: u32 = 0xfee1_dead;
const LINUX_REBOOT_MAGIC2: u32 = 672_274_793;
const LINUX_REBOOT_MAGIC2A: u32 = 85_072_278;
const LINUX_REBOOT_MAGIC2B: u32 = 369_367_448;
const LINUX_REBOOT_MAGIC2C: u32 = 537_993_216;

const LINUX_REBOOT_CMD_RESTART: i32 = 0x0123_4567;
const LINUX_REBOOT_CMD_HALT: i32 = 0xcdef_0123u32 as i32;
const LINUX_REBOOT_CMD_POWER_OFF: i32 = 0x4321_fedc;
const LINUX_REBOOT_CMD_CAD_ON: i32 = 0x89ab_cdef_u32 as i32;
const LINUX_REBOOT_CMD_CAD_OFF: i32 = 0;

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;

const RLIM_NLIMITS: i32 = 16;
const RLIM_INFINITY: u64 = u64::MAX;
/// RLIMIT_NOFILE.
const RLIMIT_NOFILE: i32 = 7;

impl Kernel {
    pub fn sys_umask(&self, mask: u16) -> Result<i32> {
        Ok(self.procs.with_current(|t| {
            let old = t.fs.umask;
            t.fs.umask = mask & 0o777;
            old as i32
        }))
    }

    pub fn sys_uname(&self, buf_addr: u32) -> Result<i32> {
        if buf_addr == 0 {
            return Err(KernelError::InvalidArg);
        }
        let fields: [&[u8]; 5] = [b"rux", b"rux", b"0.1.0", b"rux 0.1.0", b"x86"];
        let mut out = vec![0u8; UTSNAME_LEN * 5];
        for (i, field) in fields.iter().enumerate() {
            let off = i * UTSNAME_LEN;
            out[off..off + field.len()].copy_from_slice(field);
        }
        self.procs
            .with_current(|t| t.mm.copy_out(buf_addr, &out))?;
        Ok(0)
    }

    pub fn sys_sysinfo(&self, buf_addr: u32) -> Result<i32> {
        // struct sysinfo, first fields only: uptime then zeroed loads.
        let mut out = [0u8; 64];
        let uptime = (self.jiffies() / HZ) as u32;
        out[..4].copy_from_slice(&uptime.to_le_bytes());
        self.procs
            .with_current(|t| t.mm.copy_out(buf_addr, &out))?;
        Ok(0)
    }

    pub fn sys_clock_gettime64(&self, clockid: i32, tp_addr: u32) -> Result<i32> {
        let (sec, nsec) = match clockid {
            CLOCK_REALTIME => {
                let j = self.jiffies();
                (
                    self.startup_time as u64 + j / HZ,
                    (j % HZ) * (1_000_000_000 / HZ),
                )
            }
            CLOCK_MONOTONIC => {
                let j = self.jiffies();
                (j / HZ, (j % HZ) * (1_000_000_000 / HZ))
            }
            _ => return Err(KernelError::NotSupported),
        };
        self.procs.with_current(|t| {
            t.mm.copy_out(tp_addr, &sec.to_le_bytes())?;
            t.mm.copy_out(tp_addr + 8, &(nsec as u32).to_le_bytes())?;
            t.mm.copy_out(tp_addr + 12, &0u32.to_le_bytes())
        })?;
        Ok(0)
    }

    pub fn sys_getrandom(&self, buf_addr: u32, len: usize) -> Result<i32> {
        let len = len.min(256);
        let mut buf = vec![0u8; len];
        self.fill_random(&mut buf);
        self.procs
            .with_current(|t| t.mm.copy_out(buf_addr, &buf))?;
        Ok(len as i32)
    }

    pub fn sys_prlimit64(
        &self,
        pid: i32,
        resource: i32,
        new_addr: u32,
        old_addr: u32,
    ) -> Result<i32> {
        if resource >= RLIM_NLIMITS || resource < 0 {
            return Err(KernelError::InvalidArg);
        }
        if pid != 0 && !self.procs.exists(pid) {
            return Err(KernelError::NoProcess);
        }
        if new_addr != 0 {
            // Limits are fixed in this kernel.
            return Err(KernelError::PermissionDenied);
        }
        if old_addr != 0 {
            let (cur, max) = if resource == RLIMIT_NOFILE {
                (
                    crate::param::NR_OPEN as u64,
                    crate::param::NR_OPEN as u64,
                )
            } else {
                (RLIM_INFINITY, RLIM_INFINITY)
            };
            self.procs.with_current(|t| {
                t.mm.copy_out(old_addr, &cur.to_le_bytes())?;
                t.mm.copy_out(old_addr + 8, &max.to_le_bytes())
            })?;
        }
        Ok(0)
    }

    pub fn sys_reboot(&self, magic1: u32, magic2: u32, cmd: i32) -> Result<i32> {
        if magic1 != LINUX_REBOOT_MAGIC1
            || (magic2 != LINUX_REBOOT_MAGIC2
                && magic2 != LINUX_REBOOT_MAGIC2A
                && magic2 != LINUX_REBOOT_MAGIC2B
                && magic2 != LINUX_REBOOT_MAGIC2C)
        {
            return Err(KernelError::InvalidArg);
        }
        match cmd {
            LINUX_REBOOT_CMD_RESTART
            | LINUX_REBOOT_CMD_HALT
            | LINUX_REBOOT_CMD_POWER_OFF => {
                self.sync_all();
                self.arch.restart();
            }
            LINUX_REBOOT_CMD_CAD_ON | LINUX_REBOOT_CMD_CAD_OFF => Ok(0),
            _ => Err(KernelError::InvalidArg),
        }
    }
}
