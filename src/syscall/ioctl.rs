//! ioctl dispatch.
//!
//! The descriptor resolves to a character device; console requests
//! fall through the tty layer into the console handler, pty masters
//! get their own small set, and anything unrecognised reports
//! NotSupported so userspace can probe capabilities.

use alloc::{boxed::Box, vec::Vec};

use spin::Mutex;

use crate::{
    dev,
    error::{KernelError, Result},
    kernel::Kernel,
    param::NR_CONSOLES,
    tty::{console::VT_ACKACQ, InputFlags, LocalFlags, OutputFlags, TtyKind, VtMode, NCCS},
};

// Keyboard and console requests.
pub const KDGKBTYPE: u32 = 0x4b33;
pub const KDSETMODE: u32 = 0x4b3a;
pub const KDGETMODE: u32 = 0x4b3b;
pub const KDGKBMODE: u32 = 0x4b44;
pub const KDSKBMODE: u32 = 0x4b45;
pub const KDGKBENT: u32 = 0x4b46;
pub const KDSKBENT: u32 = 0x4b47;
pub const KDSKBSENT: u32 = 0x4b49;

// VT requests.
pub const VT_GETMODE: u32 = 0x5601;
pub const VT_SETMODE: u32 = 0x5602;
pub const VT_GETSTATE: u32 = 0x5603;
pub const VT_RELDISP: u32 = 0x5605;
pub const VT_ACTIVATE: u32 = 0x5606;
pub const VT_WAITACTIVE: u32 = 0x5607;

// Termios and job control.
pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TIOCGPGRP: u32 = 0x540f;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;

// Pty master requests.
pub const TIOCGPTN: u32 = 0x8004_5430;
pub const TIOCSPTLCK: u32 = 0x4004_5431;

/// 101-key keyboard.
const KB_101: u8 = 2;

pub const NR_KEYS: usize = 128;
pub const NR_KEYMAPS: usize = 8;
pub const NR_FUNCS: usize = 16;
const NR_KEY_TYPES: u16 = 15;

pub const K_HOLE: u16 = 0x0b00;
pub const K_NOSUCHMAP: u16 = 0x0c00;
pub const K_ALLOCATED: u16 = 0x0b01;

/// Translation tables shared by the consoles.
pub struct KeyMaps {
    pub maps: Mutex<Vec<Option<Box<[u16; NR_KEYS]>>>>,
    pub funcs: Mutex<Vec<Option<Vec<u8>>>>,
}

impl KeyMaps {
    pub fn new() -> Self {
        let mut maps: Vec<Option<Box<[u16; NR_KEYS]>>> = Vec::with_capacity(NR_KEYMAPS);
        for _ in 0..NR_KEYMAPS {
            maps.push(None);
        }
        // The plain map exists from boot: identity ascii.
        let mut plain = Box::new([K_HOLE; NR_KEYS]);
        for (i, slot) in plain.iter_mut().enumerate() {
            *slot = i as u16;
        }
        maps[0] = Some(plain);

        let mut funcs = Vec::with_capacity(NR_FUNCS);
        for _ in 0..NR_FUNCS {
            funcs.push(None);
        }
        Self {
            maps: Mutex::new(maps),
            funcs: Mutex::new(funcs),
        }
    }
}

impl Kernel {
    /// ioctl(2) entry.
    pub fn sys_ioctl(&self, fd: i32, request: u32, arg: u32) -> Result<i32> {
        let fid = self.fd_to_file(fd)?;
        let (inode, priv_tty) = self.with_file(fid, |f| (f.inode, f.priv_tty))?;
        let (mode, rdev) = self.with_inode(inode, |d| (d.mode, d.rdev()));
        if !mode.is_chr() {
            return Err(KernelError::NotTty);
        }

        let idx = match rdev.major() {
            dev::TTY_MAJOR => match rdev.minor() {
                0 => self
                    .procs
                    .with_current(|t| t.tty)
                    .ok_or(KernelError::NotTty)?,
                m if (m as usize) <= NR_CONSOLES => m as usize - 1,
                _ => return Err(KernelError::NoDevice),
            },
            dev::PTS_MAJOR => crate::tty::pty::slave_index(rdev.minor() as usize),
            dev::TTYAUX_MAJOR => priv_tty.ok_or(KernelError::NotTty)?,
            _ => return Err(KernelError::NotTty),
        };

        // Pty-master specific requests first.
        if let Some(ret) = self.ptm_ioctl(idx, request, arg)? {
            return Ok(ret);
        }
        // Generic tty layer.
        if let Some(ret) = self.tty_ioctl(idx, request, arg)? {
            return Ok(ret);
        }
        // Console/VT layer.
        if let Some(ret) = self.console_ioctl(idx, request, arg)? {
            return Ok(ret);
        }
        Err(KernelError::NotSupported)
    }

    /// Master-side pty requests; None passes the request on.
    fn ptm_ioctl(&self, idx: usize, request: u32, arg: u32) -> Result<Option<i32>> {
        let n = {
            let tty = self.ttys.ttys[idx].lock();
            match tty.kind {
                TtyKind::PtyMaster(n) => n,
                _ => return Ok(None),
            }
        };
        match request {
            TIOCGPTN => {
                self.procs
                    .with_current(|t| t.mm.copy_out_u32(arg, n as u32))?;
                Ok(Some(0))
            }
            TIOCSPTLCK => Ok(Some(0)),
            _ => Ok(None),
        }
    }

    /// Termios and job-control requests; None passes the request on.
    fn tty_ioctl(&self, idx: usize, request: u32, arg: u32) -> Result<Option<i32>> {
        match request {
            TCGETS => {
                let mut raw = [0u8; 17 + NCCS];
                {
                    let tty = self.ttys.ttys[idx].lock();
                    raw[0..4].copy_from_slice(&tty.termios.iflag.bits().to_le_bytes());
                    raw[4..8].copy_from_slice(&tty.termios.oflag.bits().to_le_bytes());
                    raw[8..12].copy_from_slice(&0u32.to_le_bytes());
                    raw[12..16].copy_from_slice(&tty.termios.lflag.bits().to_le_bytes());
                    raw[16] = 0;
                    raw[17..17 + NCCS].copy_from_slice(&tty.termios.cc);
                }
                self.procs.with_current(|t| t.mm.copy_out(arg, &raw))?;
                Ok(Some(0))
            }
            TCSETS => {
                let mut raw = [0u8; 17 + NCCS];
                self.procs.with_current(|t| t.mm.copy_in(arg, &mut raw))?;
                let iflag = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let oflag = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
                let lflag = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
                let mut tty = self.ttys.ttys[idx].lock();
                tty.termios.iflag = InputFlags::from_bits_truncate(iflag);
                tty.termios.oflag = OutputFlags::from_bits_truncate(oflag);
                tty.termios.lflag = LocalFlags::from_bits_truncate(lflag);
                tty.termios.cc.copy_from_slice(&raw[17..17 + NCCS]);
                Ok(Some(0))
            }
            TIOCGPGRP => {
                let pgrp = self.ttys.ttys[idx].lock().pgrp;
                self.procs
                    .with_current(|t| t.mm.copy_out_u32(arg, pgrp as u32))?;
                Ok(Some(0))
            }
            TIOCSPGRP => {
                let pgrp = self
                    .procs
                    .with_current(|t| t.mm.copy_in_u32(arg))? as i32;
                self.ttys.ttys[idx].lock().pgrp = pgrp;
                Ok(Some(0))
            }
            TIOCGWINSZ => {
                let (rows, cols) = {
                    let tty = self.ttys.ttys[idx].lock();
                    match tty.fb.as_ref() {
                        Some(fb) => (fb.height as u16, fb.width as u16),
                        None => (
                            crate::param::SCREEN_HEIGHT as u16,
                            crate::param::SCREEN_WIDTH as u16,
                        ),
                    }
                };
                let mut raw = [0u8; 8];
                raw[0..2].copy_from_slice(&rows.to_le_bytes());
                raw[2..4].copy_from_slice(&cols.to_le_bytes());
                self.procs.with_current(|t| t.mm.copy_out(arg, &raw))?;
                Ok(Some(0))
            }
            _ => Ok(None),
        }
    }

    /// Console and VT requests; None falls through to the unknown-
    /// request sentinel.
    pub fn console_ioctl(&self, idx: usize, request: u32, arg: u32) -> Result<Option<i32>> {
        match request {
            KDGKBTYPE => {
                self.procs
                    .with_current(|t| t.mm.copy_out(arg, &[KB_101]))?;
                Ok(Some(0))
            }
            KDGETMODE => {
                let mode = self.ttys.ttys[idx].lock().mode;
                self.procs
                    .with_current(|t| t.mm.copy_out(arg, &[mode]))?;
                Ok(Some(0))
            }
            KDSETMODE => {
                self.ttys.ttys[idx].lock().mode = arg as u8;
                Ok(Some(0))
            }
            KDGKBMODE => {
                let kbdmode = self.ttys.ttys[idx].lock().kbdmode;
                self.procs
                    .with_current(|t| t.mm.copy_out_u32(arg, kbdmode as u32))?;
                Ok(Some(0))
            }
            KDSKBMODE => {
                if arg > 3 {
                    return Err(KernelError::InvalidArg);
                }
                self.ttys.ttys[idx].lock().kbdmode = arg as u8;
                Ok(Some(0))
            }
            KDGKBENT => {
                let mut raw = [0u8; 4];
                self.procs.with_current(|t| t.mm.copy_in(arg, &mut raw))?;
                let (table, index) = (raw[0] as usize, raw[1] as usize);
                if table >= NR_KEYMAPS || index >= NR_KEYS {
                    return Err(KernelError::InvalidArg);
                }
                let value = {
                    let maps = self.keymaps.maps.lock();
                    match &maps[table] {
                        Some(map) => {
                            let v = map[index];
                            if v >> 8 >= NR_KEY_TYPES {
                                K_HOLE
                            } else {
                                v
                            }
                        }
                        None if index != 0 => K_HOLE,
                        None => K_NOSUCHMAP,
                    }
                };
                self.procs
                    .with_current(|t| t.mm.copy_out(arg + 2, &value.to_le_bytes()))?;
                Ok(Some(0))
            }
            KDSKBENT => {
                let mut raw = [0u8; 4];
                self.procs.with_current(|t| t.mm.copy_in(arg, &mut raw))?;
                let (table, index) = (raw[0] as usize, raw[1] as usize);
                let value = u16::from_le_bytes([raw[2], raw[3]]);
                if table >= NR_KEYMAPS || index >= NR_KEYS || value >> 8 >= NR_KEY_TYPES {
                    return Err(KernelError::InvalidArg);
                }
                let mut maps = self.keymaps.maps.lock();
                let map = maps[table].get_or_insert_with(|| {
                    let mut m = Box::new([K_HOLE; NR_KEYS]);
                    m[0] = K_ALLOCATED;
                    m
                });
                map[index] = value;
                Ok(Some(0))
            }
            KDSKBSENT => {
                let mut head = [0u8; 1];
                self.procs.with_current(|t| t.mm.copy_in(arg, &mut head))?;
                let func = head[0] as usize;
                if func >= NR_FUNCS {
                    return Err(KernelError::InvalidArg);
                }
                // The string follows, NUL terminated.
                let mut string = Vec::new();
                for i in 0..512u32 {
                    let mut byte = [0u8];
                    self.procs
                        .with_current(|t| t.mm.copy_in(arg + 1 + i, &mut byte))?;
                    if byte[0] == 0 {
                        break;
                    }
                    string.push(byte[0]);
                }
                let mut funcs = self.keymaps.funcs.lock();
                funcs[func] = if string.is_empty() {
                    None
                } else {
                    Some(string)
                };
                Ok(Some(0))
            }
            VT_GETSTATE => {
                let active = self.current_console() as u16 + 1;
                let mut state: u16 = 1;
                let mut mask: u16 = 2;
                for _ in 0..NR_CONSOLES {
                    state |= mask;
                    mask <<= 1;
                }
                let mut raw = [0u8; 6];
                raw[0..2].copy_from_slice(&active.to_le_bytes());
                raw[4..6].copy_from_slice(&state.to_le_bytes());
                self.procs.with_current(|t| t.mm.copy_out(arg, &raw))?;
                Ok(Some(0))
            }
            VT_GETMODE => {
                let vt = self.ttys.ttys[idx].lock().vt_mode;
                let mut raw = [0u8; 8];
                raw[0] = vt.mode;
                raw[1] = vt.waitv;
                raw[2..4].copy_from_slice(&vt.relsig.to_le_bytes());
                raw[4..6].copy_from_slice(&vt.acqsig.to_le_bytes());
                raw[6..8].copy_from_slice(&vt.frsig.to_le_bytes());
                self.procs.with_current(|t| t.mm.copy_out(arg, &raw))?;
                Ok(Some(0))
            }
            VT_SETMODE => {
                let mut raw = [0u8; 8];
                self.procs.with_current(|t| t.mm.copy_in(arg, &mut raw))?;
                let pid = self.procs.current();
                let mut tty = self.ttys.ttys[idx].lock();
                tty.vt_mode = VtMode {
                    mode: raw[0],
                    waitv: raw[1],
                    relsig: u16::from_le_bytes([raw[2], raw[3]]),
                    acqsig: u16::from_le_bytes([raw[4], raw[5]]),
                    frsig: 0,
                };
                tty.vt_pid = pid;
                tty.vt_newvt = -1;
                Ok(Some(0))
            }
            VT_ACTIVATE => {
                if arg == 0 || arg as usize > NR_CONSOLES {
                    return Err(KernelError::NoDevice);
                }
                self.tty_change(arg as usize - 1)?;
                Ok(Some(0))
            }
            VT_RELDISP => {
                let (mode, newvt) = {
                    let tty = self.ttys.ttys[idx].lock();
                    (tty.vt_mode.mode, tty.vt_newvt)
                };
                if mode != crate::tty::VT_PROCESS {
                    return Err(KernelError::InvalidArg);
                }
                if newvt >= 0 {
                    if arg == 0 {
                        // Switch refused.
                        self.ttys.ttys[idx].lock().vt_newvt = -1;
                        return Ok(Some(0));
                    }
                    self.ttys.ttys[idx].lock().vt_newvt = -1;
                    self.tty_complete_change(newvt as usize);
                } else if arg != VT_ACKACQ {
                    return Err(KernelError::InvalidArg);
                }
                Ok(Some(0))
            }
            VT_WAITACTIVE => {
                if arg == 0 || arg as usize > NR_CONSOLES {
                    return Err(KernelError::NoDevice);
                }
                self.vt_waitactive(arg as usize - 1).map(Some)
            }
            _ => Ok(None),
        }
    }
}
