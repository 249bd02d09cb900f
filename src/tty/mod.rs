//! TTY layer.
//!
//! Every terminal, console or pty end, is a `Tty` slot: a raw input
//! queue fed by the device, a cooked buffer the line discipline edits
//! in place, and a write queue drained by the slot's driver. The
//! cooked buffer keeps three wrapping counters: bytes [r, w) are
//! committed and readable, bytes [w, e) are the line still being
//! edited.

use array_macro::array;
use bitflags::bitflags;
use spin::Mutex;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    kernel::Kernel,
    param::{NPARS, NR_CONSOLES, NR_PTYS, NR_TTYS, SCREEN_HEIGHT, SCREEN_WIDTH, TTY_BUF_SIZE},
    fb::FrameBuffer,
    proc::{
        signal::{SIGINT, SIGQUIT, SIGTSTP},
        Chan, Pid,
    },
    tty::ring::Ring,
};

pub mod console;
pub mod pty;
pub mod ring;

bitflags! {
    pub struct InputFlags: u32 {
        const INLCR = 0o100;
        const IGNCR = 0o200;
        const ICRNL = 0o400;
    }
}

bitflags! {
    pub struct OutputFlags: u32 {
        const OPOST = 0o1;
        const ONLCR = 0o4;
    }
}

bitflags! {
    pub struct LocalFlags: u32 {
        const ISIG = 0o1;
        const ICANON = 0o2;
        const ECHO = 0o10;
        const ECHOE = 0o20;
        const ECHOK = 0o40;
    }
}

pub const NCCS: usize = 19;
pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VSUSP: usize = 10;

#[derive(Copy, Clone)]
pub struct Termios {
    pub iflag: InputFlags,
    pub oflag: OutputFlags,
    pub lflag: LocalFlags,
    pub cc: [u8; NCCS],
}

impl Termios {
    /// Sane cooked-mode defaults.
    pub fn cooked() -> Self {
        let mut cc = [0u8; NCCS];
        cc[VINTR] = 3; // ^C
        cc[VQUIT] = 28; // ^\
        cc[VERASE] = 127;
        cc[VKILL] = 21; // ^U
        cc[VEOF] = 4; // ^D
        cc[VSUSP] = 26; // ^Z
        Self {
            iflag: InputFlags::ICRNL,
            oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
            lflag: LocalFlags::ISIG
                | LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK,
            cc,
        }
    }

    /// Pty masters pass everything through untouched.
    pub fn raw() -> Self {
        Self {
            iflag: InputFlags::empty(),
            oflag: OutputFlags::empty(),
            lflag: LocalFlags::empty(),
            cc: [0; NCCS],
        }
    }
}

/// Line-discipline buffer with an edit window.
pub struct CookedBuf {
    buf: [u8; TTY_BUF_SIZE],
    /// Read index: next committed byte for read(2).
    pub r: usize,
    /// Commit index: end of committed bytes.
    pub w: usize,
    /// Edit index: end of the line being assembled.
    pub e: usize,
}

impl CookedBuf {
    pub const fn new() -> Self {
        Self {
            buf: [0; TTY_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.w.wrapping_sub(self.r)
    }

    fn room(&self) -> usize {
        TTY_BUF_SIZE - self.e.wrapping_sub(self.r)
    }

    fn push(&mut self, c: u8) -> bool {
        if self.room() == 0 {
            return false;
        }
        self.buf[self.e % TTY_BUF_SIZE] = c;
        self.e = self.e.wrapping_add(1);
        true
    }

    /// Drop the last uncommitted byte; returns it for echo handling.
    fn erase(&mut self) -> Option<u8> {
        if self.e == self.w {
            return None;
        }
        self.e = self.e.wrapping_sub(1);
        Some(self.buf[self.e % TTY_BUF_SIZE])
    }

    /// Commit the edited line for readers.
    fn commit(&mut self) {
        self.w = self.e;
    }

    pub fn getc(&mut self) -> Option<u8> {
        if self.r == self.w {
            return None;
        }
        let c = self.buf[self.r % TTY_BUF_SIZE];
        self.r = self.r.wrapping_add(1);
        Some(c)
    }

    pub fn ungetc(&mut self) {
        self.r = self.r.wrapping_sub(1);
    }
}

/// Parser states for ESC sequences.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CsiState {
    Normal,
    Escape,
    Square,
    GetPars,
    GotPars,
}

/// Modes set through KDSETMODE.
pub const KD_TEXT: u8 = 0;
pub const KD_GRAPHICS: u8 = 1;

/// Keyboard translation modes.
pub const VC_XLATE: u8 = 0;
pub const VC_RAW: u8 = 1;
pub const VC_MEDIUMRAW: u8 = 2;
pub const VC_UNICODE: u8 = 3;

/// VT switching modes.
pub const VT_AUTO: u8 = 0;
pub const VT_PROCESS: u8 = 1;

#[derive(Copy, Clone, Default)]
pub struct VtMode {
    pub mode: u8,
    pub waitv: u8,
    pub relsig: u16,
    pub acqsig: u16,
    pub frsig: u16,
}

#[derive(Copy, Clone)]
pub enum TtyKind {
    Console,
    PtySlave(usize),
    PtyMaster(usize),
}

pub struct Tty {
    pub idx: usize,
    pub dev: DevT,
    pub kind: TtyKind,
    /// Pty peer, mutually linked.
    pub link: Option<usize>,
    pub termios: Termios,
    pub pgrp: Pid,

    pub read_q: Ring,
    pub cooked: CookedBuf,
    pub write_q: Ring,

    // Console rendering state.
    pub fb: Option<FrameBuffer>,
    pub state: CsiState,
    pub npars: usize,
    pub pars: [u32; NPARS],
    pub priv_mode: bool,
    pub color: u8,
    pub def_color: u8,
    pub intensity: u8,
    pub underline: bool,
    pub reverse: bool,
    pub attr: u8,
    pub erase_char: u16,
    /// Cursor visible (DECCM).
    pub deccm: bool,

    pub mode: u8,
    pub kbdmode: u8,
    pub vt_mode: VtMode,
    pub vt_pid: Pid,
    pub vt_newvt: i32,

    /// Pty pair open count.
    pub count: u32,
}

impl Tty {
    pub fn new_console(idx: usize) -> Self {
        let mut tty = Self::bare(idx, TtyKind::Console);
        tty.dev = DevT::new(crate::dev::TTY_MAJOR, idx as u32 + 1);
        tty.fb = Some(FrameBuffer::new(
            SCREEN_WIDTH as u32,
            SCREEN_HEIGHT as u32,
        ));
        tty
    }

    pub fn bare(idx: usize, kind: TtyKind) -> Self {
        Self {
            idx,
            dev: DevT(0),
            kind,
            link: None,
            termios: Termios::cooked(),
            pgrp: 0,
            read_q: Ring::new(),
            cooked: CookedBuf::new(),
            write_q: Ring::new(),
            fb: None,
            state: CsiState::Normal,
            npars: 0,
            pars: [0; NPARS],
            priv_mode: false,
            color: 0x07,
            def_color: 0x07,
            intensity: 1,
            underline: false,
            reverse: false,
            attr: 0x07,
            erase_char: 0x0720,
            deccm: true,
            mode: KD_TEXT,
            kbdmode: VC_XLATE,
            vt_mode: VtMode::default(),
            vt_pid: -1,
            vt_newvt: -1,
            count: 0,
        }
    }

    /// Recompute the attribute byte from the SGR state.
    pub fn update_attr(&mut self) {
        let mut fg = self.color & 0x0f;
        let bg = (self.color >> 4) & 0x0f;
        if self.intensity == 2 {
            fg |= 8;
        }
        if self.underline {
            fg = (fg & 0x08) | 0x01;
        }
        self.attr = if self.reverse {
            (fg << 4) | bg
        } else {
            (bg << 4) | fg
        };
        self.erase_char = ((self.attr as u16) << 8) | 0x20;
    }

    /// Back to the default attributes (SGR 0).
    pub fn default_attr(&mut self) {
        self.color = self.def_color;
        self.intensity = 1;
        self.underline = false;
        self.reverse = false;
    }
}

pub struct TtyTable {
    pub ttys: [Mutex<Tty>; NR_TTYS],
    pub current: core::sync::atomic::AtomicUsize,
}

impl TtyTable {
    pub fn new() -> Self {
        Self {
            ttys: array![i => Mutex::new(if i < NR_CONSOLES {
                Tty::new_console(i)
            } else if i < NR_CONSOLES + NR_PTYS {
                Tty::bare(i, TtyKind::PtySlave(i - NR_CONSOLES))
            } else {
                Tty::bare(i, TtyKind::PtyMaster(i - NR_CONSOLES - NR_PTYS))
            }); NR_TTYS],
            current: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn current_tty(&self) -> usize {
        self.current.load(core::sync::atomic::Ordering::SeqCst)
    }
}

/// What the discipline asks the caller to do once the lock is gone.
struct CookEffects {
    echo: arrayvec::ArrayVec<u8, 64>,
    signal: Option<(Pid, u32)>,
    committed: bool,
}

impl Kernel {
    pub fn current_console(&self) -> usize {
        self.ttys.current_tty()
    }

    /// Device input: raw bytes into the slot's read queue, then cook.
    pub fn tty_input(&self, idx: usize, data: &[u8]) {
        {
            let mut tty = self.ttys.ttys[idx].lock();
            for c in data {
                if !tty.read_q.putc(*c) {
                    break;
                }
            }
        }
        self.tty_cook(idx);
    }

    /// Keyboard input lands on the active console.
    pub fn console_input(&self, data: &[u8]) {
        self.tty_input(self.current_console(), data);
    }

    /// Line discipline: drain the raw queue into the cooked buffer,
    /// applying translation, editing, echo and signal generation.
    pub fn tty_cook(&self, idx: usize) {
        loop {
            let effects = {
                let mut tty = self.ttys.ttys[idx].lock();
                let mut fx = CookEffects {
                    echo: arrayvec::ArrayVec::new(),
                    signal: None,
                    committed: false,
                };
                let mut budget = fx.echo.capacity();
                while budget > 0 {
                    let c = match tty.read_q.getc() {
                        Some(c) => c,
                        None => break,
                    };
                    budget -= 1;
                    cook_one(&mut tty, c, &mut fx);
                }
                if tty.read_q.is_empty() && fx.echo.is_empty() && fx.signal.is_none() {
                    if fx.committed {
                        drop(tty);
                        self.task_wakeup_all(Chan::TtyRead(idx));
                    }
                    return;
                }
                fx
            };

            if !effects.echo.is_empty() {
                let _ = self.driver_write(idx, &effects.echo);
            }
            if let Some((pgrp, sig)) = effects.signal {
                if pgrp > 0 {
                    let _ = self.task_signal_group(pgrp, sig);
                }
            }
            if effects.committed {
                self.task_wakeup_all(Chan::TtyRead(idx));
            }
        }
    }

    /// read(2) from a tty: drain committed bytes, sleeping until a line
    /// (or any byte in raw mode) arrives.
    pub fn tty_read(&self, idx: usize, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        let mut count = 0usize;
        loop {
            let (got, eof, icanon) = {
                let mut tty = self.ttys.ttys[idx].lock();
                let icanon = tty.termios.lflag.contains(LocalFlags::ICANON);
                let veof = tty.termios.cc[VEOF];
                let mut eof = false;
                let mut progressed = false;
                while count < buf.len() {
                    let c = match tty.cooked.getc() {
                        Some(c) => c,
                        None => break,
                    };
                    if icanon && c == veof && veof != 0 {
                        if count > 0 {
                            // Keep the EOF mark for the next read.
                            tty.cooked.ungetc();
                        }
                        eof = true;
                        break;
                    }
                    buf[count] = c;
                    count += 1;
                    progressed = true;
                    if icanon && c == b'\n' {
                        eof = true;
                        break;
                    }
                }
                (progressed, eof, icanon)
            };

            if eof || count == buf.len() {
                return Ok(count);
            }
            if got && !icanon {
                // Raw mode returns whatever arrived.
                return Ok(count);
            }
            if nonblock {
                return if count > 0 {
                    Ok(count)
                } else {
                    Err(KernelError::WouldBlock)
                };
            }
            if self.procs.with_current(|t| t.signal_pending()) {
                return if count > 0 {
                    Ok(count)
                } else {
                    Err(KernelError::Interrupted)
                };
            }
            self.task_sleep(Chan::TtyRead(idx));
        }
    }

    /// write(2) to a tty: feed the write queue and run the driver until
    /// everything is out.
    pub fn tty_write(&self, idx: usize, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let pushed = {
                let mut tty = self.ttys.ttys[idx].lock();
                tty.write_q.write(&data[written..])
            };
            written += pushed;
            self.driver_write_queued(idx)?;
            if pushed == 0 {
                // Queue full and the driver could not drain (pty peer
                // congested); give the reader a chance.
                if self.procs.with_current(|t| t.signal_pending()) {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(KernelError::Interrupted)
                    };
                }
                self.task_sleep(Chan::TtyWrite(idx));
            }
        }
        self.task_wakeup_all(Chan::TtyWrite(idx));
        Ok(written)
    }

    /// Push bytes through the slot's driver directly (echo path).
    fn driver_write(&self, idx: usize, data: &[u8]) -> Result<usize> {
        {
            let mut tty = self.ttys.ttys[idx].lock();
            tty.write_q.write(data);
        }
        self.driver_write_queued(idx)?;
        Ok(data.len())
    }

    /// Drain the write queue through the driver for this slot kind.
    fn driver_write_queued(&self, idx: usize) -> Result<()> {
        let kind = {
            let tty = self.ttys.ttys[idx].lock();
            tty.kind
        };
        match kind {
            TtyKind::Console => {
                self.console_write(idx);
                Ok(())
            }
            TtyKind::PtySlave(_) | TtyKind::PtyMaster(_) => self.pty_write(idx),
        }
    }

    /// Output post-processing for cooked terminals: LF becomes CRLF.
    pub fn tty_opost(&self, idx: usize, data: &[u8]) -> Result<usize> {
        let opost = {
            let tty = self.ttys.ttys[idx].lock();
            tty.termios.oflag.contains(OutputFlags::OPOST)
                && tty.termios.oflag.contains(OutputFlags::ONLCR)
        };
        if !opost {
            return self.tty_write(idx, data);
        }
        let mut done = 0;
        for c in data {
            if *c == b'\n' {
                self.tty_write(idx, b"\r\n")?;
            } else {
                self.tty_write(idx, core::slice::from_ref(c))?;
            }
            done += 1;
        }
        Ok(done)
    }
}

/// One byte through the discipline. Called with the tty locked; side
/// effects that need other locks are queued on `fx`.
fn cook_one(tty: &mut Tty, mut c: u8, fx: &mut CookEffects) {
    let termios = tty.termios;

    // Input translation.
    if c == b'\r' {
        if termios.iflag.contains(InputFlags::IGNCR) {
            return;
        }
        if termios.iflag.contains(InputFlags::ICRNL) {
            c = b'\n';
        }
    } else if c == b'\n' && termios.iflag.contains(InputFlags::INLCR) {
        c = b'\r';
    }

    // Signal characters.
    if termios.lflag.contains(LocalFlags::ISIG) {
        let sig = if c == termios.cc[VINTR] && c != 0 {
            Some(SIGINT)
        } else if c == termios.cc[VQUIT] && c != 0 {
            Some(SIGQUIT)
        } else if c == termios.cc[VSUSP] && c != 0 {
            Some(SIGTSTP)
        } else {
            None
        };
        if let Some(sig) = sig {
            fx.signal = Some((tty.pgrp, sig));
            return;
        }
    }

    if termios.lflag.contains(LocalFlags::ICANON) {
        if c == termios.cc[VERASE] && c != 0 {
            if tty.cooked.erase().is_some() && termios.lflag.contains(LocalFlags::ECHOE) {
                let _ = fx.echo.try_extend_from_slice(&[8, b' ', 8]);
            }
            return;
        }
        if c == termios.cc[VKILL] && c != 0 {
            while let Some(erased) = tty.cooked.erase() {
                if erased == b'\n' {
                    tty.cooked.push(b'\n');
                    break;
                }
                if termios.lflag.contains(LocalFlags::ECHOK) {
                    let _ = fx.echo.try_extend_from_slice(&[8, b' ', 8]);
                }
            }
            return;
        }
        if c == termios.cc[VEOF] && c != 0 {
            tty.cooked.push(c);
            tty.cooked.commit();
            fx.committed = true;
            return;
        }
        if !tty.cooked.push(c) {
            return;
        }
        if termios.lflag.contains(LocalFlags::ECHO) {
            let _ = fx.echo.try_push(c);
        }
        if c == b'\n' {
            tty.cooked.commit();
            fx.committed = true;
        }
        return;
    }

    // Raw mode: commit every byte.
    if tty.cooked.push(c) {
        tty.cooked.commit();
        fx.committed = true;
        if termios.lflag.contains(LocalFlags::ECHO) {
            let _ = fx.echo.try_push(c);
        }
    }
}
