//! Virtual console driver.
//!
//! Drains a console tty's write queue through the ESC/CSI state
//! machine and renders cells into the framebuffer. Also owns console
//! activation: switching is immediate for VT_AUTO consoles and a
//! release/acquire signal handshake for VT_PROCESS ones.

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    kprintln,
    param::{NPARS, NR_CONSOLES},
    proc::{Chan, TaskState},
    tty::{CsiState, Tty, VtMode, KD_TEXT, VC_XLATE, VT_AUTO, VT_PROCESS},
};

/// ANSI color index to EGA palette entry.
static ANSI_COLOR_TABLE: [u8; 16] = [0, 4, 2, 6, 1, 5, 3, 7, 8, 12, 10, 14, 9, 13, 11, 15];

/// VT_RELDISP acknowledge-acquire argument.
pub const VT_ACKACQ: u32 = 2;

/// Scroll a region up: rows [top+n, bottom) move to top, the freed
/// band is cleared to the erase character.
pub fn console_scrup(tty: &mut Tty, top: u32, bottom: u32, mut nr: u32) {
    let erase = tty.erase_char;
    let fb = match tty.fb.as_mut() {
        Some(fb) => fb,
        None => return,
    };
    if top + nr >= bottom {
        nr = bottom - top - 1;
    }
    if bottom > fb.height || top >= bottom || nr < 1 {
        return;
    }
    let width = fb.width as usize;
    let dst = top as usize * width;
    let src = (top + nr) as usize * width;
    let count = (bottom - top - nr) as usize * width;
    fb.buf.copy_within(src..src + count, dst);
    fb.buf[dst + count..dst + count + nr as usize * width].fill(erase);
}

/// Scroll a region down: rows [top, bottom-n) move down, the top band
/// is cleared.
pub fn console_scrdown(tty: &mut Tty, top: u32, bottom: u32, mut nr: u32) {
    let erase = tty.erase_char;
    let fb = match tty.fb.as_mut() {
        Some(fb) => fb,
        None => return,
    };
    if top + nr >= bottom {
        nr = bottom - top - 1;
    }
    if bottom > fb.height || top >= bottom || nr < 1 {
        return;
    }
    let width = fb.width as usize;
    let src = top as usize * width;
    let dst = (top + nr) as usize * width;
    let count = (bottom - top - nr) as usize * width;
    fb.buf.copy_within(src..src + count, dst);
    fb.buf[src..src + nr as usize * width].fill(erase);
}

/// Delete characters at the cursor (CSI P).
fn csi_p(tty: &mut Tty, mut nr: u32) {
    let erase = tty.erase_char;
    let fb = match tty.fb.as_mut() {
        Some(fb) => fb,
        None => return,
    };
    if nr > fb.width - fb.x {
        nr = fb.width - fb.x;
    } else if nr == 0 {
        nr = 1;
    }
    let width = fb.width as usize;
    let start = fb.y as usize * width + fb.x as usize;
    let end = fb.y as usize * width + width;
    fb.buf.copy_within(start + nr as usize..end, start);
    fb.buf[end - nr as usize..end].fill(erase);
}

/// Erase within the current line (CSI K).
fn csi_k(tty: &mut Tty, vpar: u32) {
    let erase = tty.erase_char;
    let fb = match tty.fb.as_mut() {
        Some(fb) => fb,
        None => return,
    };
    let width = fb.width as usize;
    let line = fb.y as usize * width;
    let x = fb.x as usize;
    let (start, count) = match vpar {
        0 => (line + x, width - x),
        1 => (line, x + 1),
        2 => (line, width),
        _ => return,
    };
    fb.buf[start..start + count].fill(erase);
}

/// Erase within the display (CSI J).
fn csi_j(tty: &mut Tty, vpar: u32) {
    let erase = tty.erase_char;
    let fb = match tty.fb.as_mut() {
        Some(fb) => fb,
        None => return,
    };
    let width = fb.width as usize;
    let pos = fb.y as usize * width + fb.x as usize;
    let total = fb.buf.len();
    let (start, count) = match vpar {
        0 => (pos, total - pos),
        1 => (0, pos),
        2 => (0, total),
        _ => return,
    };
    fb.buf[start..start + count].fill(erase);
}

/// Select graphic rendition (CSI m).
fn csi_m(tty: &mut Tty) {
    for i in 0..=tty.npars {
        match tty.pars[i] {
            0 => tty.default_attr(),
            1 => tty.intensity = 2,
            4 => tty.underline = true,
            7 => tty.reverse = true,
            24 => tty.underline = false,
            27 => tty.reverse = false,
            39 => tty.color = (tty.color & 0xf0) | (tty.def_color & 0x0f),
            49 => tty.color = (tty.def_color & 0xf0) | (tty.color & 0x0f),
            p if (30..=37).contains(&p) => {
                tty.color = (tty.color & 0xf0) | ANSI_COLOR_TABLE[(p - 30) as usize]
            }
            p if (40..=47).contains(&p) => {
                tty.color =
                    (ANSI_COLOR_TABLE[(p - 40) as usize] << 4) | (tty.color & 0x0f)
            }
            p => kprintln!("console : unknown escape sequence m : {}", p),
        }
    }
    tty.update_attr();
}

/// Insert blank lines by scrolling down from the cursor row (CSI L).
fn csi_l(tty: &mut Tty, mut nr: u32) {
    let (y, height) = match tty.fb.as_ref() {
        Some(fb) => (fb.y, fb.height),
        None => return,
    };
    if nr > height - y {
        nr = height - y;
    } else if nr == 0 {
        nr = 1;
    }
    console_scrdown(tty, y, height, nr);
}

/// DEC private modes (CSI h / CSI l); only cursor visibility is known.
fn console_set_mode(tty: &mut Tty, on_off: bool) {
    for i in 0..=tty.npars {
        match tty.pars[i] {
            25 => tty.deccm = on_off,
            p => kprintln!("console : unknown mode : {}", p),
        }
    }
}

/// Reverse index: cursor up, scrolling the region when at the top.
fn console_ri(tty: &mut Tty) {
    let (y, height) = match tty.fb.as_ref() {
        Some(fb) => (fb.y, fb.height),
        None => return,
    };
    if y == 0 {
        console_scrdown(tty, 0, height, 1);
    } else {
        let fb = tty.fb.as_mut().expect("console_ri: no framebuffer");
        fb.y -= 1;
    }
}

/// Emit one glyph or control effect.
fn console_putc(tty: &mut Tty, c: u8) {
    let attr = tty.attr;
    let height = {
        let fb = match tty.fb.as_mut() {
            Some(fb) => fb,
            None => return,
        };
        match c {
            7 => {}
            8 => {
                if fb.x > 0 {
                    fb.x -= 1;
                }
            }
            9 => fb.x = (fb.x + 8) & !7,
            10 | 11 | 12 => {
                fb.y += 1;
                fb.x = 0;
            }
            13 => fb.x = 0,
            14 | 15 => {}
            _ => {
                let pos = (fb.y * fb.width + fb.x) as usize;
                fb.buf[pos] = ((attr as u16) << 8) | c as u16;
                fb.x += 1;
            }
        }
        if fb.x >= fb.width {
            fb.x = 0;
            fb.y += 1;
        }
        fb.height
    };

    let needs_scroll = tty.fb.as_ref().map_or(false, |fb| fb.y >= height);
    if needs_scroll {
        console_scrup(tty, 0, height, 1);
        if let Some(fb) = tty.fb.as_mut() {
            fb.y = height - 1;
        }
    }
}

impl Kernel {
    /// Drain the write queue through the escape-sequence machine.
    pub fn console_write(&self, idx: usize) {
        let mut tty = self.ttys.ttys[idx].lock();

        while let Some(c) = tty.write_q.getc() {
            match tty.state {
                CsiState::Normal => match c {
                    0x1b => tty.state = CsiState::Escape,
                    _ => console_putc(&mut tty, c),
                },
                CsiState::Escape => {
                    tty.state = CsiState::Normal;
                    match c {
                        b'[' => tty.state = CsiState::Square,
                        b'M' => console_ri(&mut tty),
                        _ => kprintln!("console : unknown escape sequence {}", c as char),
                    }
                }
                CsiState::Square | CsiState::GetPars | CsiState::GotPars => {
                    self.console_csi_byte(&mut tty, c)
                }
            }
        }

        // Cursor follows the pen.
        let video = &*self.video;
        if let Some(fb) = tty.fb.as_mut() {
            fb.sync_cursor(video);
        }
        if let Some(fb) = tty.fb.as_ref() {
            fb.flush_all(video);
        }
    }

    fn console_csi_byte(&self, tty: &mut Tty, c: u8) {
        if tty.state == CsiState::Square {
            // Reset the parameter array.
            tty.pars = [0; NPARS];
            tty.npars = 0;
            tty.state = CsiState::GetPars;
            tty.priv_mode = false;
            if c == b'?' {
                tty.priv_mode = true;
                return;
            }
        }

        if tty.state == CsiState::GetPars {
            if c == b';' && tty.npars < NPARS - 1 {
                tty.npars += 1;
                return;
            }
            if c.is_ascii_digit() {
                tty.pars[tty.npars] = tty.pars[tty.npars] * 10 + (c - b'0') as u32;
                return;
            }
            tty.state = CsiState::GotPars;
        }

        if tty.state == CsiState::GotPars {
            tty.state = CsiState::Normal;
            match c {
                b'G' => {
                    if tty.pars[0] > 0 {
                        tty.pars[0] -= 1;
                    }
                    let x = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let y = fb.y as i64;
                        fb.set_xy(x, y);
                    }
                }
                b'A' => {
                    if tty.pars[0] == 0 {
                        tty.pars[0] = 1;
                    }
                    let d = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let (x, y) = (fb.x as i64, fb.y as i64);
                        fb.set_xy(x, y - d);
                    }
                }
                b'B' => {
                    if tty.pars[0] == 0 {
                        tty.pars[0] = 1;
                    }
                    let d = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let (x, y) = (fb.x as i64, fb.y as i64);
                        fb.set_xy(x, y + d);
                    }
                }
                b'C' => {
                    if tty.pars[0] == 0 {
                        tty.pars[0] = 1;
                    }
                    let d = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let (x, y) = (fb.x as i64, fb.y as i64);
                        fb.set_xy(x + d, y);
                    }
                }
                b'D' => {
                    if tty.pars[0] == 0 {
                        tty.pars[0] = 1;
                    }
                    let d = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let (x, y) = (fb.x as i64, fb.y as i64);
                        fb.set_xy(x - d, y);
                    }
                }
                b'd' => {
                    if tty.pars[0] > 0 {
                        tty.pars[0] -= 1;
                    }
                    let y = tty.pars[0] as i64;
                    if let Some(fb) = tty.fb.as_mut() {
                        let x = fb.x as i64;
                        fb.set_xy(x, y);
                    }
                }
                b'H' => {
                    if tty.pars[0] > 0 {
                        tty.pars[0] -= 1;
                    }
                    if tty.pars[1] > 0 {
                        tty.pars[1] -= 1;
                    }
                    let (row, col) = (tty.pars[0] as i64, tty.pars[1] as i64);
                    if let Some(fb) = tty.fb.as_mut() {
                        fb.set_xy(col, row);
                    }
                }
                b'r' => {
                    if tty.pars[0] == 0 {
                        tty.pars[0] = 1;
                    }
                    let height = tty.fb.as_ref().map_or(0, |fb| fb.height);
                    if tty.pars[1] == 0 {
                        tty.pars[1] = height;
                    }
                    if tty.pars[0] < tty.pars[1] && tty.pars[1] <= height {
                        if let Some(fb) = tty.fb.as_mut() {
                            fb.set_xy(0, 0);
                        }
                    }
                }
                b'P' => csi_p(tty, tty.pars[0]),
                b'K' => csi_k(tty, tty.pars[0]),
                b'J' => csi_j(tty, tty.pars[0]),
                b'm' => csi_m(tty),
                b'L' => csi_l(tty, tty.pars[0]),
                b'h' => console_set_mode(tty, true),
                b'l' => console_set_mode(tty, false),
                b'c' => {}
                _ => kprintln!(
                    "console : unknown escape sequence {} (gotpars)",
                    c as char
                ),
            }
        }
    }

    /// Request a console switch. VT_PROCESS consoles are asked first
    /// and must answer with VT_RELDISP.
    pub fn tty_change(&self, new: usize) -> Result<()> {
        if new >= NR_CONSOLES {
            return Err(KernelError::NoDevice);
        }
        let cur = self.current_console();
        if new == cur {
            return Ok(());
        }

        let pending = {
            let mut tty = self.ttys.ttys[cur].lock();
            if tty.vt_mode.mode == VT_PROCESS && tty.vt_pid >= 0 {
                let alive = self
                    .procs
                    .with_task(tty.vt_pid, |t| t.state != TaskState::ZOMBIE)
                    .unwrap_or(false);
                if alive {
                    tty.vt_newvt = new as i32;
                    Some((tty.vt_pid, tty.vt_mode.relsig as u32))
                } else {
                    // Controlling process died; fall back to auto.
                    tty.vt_mode = VtMode::default();
                    tty.vt_pid = -1;
                    None
                }
            } else {
                None
            }
        };

        match pending {
            Some((pid, relsig)) => {
                let _ = self.task_signal(pid, relsig);
                Ok(())
            }
            None => {
                self.tty_complete_change(new);
                Ok(())
            }
        }
    }

    /// Finish a console switch: flip the active framebuffers, notify an
    /// acquiring VT_PROCESS console, wake activation waiters.
    pub fn tty_complete_change(&self, new: usize) {
        let cur = self.current_console();
        if cur == new {
            return;
        }
        {
            let mut old = self.ttys.ttys[cur].lock();
            if let Some(fb) = old.fb.as_mut() {
                fb.active = false;
            }
        }
        self.ttys
            .current
            .store(new, core::sync::atomic::Ordering::SeqCst);

        let acq = {
            let mut tty = self.ttys.ttys[new].lock();
            if let Some(fb) = tty.fb.as_mut() {
                fb.active = true;
                fb.flush_all(&*self.video);
            }
            if tty.vt_mode.mode == VT_PROCESS && tty.vt_pid >= 0 {
                Some((tty.vt_pid, tty.vt_mode.acqsig as u32))
            } else {
                None
            }
        };
        if let Some((pid, acqsig)) = acq {
            let _ = self.task_signal(pid, acqsig);
        }
        self.task_wakeup_all(Chan::VtActivate);
    }

    /// Sleep until console `n` is active or a signal arrives.
    pub fn vt_waitactive(&self, n: usize) -> Result<i32> {
        loop {
            if n == self.current_console() {
                return Ok(0);
            }
            if self.procs.with_current(|t| t.signal_pending()) {
                return Err(KernelError::Interrupted);
            }
            self.task_sleep(Chan::VtActivate);
        }
    }

    /// Reset a virtual console to its boot state.
    pub fn reset_vc(&self, idx: usize) {
        let mut tty = self.ttys.ttys[idx].lock();
        tty.mode = KD_TEXT;
        tty.kbdmode = VC_XLATE;
        tty.vt_mode = VtMode {
            mode: VT_AUTO,
            waitv: 0,
            relsig: 0,
            acqsig: 0,
            frsig: 0,
        };
        tty.vt_pid = -1;
        tty.vt_newvt = -1;
    }
}
