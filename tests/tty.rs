//! Line discipline, console rendering, VT switching and ptys.

mod common;

use std::convert::TryInto;

use common::{boot, spawn_task, UBUF};
use rux_kernel::{
    error::KernelError,
    file::OpenFlags,
    fs::{path::AT_FDCWD, Mode},
    proc::{
        signal::{SIGCONT, SIGHUP, SIGINT, SIGUSR1, SIGUSR2},
        TaskState,
    },
    syscall::ioctl::{TIOCGPTN, VT_ACTIVATE, VT_RELDISP, VT_SETMODE, VT_WAITACTIVE},
    tty::{console::VT_ACKACQ, CsiState, LocalFlags, VT_PROCESS},
    param::SCREEN_WIDTH,
};

fn sigbit(sig: u32) -> u32 {
    1 << (sig - 1)
}

/// The character cell at (x, y) of console `idx`.
fn cell(k: &rux_kernel::kernel::Kernel, idx: usize, x: u32, y: u32) -> u16 {
    let tty = k.ttys.ttys[idx].lock();
    tty.fb.as_ref().unwrap().cell(x, y)
}

fn cursor(k: &rux_kernel::kernel::Kernel, idx: usize) -> (u32, u32) {
    let tty = k.ttys.ttys[idx].lock();
    let fb = tty.fb.as_ref().unwrap();
    (fb.x, fb.y)
}

#[test]
fn plain_text_lands_in_cells() {
    let k = boot();
    k.tty_write(0, b"AB").unwrap();
    assert_eq!(cell(&k, 0, 0, 0) & 0xff, b'A' as u16);
    assert_eq!(cell(&k, 0, 1, 0) & 0xff, b'B' as u16);
    assert_eq!(cursor(&k, 0), (2, 0));
}

#[test]
fn sgr_colors_the_cells() {
    let k = boot();
    // Red X, default Y: ansi red is EGA index 4.
    k.tty_write(0, b"\x1b[31mX\x1b[0mY").unwrap();
    let x = cell(&k, 0, 0, 0);
    let y = cell(&k, 0, 1, 0);
    assert_eq!(x & 0xff, b'X' as u16);
    assert_eq!((x >> 8) & 0x0f, 4);
    assert_eq!(y & 0xff, b'Y' as u16);
    assert_eq!((y >> 8) & 0x0f, 7);
}

#[test]
fn cursor_addressing_is_one_based_and_clamped() {
    let k = boot();
    k.tty_write(0, b"\x1b[10;20H").unwrap();
    assert_eq!(cursor(&k, 0), (19, 9));
    // Zero parameters normalise to one.
    k.tty_write(0, b"\x1b[0;0H").unwrap();
    assert_eq!(cursor(&k, 0), (0, 0));
    // Out-of-range addresses clamp to the screen.
    k.tty_write(0, b"\x1b[999;999H").unwrap();
    assert_eq!(cursor(&k, 0), (SCREEN_WIDTH as u32 - 1, 24));
}

#[test]
fn relative_cursor_moves_default_to_one() {
    let k = boot();
    k.tty_write(0, b"\x1b[5;5H\x1b[A\x1b[2C\x1b[B\x1b[D").unwrap();
    // (4,4) -> up (4,3) -> right twice (6,3) -> down (6,4) -> left (5,4)
    assert_eq!(cursor(&k, 0), (5, 4));
}

#[test]
fn erase_line_variants() {
    let k = boot();
    k.tty_write(0, b"abcdef").unwrap();
    // Cursor to column 3 (1-based), erase to end of line.
    k.tty_write(0, b"\x1b[1;3H\x1b[0K").unwrap();
    assert_eq!(cell(&k, 0, 0, 0) & 0xff, b'a' as u16);
    assert_eq!(cell(&k, 0, 1, 0) & 0xff, b'b' as u16);
    for x in 2..6 {
        assert_eq!(cell(&k, 0, x, 0) & 0xff, b' ' as u16);
    }

    // `[0K` at column 0 erases the whole line visually.
    k.tty_write(0, b"xyz\x1b[1;1H").unwrap();
    k.tty_write(0, b"\x1b[0K").unwrap();
    for x in 0..SCREEN_WIDTH as u32 {
        assert_eq!(cell(&k, 0, x, 0) & 0xff, b' ' as u16);
    }
}

#[test]
fn erase_screen_zeroes_everything() {
    let k = boot();
    k.tty_write(0, b"some text\r\nmore text").unwrap();
    k.tty_write(0, b"\x1b[2J").unwrap();
    for y in 0..2 {
        for x in 0..SCREEN_WIDTH as u32 {
            assert_eq!(cell(&k, 0, x, y) & 0xff, b' ' as u16);
        }
    }
}

#[test]
fn newline_at_the_bottom_scrolls_up() {
    let k = boot();
    k.tty_write(0, b"top line\r\n").unwrap();
    // Park at the last row, then force one scroll.
    k.tty_write(0, b"\x1b[25;1Hbottom\n").unwrap();
    // The first row now holds what was on the second (blank), and
    // "bottom" moved up one row.
    assert_eq!(cell(&k, 0, 0, 23) & 0xff, b'b' as u16);
    assert_eq!(cell(&k, 0, 0, 24) & 0xff, b' ' as u16);
    assert_eq!(cell(&k, 0, 0, 0) & 0xff, b' ' as u16);
}

#[test]
fn unknown_finals_return_to_normal() {
    let k = boot();
    // An unrecognised final byte must leave the parser in Normal so
    // following text renders.
    k.tty_write(0, b"\x1b[9zQ").unwrap();
    assert_eq!(k.ttys.ttys[0].lock().state, CsiState::Normal);
    assert_eq!(cell(&k, 0, 0, 0) & 0xff, b'Q' as u16);
}

#[test]
fn reverse_index_scrolls_down_at_the_top() {
    let k = boot();
    k.tty_write(0, b"first").unwrap();
    k.tty_write(0, b"\x1b[1;1H\x1bM").unwrap();
    // Row 0 moved to row 1.
    assert_eq!(cell(&k, 0, 0, 1) & 0xff, b'f' as u16);
    assert_eq!(cell(&k, 0, 0, 0) & 0xff, b' ' as u16);
}

#[test]
fn cooked_input_line_editing_and_read() {
    let k = boot();
    // Type with a typo, erase it, finish the line.
    k.tty_input(0, b"helo");
    k.tty_input(0, &[127]); // VERASE
    k.tty_input(0, b"lo\n");

    let mut buf = [0u8; 16];
    let n = k.tty_read(0, &mut buf, false).unwrap();
    assert_eq!(&buf[..n], b"hello\n");
}

#[test]
fn kill_char_discards_the_edited_line() {
    let k = boot();
    k.tty_input(0, b"garbage");
    k.tty_input(0, &[21]); // VKILL (^U)
    k.tty_input(0, b"ok\n");
    let mut buf = [0u8; 16];
    let n = k.tty_read(0, &mut buf, false).unwrap();
    assert_eq!(&buf[..n], b"ok\n");
}

#[test]
fn reader_blocks_until_a_full_line_in_canonical_mode() {
    let k = boot();
    k.tty_input(0, b"partial");
    let mut buf = [0u8; 16];
    // Nothing committed yet.
    assert_eq!(k.tty_read(0, &mut buf, true), Err(KernelError::WouldBlock));
    k.tty_input(0, b"\n");
    let n = k.tty_read(0, &mut buf, true).unwrap();
    assert_eq!(&buf[..n], b"partial\n");
}

#[test]
fn eof_terminates_a_read_without_data() {
    let k = boot();
    k.tty_input(0, &[4]); // VEOF (^D)
    let mut buf = [0u8; 16];
    assert_eq!(k.tty_read(0, &mut buf, false).unwrap(), 0);
}

#[test]
fn eof_after_data_returns_the_data_first() {
    let k = boot();
    k.tty_input(0, b"ab");
    k.tty_input(0, &[4]);
    let mut buf = [0u8; 16];
    assert_eq!(k.tty_read(0, &mut buf, false).unwrap(), 2);
    assert_eq!(&buf[..2], b"ab");
    // The saved EOF satisfies the next read as an empty result.
    assert_eq!(k.tty_read(0, &mut buf, false).unwrap(), 0);
}

#[test]
fn interrupt_char_signals_the_foreground_group() {
    let k = boot();
    let shell = spawn_task(&k, b"sh");
    k.procs.with_task(shell, |t| t.pgid = 7).unwrap();
    k.ttys.ttys[0].lock().pgrp = 7;

    k.tty_input(0, &[3]); // ^C
    assert!(k.procs.with_task(shell, |t| t.sigpend).unwrap() & sigbit(SIGINT) != 0);
    // The interrupt character never reaches the read queue.
    let mut buf = [0u8; 4];
    assert_eq!(k.tty_read(0, &mut buf, true), Err(KernelError::WouldBlock));
}

#[test]
fn raw_mode_passes_bytes_straight_through() {
    let k = boot();
    {
        let mut tty = k.ttys.ttys[0].lock();
        tty.termios.lflag.remove(LocalFlags::ICANON | LocalFlags::ECHO);
    }
    k.tty_input(0, b"\x01\x02");
    let mut buf = [0u8; 4];
    let n = k.tty_read(0, &mut buf, false).unwrap();
    assert_eq!(&buf[..n], b"\x01\x02");
}

#[test]
fn crnl_translation_in_cooked_mode() {
    let k = boot();
    k.tty_input(0, b"line\r");
    let mut buf = [0u8; 8];
    let n = k.tty_read(0, &mut buf, false).unwrap();
    assert_eq!(&buf[..n], b"line\n");
}

#[test]
fn vt_activate_switches_auto_consoles_immediately() {
    let k = boot();
    assert_eq!(k.current_console(), 0);
    k.tty_change(1).unwrap();
    assert_eq!(k.current_console(), 1);
    assert!(k.ttys.ttys[1].lock().fb.as_ref().unwrap().active);
    assert!(!k.ttys.ttys[0].lock().fb.as_ref().unwrap().active);
    // Out of range consoles are refused.
    assert_eq!(k.tty_change(99), Err(KernelError::NoDevice));
}

#[test]
fn vt_process_handshake_defers_the_switch() {
    let k = boot();
    let owner = k.procs.current();

    // The owner puts console 0 under VT_PROCESS with USR1/USR2.
    k.tty_change(0).unwrap();
    {
        let mut tty = k.ttys.ttys[0].lock();
        tty.vt_mode.mode = VT_PROCESS;
        tty.vt_mode.acqsig = SIGUSR1 as u16;
        tty.vt_mode.relsig = SIGUSR2 as u16;
        tty.vt_pid = owner;
        tty.vt_newvt = -1;
    }

    // Requesting console 1 pends and signals the owner.
    k.tty_change(1).unwrap();
    assert_eq!(k.current_console(), 0);
    assert!(k.procs.with_task(owner, |t| t.sigpend).unwrap() & sigbit(SIGUSR2) != 0);
    assert_eq!(k.ttys.ttys[0].lock().vt_newvt, 1);

    // The owner acknowledges via VT_RELDISP(1): switch completes.
    let fd = open_own_tty(&k);
    k.procs.with_current(|t| t.tty = Some(0));
    k.sys_ioctl(fd, VT_RELDISP, 1).unwrap();
    assert_eq!(k.current_console(), 1);
    k.do_close(fd).unwrap();
}

#[test]
fn vt_reldisp_zero_refuses_the_switch() {
    let k = boot();
    let owner = k.procs.current();
    {
        let mut tty = k.ttys.ttys[0].lock();
        tty.vt_mode.mode = VT_PROCESS;
        tty.vt_mode.relsig = SIGUSR2 as u16;
        tty.vt_pid = owner;
        tty.vt_newvt = -1;
    }
    k.tty_change(1).unwrap();
    assert_eq!(k.ttys.ttys[0].lock().vt_newvt, 1);

    let fd = open_own_tty(&k);
    k.procs.with_current(|t| t.tty = Some(0));
    k.sys_ioctl(fd, VT_RELDISP, 0).unwrap();
    assert_eq!(k.current_console(), 0);
    assert_eq!(k.ttys.ttys[0].lock().vt_newvt, -1);

    // A stray acknowledge without a pending switch needs VT_ACKACQ.
    assert_eq!(
        k.sys_ioctl(fd, VT_RELDISP, 5),
        Err(KernelError::InvalidArg)
    );
    k.sys_ioctl(fd, VT_RELDISP, VT_ACKACQ).unwrap();
    k.do_close(fd).unwrap();
}

#[test]
fn vt_waitactive_returns_once_active() {
    let k = boot();
    let fd = open_own_tty(&k);
    k.procs.with_current(|t| t.tty = Some(0));
    // Console 1 (arg is 1-based: 1 names console 0).
    assert_eq!(k.sys_ioctl(fd, VT_WAITACTIVE, 1).unwrap(), 0);
    k.do_close(fd).unwrap();
}

#[test]
fn vt_setmode_and_activate_via_ioctl() {
    let k = boot();
    let owner = k.procs.current();
    let fd = open_own_tty(&k);
    k.procs.with_current(|t| t.tty = Some(1));

    // vt_mode { mode = VT_PROCESS, waitv = 0, relsig, acqsig, frsig }
    let mut raw = [0u8; 8];
    raw[0] = VT_PROCESS;
    raw[2..4].copy_from_slice(&(SIGUSR2 as u16).to_le_bytes());
    raw[4..6].copy_from_slice(&(SIGUSR1 as u16).to_le_bytes());
    k.procs.with_current(|t| t.mm.copy_out(UBUF, &raw).unwrap());

    k.tty_change(1).unwrap();
    k.sys_ioctl(fd, VT_SETMODE, UBUF).unwrap();
    assert_eq!(k.ttys.ttys[1].lock().vt_pid, owner);

    // Switching away from the VT_PROCESS console pends and delivers
    // the release signal to the owner.
    k.sys_ioctl(fd, VT_ACTIVATE, 1).unwrap();
    assert_eq!(k.current_console(), 1);
    assert!(k.procs.with_task(owner, |t| t.sigpend).unwrap() & sigbit(SIGUSR2) != 0);
    assert_eq!(k.ttys.ttys[1].lock().vt_newvt, 0);
    k.do_close(fd).unwrap();
}

#[test]
fn pty_master_to_slave_line() {
    let k = boot();
    let mfd = k
        .do_open(
            AT_FDCWD,
            b"/dev/ptmx",
            OpenFlags::from_bits_truncate(0o2),
            Mode(0),
        )
        .unwrap();

    // Learn the pty number through TIOCGPTN.
    k.sys_ioctl(mfd, TIOCGPTN, UBUF).unwrap();
    let n = u32::from_le_bytes(common::read_user(&k, UBUF, 4).try_into().unwrap());
    assert_eq!(n, 0);

    let sfd = k
        .do_open(
            AT_FDCWD,
            b"/dev/pts/0",
            OpenFlags::from_bits_truncate(0o2),
            Mode(0),
        )
        .unwrap();

    // Master writes a line; the slave's cooked queue serves it.
    let mfid = k.fd_to_file(mfd).unwrap();
    assert_eq!(k.file_write(mfid, b"abc\n").unwrap(), 4);
    let sfid = k.fd_to_file(sfd).unwrap();
    let mut buf = [0u8; 16];
    let got = k.file_read(sfid, &mut buf).unwrap();
    assert_eq!(&buf[..got], b"abc\n");

    // The slave's echo came back to the master reader.
    let mut echo = [0u8; 16];
    let got = k.file_read(mfid, &mut echo).unwrap();
    assert!(got >= 4, "echo missing: {:?}", &echo[..got]);

    k.do_close(sfd).unwrap();
    k.do_close(mfd).unwrap();
}

#[test]
fn slave_writes_reach_the_master() {
    let k = boot();
    let mfd = k
        .do_open(
            AT_FDCWD,
            b"/dev/ptmx",
            OpenFlags::from_bits_truncate(0o2),
            Mode(0),
        )
        .unwrap();
    let sfd = k
        .do_open(
            AT_FDCWD,
            b"/dev/pts/0",
            OpenFlags::from_bits_truncate(0o2),
            Mode(0),
        )
        .unwrap();

    let sfid = k.fd_to_file(sfd).unwrap();
    k.file_write(sfid, b"output").unwrap();

    let mfid = k.fd_to_file(mfd).unwrap();
    let mut buf = [0u8; 16];
    let n = k.file_read(mfid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"output");

    k.do_close(sfd).unwrap();
    k.do_close(mfd).unwrap();
}

#[test]
fn closing_the_master_hangs_up_the_slave_users() {
    let k = boot();
    let mfd = k
        .do_open(
            AT_FDCWD,
            b"/dev/ptmx",
            OpenFlags::from_bits_truncate(0o2),
            Mode(0),
        )
        .unwrap();

    let user = spawn_task(&k, b"ptyuser");
    let slave_idx = rux_kernel::tty::pty::slave_index(0);
    k.procs.with_task(user, |t| t.tty = Some(slave_idx)).unwrap();

    k.do_close(mfd).unwrap();

    let pend = k.procs.with_task(user, |t| t.sigpend).unwrap();
    assert!(pend & sigbit(SIGHUP) != 0);
    assert!(pend & sigbit(SIGCONT) != 0);
    // The pts node is gone.
    assert_eq!(
        k.namei(AT_FDCWD, b"/dev/pts/0", true),
        Err(KernelError::NoEntry)
    );
}

#[test]
fn pty_pairs_are_reusable_after_close() {
    let k = boot();
    for _ in 0..3 {
        let mfd = k
            .do_open(
                AT_FDCWD,
                b"/dev/ptmx",
                OpenFlags::from_bits_truncate(0o2),
                Mode(0),
            )
            .unwrap();
        k.sys_ioctl(mfd, TIOCGPTN, UBUF).unwrap();
        let n = u32::from_le_bytes(common::read_user(&k, UBUF, 4).try_into().unwrap());
        assert_eq!(n, 0);
        k.do_close(mfd).unwrap();
    }
}

/// Open the task's controlling console through /dev/tty0.
fn open_own_tty(k: &rux_kernel::kernel::Kernel) -> i32 {
    k.do_open(
        AT_FDCWD,
        b"/dev/tty0",
        OpenFlags::from_bits_truncate(0o2),
        Mode(0),
    )
    .unwrap()
}

#[test]
fn stopped_vt_process_owner_falls_back_to_auto() {
    let k = boot();
    let owner = spawn_task(&k, b"owner");
    {
        let mut tty = k.ttys.ttys[0].lock();
        tty.vt_mode.mode = VT_PROCESS;
        tty.vt_pid = owner;
    }
    k.procs
        .with_task(owner, |t| t.state = TaskState::ZOMBIE)
        .unwrap();
    // With a dead owner the switch happens immediately.
    k.tty_change(1).unwrap();
    assert_eq!(k.current_console(), 1);
}
