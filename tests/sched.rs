//! Scheduler, signals, fork/exit/wait and pipes.

mod common;

use common::{boot, make_current, put_user_str, spawn_task, UBUF};
use rux_kernel::{
    error::KernelError,
    file::OpenFlags,
    fs::{path::AT_FDCWD, Mode},
    proc::{
        sched::SleepOutcome,
        signal::{
            SigAction, SigFlags, SigHandler, SIGALRM, SIGCHLD, SIGCONT, SIGINT, SIGKILL,
            SIGPIPE, SIGSTOP, SIGUSR1, SIGUSR2, SIG_BLOCK,
        },
        task::WNOHANG,
        Chan, TaskState, UserRegs,
    },
};

fn sigbit(sig: u32) -> u32 {
    1 << (sig - 1)
}

#[test]
fn round_robin_picks_the_next_running_task() {
    let k = boot();
    let a = k.procs.current();
    let b = spawn_task(&k, b"b");
    let c = spawn_task(&k, b"c");

    assert_eq!(k.pick_next(), b);
    make_current(&k, b);
    assert_eq!(k.pick_next(), c);
    make_current(&k, c);
    // Wraps around, skipping the idle task.
    assert_eq!(k.pick_next(), a);
}

#[test]
fn sleeping_tasks_are_skipped_and_idle_is_the_fallback() {
    let k = boot();
    let a = k.procs.current();
    let b = spawn_task(&k, b"b");

    k.procs
        .with_task(b, |t| t.state = TaskState::SLEEPING)
        .unwrap();
    assert_eq!(k.pick_next(), a);

    k.procs
        .with_task(a, |t| t.state = TaskState::SLEEPING)
        .unwrap();
    assert_eq!(k.pick_next(), 0);
}

#[test]
fn wakeup_readies_the_first_sleeper_in_order() {
    let k = boot();
    let b = spawn_task(&k, b"b");
    let c = spawn_task(&k, b"c");
    for pid in [b, c] {
        k.procs
            .with_task(pid, |t| {
                t.state = TaskState::SLEEPING;
                t.chan = Some(Chan::VtActivate);
            })
            .unwrap();
    }

    k.task_wakeup(Chan::VtActivate);
    assert_eq!(
        k.procs.with_task(b, |t| t.state).unwrap(),
        TaskState::RUNNING
    );
    assert_eq!(
        k.procs.with_task(c, |t| t.state).unwrap(),
        TaskState::SLEEPING
    );

    k.task_wakeup_all(Chan::VtActivate);
    assert_eq!(
        k.procs.with_task(c, |t| t.state).unwrap(),
        TaskState::RUNNING
    );
}

#[test]
fn expired_timeouts_wake_through_schedule() {
    let k = boot();
    let b = spawn_task(&k, b"b");
    let deadline = k.jiffies() + 5;
    k.procs
        .with_task(b, |t| {
            t.state = TaskState::SLEEPING;
            t.chan = Some(Chan::Sleep(b));
            t.timeout = deadline;
        })
        .unwrap();

    for _ in 0..4 {
        k.tick();
    }
    k.schedule();
    assert_eq!(
        k.procs.with_task(b, |t| t.state).unwrap(),
        TaskState::SLEEPING
    );

    k.tick();
    k.schedule();
    let (state, timeout) = k.procs.with_task(b, |t| (t.state, t.timeout)).unwrap();
    assert_eq!(state, TaskState::RUNNING);
    assert_eq!(timeout, 0);
}

#[test]
fn zero_timeout_sleep_returns_immediately() {
    let k = boot();
    let pid = k.procs.current();
    // A pending signal must survive untouched.
    k.task_signal(pid, SIGUSR1).unwrap();
    assert_eq!(
        k.task_sleep_timeout(Chan::Sleep(pid), 0),
        SleepOutcome::Expired
    );
    assert!(k.procs.with_current(|t| t.sigpend & sigbit(SIGUSR1) != 0));
}

#[test]
fn signal_wakes_a_sleeper_unless_masked() {
    let k = boot();
    let b = spawn_task(&k, b"b");
    k.procs
        .with_task(b, |t| {
            t.state = TaskState::SLEEPING;
            t.sigmask = sigbit(SIGUSR2);
        })
        .unwrap();

    // Masked: stays asleep, signal still pending.
    k.task_signal(b, SIGUSR2).unwrap();
    assert_eq!(
        k.procs.with_task(b, |t| t.state).unwrap(),
        TaskState::SLEEPING
    );

    k.task_signal(b, SIGUSR1).unwrap();
    assert_eq!(
        k.procs.with_task(b, |t| t.state).unwrap(),
        TaskState::RUNNING
    );
}

#[test]
fn lowest_pending_unmasked_signal_is_delivered_first() {
    let k = boot();
    let pid = k.procs.current();
    k.sys_sigaction(
        SIGUSR1,
        Some(SigAction {
            handler: SigHandler::Ignore,
            ..SigAction::default()
        }),
    )
    .unwrap();
    k.task_signal(pid, SIGUSR1).unwrap();
    k.task_signal(pid, SIGALRM).unwrap();

    // SIGUSR1 (10) is below SIGALRM (14): it is taken first and
    // ignored, leaving SIGALRM pending for the next delivery.
    let mut regs = UserRegs::default();
    k.do_signal(&mut regs);
    let pend = k.procs.with_current(|t| t.sigpend);
    assert_eq!(pend & sigbit(SIGUSR1), 0);
    assert_ne!(pend & sigbit(SIGALRM), 0);
}

#[test]
fn handler_frame_round_trips_through_sigreturn() {
    let k = boot();
    let pid = k.procs.current();
    k.sys_sigaction(
        SIGUSR1,
        Some(SigAction {
            handler: SigHandler::Handler(0x5000),
            mask: sigbit(SIGUSR2),
            flags: SigFlags::empty(),
            restorer: 0,
        }),
    )
    .unwrap();

    let mut regs = UserRegs {
        eax: 11,
        ebx: 22,
        ecx: 33,
        esp: common::USTACK_TOP - 64,
        eip: 0x1234,
        ..UserRegs::default()
    };
    let saved = regs;

    k.task_signal(pid, SIGUSR1).unwrap();
    k.do_signal(&mut regs);

    // Redirected into the handler with the signal masked.
    assert_eq!(regs.eip, 0x5000);
    assert!(regs.esp < saved.esp);
    let mask = k.procs.with_current(|t| t.sigmask);
    assert_ne!(mask & sigbit(SIGUSR1), 0);
    assert_ne!(mask & sigbit(SIGUSR2), 0);

    // The handler clobbers registers, returns through the trampoline
    // (which pops the return address), then sigreturn runs.
    regs.eax = 0xdead;
    regs.ebx = 0xbeef;
    regs.esp += 4;
    k.sys_sigreturn(&mut regs).unwrap();
    assert_eq!(regs, saved);
    assert_eq!(k.procs.with_current(|t| t.sigmask), 0);
}

#[test]
fn sigkill_cannot_be_caught_or_masked() {
    let k = boot();
    assert_eq!(
        k.sys_sigaction(SIGKILL, Some(SigAction::default())),
        Err(KernelError::InvalidArg)
    );
    k.sys_sigprocmask(SIG_BLOCK, Some(sigbit(SIGKILL) | sigbit(SIGUSR1)))
        .unwrap();
    let mask = k.procs.with_current(|t| t.sigmask);
    assert_eq!(mask & sigbit(SIGKILL), 0);
    assert_ne!(mask & sigbit(SIGUSR1), 0);
}

#[test]
fn default_stop_and_cont() {
    let k = boot();
    let child = spawn_task(&k, b"stoppee");
    make_current(&k, child);

    k.task_signal(child, SIGSTOP).unwrap();
    let mut regs = UserRegs::default();
    k.do_signal(&mut regs);
    assert_eq!(
        k.procs.with_task(child, |t| t.state).unwrap(),
        TaskState::STOPPED
    );

    k.task_signal(child, SIGCONT).unwrap();
    let (state, pend) = k.procs.with_task(child, |t| (t.state, t.sigpend)).unwrap();
    assert_eq!(state, TaskState::RUNNING);
    assert_eq!(pend & sigbit(SIGSTOP), 0);
}

#[test]
fn group_signal_hits_every_member() {
    let k = boot();
    let b = spawn_task(&k, b"b");
    let c = spawn_task(&k, b"c");
    let d = spawn_task(&k, b"d");
    k.procs.with_task(b, |t| t.pgid = 42).unwrap();
    k.procs.with_task(c, |t| t.pgid = 42).unwrap();

    k.task_signal_group(42, SIGINT).unwrap();
    assert!(k.procs.with_task(b, |t| t.sigpend).unwrap() & sigbit(SIGINT) != 0);
    assert!(k.procs.with_task(c, |t| t.sigpend).unwrap() & sigbit(SIGINT) != 0);
    assert_eq!(k.procs.with_task(d, |t| t.sigpend).unwrap(), 0);
}

#[test]
fn fork_clones_memory_files_and_signals() {
    let k = boot();
    let parent = k.procs.current();
    k.procs.with_current(|t| {
        t.mm.copy_out(UBUF, b"parent data").unwrap();
    });
    let fd = k
        .do_open(
            AT_FDCWD,
            b"/shared",
            OpenFlags::from_bits_truncate(0o102),
            Mode(0o644),
        )
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.sys_sigaction(
        SIGUSR1,
        Some(SigAction {
            handler: SigHandler::Handler(0x7000),
            ..SigAction::default()
        }),
    )
    .unwrap();

    let regs = UserRegs {
        eax: 2,
        esp: common::USTACK_TOP - 64,
        ..UserRegs::default()
    };
    let child = k.do_fork(&regs).unwrap();
    assert_ne!(child, parent);
    assert_eq!(k.ftable.refs(fid), 2);

    let (child_eax, child_parent) = k
        .procs
        .with_task(child, |t| (t.user_regs.eax, t.parent))
        .unwrap();
    assert_eq!(child_eax, 0);
    assert_eq!(child_parent, parent);

    // The child sees a copy of parent memory, not the same pages.
    make_current(&k, child);
    let mut buf = [0u8; 11];
    k.procs.with_current(|t| t.mm.copy_in(UBUF, &mut buf).unwrap());
    assert_eq!(&buf, b"parent data");
    k.procs
        .with_current(|t| t.mm.copy_out(UBUF, b"child!").unwrap());
    make_current(&k, parent);
    k.procs.with_current(|t| t.mm.copy_in(UBUF, &mut buf).unwrap());
    assert_eq!(&buf, b"parent data");

    let handler = k.procs.with_task(child, |t| t.sig.actions[(SIGUSR1 - 1) as usize].handler).unwrap();
    assert_eq!(handler, SigHandler::Handler(0x7000));

    // Closing in the child never frees the parent's description.
    make_current(&k, child);
    k.do_close(fd).unwrap();
    assert_eq!(k.ftable.refs(fid), 1);
    make_current(&k, parent);
    assert!(k.fd_to_file(fd).is_ok());
    k.do_close(fd).unwrap();
}

#[test]
fn fork_exec_wait_round_trip() {
    let k = boot();
    let parent = k.procs.current();

    // A fake /bin/true: correct magic, executable mode.
    k.do_mkdir(AT_FDCWD, b"/bin", Mode(0o755)).unwrap();
    let fd = k
        .do_open(
            AT_FDCWD,
            b"/bin/true",
            OpenFlags::from_bits_truncate(0o102),
            Mode(0o755),
        )
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, &[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]).unwrap();
    k.do_close(fd).unwrap();

    let regs = UserRegs {
        esp: common::USTACK_TOP - 64,
        ..UserRegs::default()
    };
    let child = k.do_fork(&regs).unwrap();

    make_current(&k, child);
    put_user_str(&k, UBUF, b"/bin/true");
    k.sys_execve(UBUF, 0, 0).unwrap();
    let name = k.procs.with_current(|t| t.name);
    assert_eq!(&name[..4], b"true");

    k.sys_exit(0).unwrap();
    assert_eq!(
        k.procs.with_task(child, |t| t.state).unwrap(),
        TaskState::ZOMBIE
    );

    make_current(&k, parent);
    // The child's death left SIGCHLD pending.
    assert!(k.procs.with_current(|t| t.sigpend) & sigbit(SIGCHLD) != 0);
    let (pid, status) = k.sys_wait4(-1, 0).unwrap();
    assert_eq!(pid, child);
    assert_eq!(status, 0);
    // The slot is reclaimed.
    assert!(!k.procs.exists(child));
}

#[test]
fn wait_reports_exit_status_and_echild() {
    let k = boot();
    let parent = k.procs.current();
    let regs = UserRegs::default();
    let child = k.do_fork(&regs).unwrap();

    make_current(&k, child);
    k.sys_exit(3).unwrap();
    make_current(&k, parent);

    let (pid, status) = k.sys_wait4(child, 0).unwrap();
    assert_eq!(pid, child);
    assert_eq!(status, 3 << 8);
    assert_eq!(k.sys_wait4(-1, 0), Err(KernelError::NoChild));
}

#[test]
fn wnohang_returns_zero_for_live_children() {
    let k = boot();
    let regs = UserRegs::default();
    let _child = k.do_fork(&regs).unwrap();
    let (pid, _) = k.sys_wait4(-1, WNOHANG).unwrap();
    assert_eq!(pid, 0);
}

#[test]
fn orphans_are_reparented_to_init() {
    let k = boot();
    let parent = k.procs.current();
    let regs = UserRegs::default();
    let middle = k.do_fork(&regs).unwrap();

    make_current(&k, middle);
    let grandchild = k.do_fork(&regs).unwrap();
    k.sys_exit(0).unwrap();

    assert_eq!(
        k.procs.with_task(grandchild, |t| t.parent).unwrap(),
        1
    );
    make_current(&k, parent);
    let (pid, _) = k.sys_wait4(-1, 0).unwrap();
    assert_eq!(pid, middle);
}

#[test]
fn killed_task_exits_with_the_signal_number() {
    let k = boot();
    let parent = k.procs.current();
    let regs = UserRegs::default();
    let child = k.do_fork(&regs).unwrap();

    make_current(&k, child);
    k.task_signal(child, SIGKILL).unwrap();
    let mut child_regs = UserRegs::default();
    k.do_signal(&mut child_regs);
    assert_eq!(
        k.procs.with_task(child, |t| t.state).unwrap(),
        TaskState::ZOMBIE
    );

    make_current(&k, parent);
    let (pid, status) = k.sys_wait4(child, 0).unwrap();
    assert_eq!(pid, child);
    assert_eq!(status, SIGKILL as i32);
}

#[test]
fn pipe_round_trip_across_fork() {
    let k = boot();
    let parent = k.procs.current();
    let (rfd, wfd) = k.do_pipe().unwrap();

    let regs = UserRegs::default();
    let child = k.do_fork(&regs).unwrap();

    make_current(&k, child);
    let wfid = k.fd_to_file(wfd).unwrap();
    assert_eq!(k.file_write(wfid, b"hello").unwrap(), 5);
    k.do_close(rfd).unwrap();
    k.do_close(wfd).unwrap();

    make_current(&k, parent);
    let rfid = k.fd_to_file(rfd).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(k.file_read(rfid, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    k.do_close(rfd).unwrap();
    k.do_close(wfd).unwrap();
}

#[test]
fn pipe_end_of_file_after_writers_close() {
    let k = boot();
    let (rfd, wfd) = k.do_pipe().unwrap();
    let wfid = k.fd_to_file(wfd).unwrap();
    k.file_write(wfid, b"bye").unwrap();
    k.do_close(wfd).unwrap();

    let rfid = k.fd_to_file(rfd).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(k.file_read(rfid, &mut buf).unwrap(), 3);
    // Writers gone, data drained: EOF.
    assert_eq!(k.file_read(rfid, &mut buf).unwrap(), 0);
    k.do_close(rfd).unwrap();
}

#[test]
fn writing_a_readerless_pipe_breaks() {
    let k = boot();
    let pid = k.procs.current();
    let (rfd, wfd) = k.do_pipe().unwrap();
    k.do_close(rfd).unwrap();

    let wfid = k.fd_to_file(wfd).unwrap();
    assert_eq!(k.file_write(wfid, b"x"), Err(KernelError::BrokenPipe));
    assert!(k.procs.with_task(pid, |t| t.sigpend).unwrap() & sigbit(SIGPIPE) != 0);
    k.do_close(wfd).unwrap();
}

#[test]
fn setitimer_fires_sigalrm_after_the_interval() {
    let k = boot();
    let pid = k.procs.current();
    // itimerval { interval = 0, value = 1s }
    let mut raw = [0u8; 16];
    raw[8..12].copy_from_slice(&1u32.to_le_bytes());
    k.procs.with_current(|t| t.mm.copy_out(UBUF, &raw).unwrap());
    k.sys_setitimer(0, UBUF, 0).unwrap();

    for _ in 0..99 {
        k.tick();
    }
    assert_eq!(k.procs.with_task(pid, |t| t.sigpend).unwrap() & sigbit(SIGALRM), 0);
    k.tick();
    assert!(k.procs.with_task(pid, |t| t.sigpend).unwrap() & sigbit(SIGALRM) != 0);
}

#[test]
fn interrupted_restartable_syscall_rewinds_eip() {
    let k = boot();
    let pid = k.procs.current();
    k.sys_sigaction(
        SIGUSR1,
        Some(SigAction {
            handler: SigHandler::Handler(0x6000),
            flags: SigFlags::RESTART,
            ..SigAction::default()
        }),
    )
    .unwrap();

    // A blocking call just returned -EINTR; orig_eax recorded at entry.
    k.procs.with_current(|t| t.orig_eax = 3);
    let mut regs = UserRegs {
        eax: KernelError::Interrupted.to_ret() as u32,
        eip: 0x1002,
        esp: common::USTACK_TOP - 64,
        ..UserRegs::default()
    };
    k.task_signal(pid, SIGUSR1).unwrap();
    k.do_signal(&mut regs);

    // The frame retries the syscall after the handler returns.
    assert_eq!(regs.eip, 0x6000);
    regs.esp += 4;
    k.sys_sigreturn(&mut regs).unwrap();
    assert_eq!(regs.eip, 0x1000);
    assert_eq!(regs.eax, 3);
}
