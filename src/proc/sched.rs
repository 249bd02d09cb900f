//! Scheduler.
//!
//! Single CPU, round robin. Tasks run until they suspend at an explicit
//! point (`schedule`, `task_sleep`, blocking I/O) or an IRQ boundary
//! decides to reschedule. `schedule` advances timers, wakes expired
//! timed sleeps, picks the next RUNNING task after the current one, and
//! context-switches through the arch hooks.
//!
//! Wakeups preserve queue order: `task_wakeup` readies the first sleeper
//! on the channel in run-order, `task_wakeup_all` readies all of them in
//! that order.

use arrayvec::ArrayVec;

use crate::{
    kernel::Kernel,
    param::NPROC,
    proc::{timer::ms_to_jiffies, Chan, Pid, TaskState},
};

/// Why a timed sleep ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The deadline passed.
    Expired,
    /// Woken by `task_wakeup` or a signal before the deadline.
    Woken,
}

impl Kernel {
    /// One timer tick: advance jiffies and fire timer events. The IRQ
    /// stub calls this and may follow with `schedule` for preemption.
    pub fn tick(&self) {
        self.ticks
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        self.timer_update();
    }

    pub fn jiffies(&self) -> u64 {
        self.ticks.load(core::sync::atomic::Ordering::SeqCst)
    }

    /// Pick the next RUNNING task after `current` in run order, falling
    /// back to `current` if it still runs, else to the idle task.
    pub fn pick_next(&self) -> Pid {
        let inner = self.procs.inner.lock();
        let order = inner.order();
        let cur = inner.current();
        let pos = order.iter().position(|p| *p == cur).unwrap_or(0);

        for off in 1..=order.len() {
            let pid = order[(pos + off) % order.len()];
            // Slot 0 is the kernel idle task; it only runs as fallback.
            if pid == 0 {
                continue;
            }
            if inner.task(pid).map(|t| t.state) == Some(TaskState::RUNNING) {
                return pid;
            }
        }
        if inner.task(cur).map(|t| t.state) == Some(TaskState::RUNNING) {
            return cur;
        }
        0
    }

    /// Reschedule. Interrupts are disabled by the caller (trap entry or
    /// an explicit suspension point).
    pub fn schedule(&self) {
        // Jiffy-driven callbacks first, then timed-sleep expiry.
        self.timer_update();
        let now = self.jiffies();
        {
            let mut inner = self.procs.inner.lock();
            let pids: ArrayVec<Pid, NPROC> =
                inner.order().iter().copied().collect();
            for pid in pids {
                if let Some(task) = inner.task_mut(pid) {
                    if task.timeout != 0 && task.timeout <= now {
                        task.timeout = 0;
                        if task.state == TaskState::SLEEPING {
                            task.state = TaskState::RUNNING;
                        }
                    }
                }
            }
        }

        let next = self.pick_next();
        let prev = self.procs.current();
        if next == prev {
            return;
        }

        let (prev_esp, next_esp, next_stack, next_pgd) = {
            let mut inner = self.procs.inner.lock();
            inner.set_current(next);
            let prev_esp = inner.task_mut(prev).map(|t| t.esp).unwrap_or(0);
            let t = inner.task_mut(next).expect("schedule: picked task");
            (prev_esp, t.esp, t.kernel_stack, t.mm.pgd)
        };

        self.arch.set_kernel_stack(next_stack);
        self.arch.switch_page_directory(next_pgd);
        self.arch.switch_to(prev_esp, next_esp);

        // Running again; whoever resumed us already made us current on
        // real hardware, and the host harness needs it restored by hand.
        self.procs.inner.lock().set_current(prev);
    }

    /// Sleep on a channel until `task_wakeup` readies us.
    pub fn task_sleep(&self, chan: Chan) {
        self.procs.with_current(|t| {
            t.chan = Some(chan);
            t.state = TaskState::SLEEPING;
        });
        self.schedule();
        self.procs.with_current(|t| t.chan = None);
    }

    /// Sleep with a deadline. A zero timeout returns immediately so
    /// pending signals are never consumed by accident.
    pub fn task_sleep_timeout(&self, chan: Chan, ms: u64) -> SleepOutcome {
        if ms == 0 {
            return SleepOutcome::Expired;
        }
        let deadline = self.jiffies() + ms_to_jiffies(ms);
        self.procs.with_current(|t| {
            t.chan = Some(chan);
            t.timeout = deadline;
            t.state = TaskState::SLEEPING;
        });
        self.schedule();
        self.procs.with_current(|t| {
            t.chan = None;
            if t.timeout != 0 {
                // Woken before expiry; disarm the deadline.
                t.timeout = 0;
                SleepOutcome::Woken
            } else {
                SleepOutcome::Expired
            }
        })
    }

    /// Ready the first task sleeping on `chan`.
    pub fn task_wakeup(&self, chan: Chan) {
        let mut inner = self.procs.inner.lock();
        let pids: ArrayVec<Pid, NPROC> =
            inner.order().iter().copied().collect();
        for pid in pids {
            if let Some(task) = inner.task_mut(pid) {
                if task.state == TaskState::SLEEPING && task.chan == Some(chan) {
                    task.state = TaskState::RUNNING;
                    break;
                }
            }
        }
    }

    /// Ready every task sleeping on `chan`, in queue order.
    pub fn task_wakeup_all(&self, chan: Chan) {
        let mut inner = self.procs.inner.lock();
        let pids: ArrayVec<Pid, NPROC> =
            inner.order().iter().copied().collect();
        for pid in pids {
            if let Some(task) = inner.task_mut(pid) {
                if task.state == TaskState::SLEEPING && task.chan == Some(chan) {
                    task.state = TaskState::RUNNING;
                }
            }
        }
    }
}
