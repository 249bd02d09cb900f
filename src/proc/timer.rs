//! Timer events.
//!
//! A monotonic jiffy counter drives a list of timer events. Expired
//! events fire synchronously from `Kernel::timer_update`, which runs at
//! every tick and on entry to `schedule`.

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    kernel::Kernel,
    param::HZ,
    proc::{Chan, Pid},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerAction {
    Wakeup(Chan),
    WakeupAll(Chan),
    Signal(Pid, u32),
}

#[derive(Copy, Clone, Debug)]
pub struct TimerEvent {
    pub id: u64,
    pub expires: u64,
    pub action: TimerAction,
}

struct TimersInner {
    next_id: u64,
    events: Vec<TimerEvent>,
}

pub struct Timers {
    inner: Mutex<TimersInner>,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimersInner {
                next_id: 1,
                events: Vec::new(),
            }),
        }
    }

    pub fn add(&self, expires: u64, action: TimerAction) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.events.push(TimerEvent {
            id,
            expires,
            action,
        });
        id
    }

    /// Re-arm an existing event; returns false if it already fired.
    pub fn modify(&self, id: u64, expires: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.events.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.expires = expires;
                true
            }
            None => false,
        }
    }

    pub fn del(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| e.id != id);
        inner.events.len() != before
    }

    fn take_expired(&self, now: u64) -> Vec<TimerEvent> {
        let mut inner = self.inner.lock();
        let mut fired = Vec::new();
        inner.events.retain(|e| {
            if e.expires <= now {
                fired.push(*e);
                false
            } else {
                true
            }
        });
        fired
    }
}

pub fn ms_to_jiffies(ms: u64) -> u64 {
    (ms * HZ + 999) / 1000
}

pub fn jiffies_to_ms(jiffies: u64) -> u64 {
    jiffies * 1000 / HZ
}

impl Kernel {
    /// Fire every expired timer event. Actions never allocate and never
    /// take a timer lock, so handlers may re-arm timers freely.
    pub fn timer_update(&self) {
        let now = self.jiffies();
        for event in self.timers.take_expired(now) {
            match event.action {
                TimerAction::Wakeup(chan) => self.task_wakeup(chan),
                TimerAction::WakeupAll(chan) => self.task_wakeup_all(chan),
                TimerAction::Signal(pid, sig) => {
                    let _ = self.task_signal(pid, sig);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion_rounds_up() {
        assert_eq!(ms_to_jiffies(0), 0);
        assert_eq!(ms_to_jiffies(1), 1);
        assert_eq!(ms_to_jiffies(10), 1);
        assert_eq!(ms_to_jiffies(15), 2);
        assert_eq!(ms_to_jiffies(1000), HZ);
    }

    #[test]
    fn expired_events_fire_once() {
        let timers = Timers::new();
        let id = timers.add(5, TimerAction::Wakeup(Chan::VtActivate));
        assert!(timers.take_expired(4).is_empty());
        let fired = timers.take_expired(5);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert!(timers.take_expired(100).is_empty());
    }

    #[test]
    fn modify_and_del() {
        let timers = Timers::new();
        let id = timers.add(5, TimerAction::Signal(1, 14));
        assert!(timers.modify(id, 50));
        assert!(timers.take_expired(10).is_empty());
        assert!(timers.del(id));
        assert!(!timers.del(id));
    }
}
