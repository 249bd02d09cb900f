//! Pseudo-terminals.
//!
//! Opening /dev/ptmx picks a free pair: the slave tty behaves like a
//! console-less terminal, the master is a raw conduit for whatever
//! process drives it. A write on either side lands in the peer's read
//! queue and is cooked there. Closing the master unlinks the pts node
//! and hangs up every task controlled by the slave.

use spin::Mutex;

use crate::{
    dev::{self, DevT},
    error::{KernelError, Result},
    kernel::Kernel,
    param::{NR_CONSOLES, NR_PTYS},
    proc::{
        signal::{SIGCONT, SIGHUP},
        Chan, Pid,
    },
    tty::{Termios, Tty, TtyKind},
};

pub struct PtyTable {
    /// Open count per pair; 0 means free.
    pub count: Mutex<[u32; NR_PTYS]>,
}

impl PtyTable {
    pub fn new() -> Self {
        Self {
            count: Mutex::new([0; NR_PTYS]),
        }
    }
}

pub fn slave_index(n: usize) -> usize {
    NR_CONSOLES + n
}

pub fn master_index(n: usize) -> usize {
    NR_CONSOLES + NR_PTYS + n
}

impl Kernel {
    /// Allocate a master/slave pair; returns the master tty index.
    pub fn ptmx_open(&self) -> Result<usize> {
        let n = {
            let mut counts = self.ptys.count.lock();
            let n = counts
                .iter()
                .position(|c| *c == 0)
                .ok_or(KernelError::NoMemory)?;
            counts[n] = 1;
            n
        };

        let sidx = slave_index(n);
        let midx = master_index(n);
        {
            let mut slave = self.ttys.ttys[sidx].lock();
            *slave = Tty::bare(sidx, TtyKind::PtySlave(n));
            slave.dev = DevT::new(dev::PTS_MAJOR, n as u32);
            slave.link = Some(midx);
            slave.count = 1;
        }
        {
            let mut master = self.ttys.ttys[midx].lock();
            *master = Tty::bare(midx, TtyKind::PtyMaster(n));
            master.dev = dev::DEV_PTMX;
            master.link = Some(sidx);
            master.termios = Termios::raw();
            master.count = 1;
        }

        if let Err(e) = self.pts_mknod(n as u32) {
            self.ptys.count.lock()[n] = 0;
            return Err(e);
        }
        Ok(midx)
    }

    /// Master close: remove the pts node and hang up the slave's tasks.
    pub fn ptm_close(&self, midx: usize) {
        let (n, sidx) = {
            let tty = self.ttys.ttys[midx].lock();
            match (tty.kind, tty.link) {
                (TtyKind::PtyMaster(n), Some(sidx)) => (n, sidx),
                _ => return,
            }
        };

        let _ = self.pts_unlink(n as u32);

        // SIGHUP then SIGCONT for every task whose controlling tty is
        // the slave. Pure bitset writes, safe mid-teardown.
        let targets: alloc::vec::Vec<Pid> = {
            let inner = self.procs.inner.lock();
            inner
                .order()
                .iter()
                .copied()
                .filter(|pid| {
                    inner.task(*pid).map_or(false, |t| t.tty == Some(sidx))
                })
                .collect()
        };
        for pid in targets {
            let _ = self.task_signal(pid, SIGHUP);
            let _ = self.task_signal(pid, SIGCONT);
        }

        {
            let mut slave = self.ttys.ttys[sidx].lock();
            slave.link = None;
            slave.count = 0;
        }
        {
            let mut master = self.ttys.ttys[midx].lock();
            master.link = None;
            master.count = 0;
        }
        self.ptys.count.lock()[n] = 0;
        self.task_wakeup_all(Chan::TtyRead(sidx));
        self.task_wakeup_all(Chan::TtyRead(midx));
    }

    /// Pty driver write: move the write queue into the peer's read
    /// queue, then run the peer's line discipline.
    pub fn pty_write(&self, idx: usize) -> Result<()> {
        let link = {
            let tty = self.ttys.ttys[idx].lock();
            tty.link
        };
        let peer = match link {
            Some(peer) => peer,
            None => {
                // Writing into a hung-up pty.
                let mut tty = self.ttys.ttys[idx].lock();
                while tty.write_q.getc().is_some() {}
                return Err(KernelError::Io);
            }
        };

        loop {
            let mut chunk = [0u8; 64];
            let n = {
                let mut tty = self.ttys.ttys[idx].lock();
                tty.write_q.read(&mut chunk)
            };
            if n == 0 {
                break;
            }
            let pushed = {
                let mut ptty = self.ttys.ttys[peer].lock();
                ptty.read_q.write(&chunk[..n])
            };
            self.tty_cook(peer);
            if pushed < n {
                // Peer queue full: drop the rest, matching the lossy
                // device-side behavior of a saturated terminal.
                break;
            }
        }
        self.task_wakeup_all(Chan::TtyWrite(idx));
        Ok(())
    }
}
