//! Pipes.
//!
//! A pipe is an anonymous inode whose data lives in a one-page ring.
//! Read and write positions only ever grow modulo the page size; the
//! ring is full at PAGE_SIZE - 1 resident bytes. Readers and writers
//! sleep on per-direction channels keyed by the inode slot and wake
//! each other after every transfer.

use alloc::boxed::Box;

use crate::{
    error::{KernelError, Result},
    fs::{IRef, Special},
    kernel::Kernel,
    param::PAGE_SIZE,
    proc::{signal::SIGPIPE, Chan},
};

pub struct Pipe {
    data: Box<[u8; PAGE_SIZE]>,
    rpos: u32,
    wpos: u32,
    pub readers: u32,
    pub writers: u32,
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            data: Box::new([0; PAGE_SIZE]),
            rpos: 0,
            wpos: 0,
            readers: 0,
            writers: 0,
        }
    }

    fn len(&self) -> usize {
        (self.wpos.wrapping_sub(self.rpos) as usize) & (PAGE_SIZE - 1)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() == PAGE_SIZE - 1
    }

    fn getc(&mut self) -> u8 {
        let c = self.data[self.rpos as usize & (PAGE_SIZE - 1)];
        self.rpos = self.rpos.wrapping_add(1);
        c
    }

    fn putc(&mut self, c: u8) {
        self.data[self.wpos as usize & (PAGE_SIZE - 1)] = c;
        self.wpos = self.wpos.wrapping_add(1);
    }
}

enum Step {
    Done(usize),
    Eof,
    Wait,
    NoReader,
}

impl Kernel {
    /// Read from a pipe inode, blocking while it is empty and a writer
    /// remains.
    pub fn read_pipe(&self, i: IRef, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let step = self.with_inode(i, |d| {
                let pipe = match &mut d.special {
                    Special::Pipe(p) => p,
                    _ => return Step::NoReader,
                };
                if pipe.is_empty() {
                    if pipe.writers == 0 {
                        return Step::Eof;
                    }
                    return Step::Wait;
                }
                let n = buf.len().min(pipe.len());
                for slot in buf[..n].iter_mut() {
                    *slot = pipe.getc();
                }
                Step::Done(n)
            });

            match step {
                Step::Done(n) => {
                    self.task_wakeup_all(Chan::PipeWrite(i.0));
                    return Ok(n);
                }
                Step::Eof => return Ok(0),
                Step::NoReader => return Err(KernelError::InvalidArg),
                Step::Wait => {
                    if nonblock {
                        return Err(KernelError::WouldBlock);
                    }
                    if self.procs.with_current(|t| t.signal_pending()) {
                        return Err(KernelError::Interrupted);
                    }
                    self.task_wakeup_all(Chan::PipeWrite(i.0));
                    self.task_sleep(Chan::PipeRead(i.0));
                }
            }
        }
    }

    /// Write to a pipe inode. Writing with no reader raises SIGPIPE and
    /// fails with BrokenPipe.
    pub fn write_pipe(&self, i: IRef, data: &[u8], nonblock: bool) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let step = self.with_inode(i, |d| {
                let pipe = match &mut d.special {
                    Special::Pipe(p) => p,
                    _ => return Step::NoReader,
                };
                if pipe.readers == 0 {
                    return Step::NoReader;
                }
                if pipe.is_full() {
                    return Step::Wait;
                }
                let mut n = 0;
                while written + n < data.len() && !pipe.is_full() {
                    pipe.putc(data[written + n]);
                    n += 1;
                }
                Step::Done(n)
            });

            match step {
                Step::Done(n) => {
                    written += n;
                    self.task_wakeup_all(Chan::PipeRead(i.0));
                }
                Step::NoReader => {
                    let pid = self.procs.current();
                    let _ = self.task_signal(pid, SIGPIPE);
                    return Err(KernelError::BrokenPipe);
                }
                Step::Wait | Step::Eof => {
                    if nonblock {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(KernelError::WouldBlock)
                        };
                    }
                    if self.procs.with_current(|t| t.signal_pending()) {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(KernelError::Interrupted)
                        };
                    }
                    self.task_wakeup_all(Chan::PipeRead(i.0));
                    self.task_sleep(Chan::PipeWrite(i.0));
                }
            }
        }
        Ok(written)
    }

    /// Allocate the pipe inode backing `pipe(2)`.
    pub fn get_pipe_inode(&self) -> Result<IRef> {
        let i = self.get_empty_inode()?;
        self.with_inode(i, |d| {
            d.mode = crate::fs::Mode(crate::fs::S_IFIFO | 0o600);
            d.nlinks = 1;
            let mut pipe = Pipe::new();
            pipe.readers = 1;
            pipe.writers = 1;
            d.special = Special::Pipe(Box::new(pipe));
        });
        Ok(i)
    }

    /// Called when a pipe-end file closes: drop the side's count and
    /// wake the peers so they observe EOF or broken pipe.
    pub fn release_pipe_end(&self, i: IRef, writable: bool) {
        self.with_inode(i, |d| {
            if let Special::Pipe(p) = &mut d.special {
                if writable {
                    p.writers = p.writers.saturating_sub(1);
                } else {
                    p.readers = p.readers.saturating_sub(1);
                }
            }
        });
        self.task_wakeup_all(Chan::PipeRead(i.0));
        self.task_wakeup_all(Chan::PipeWrite(i.0));
    }
}
