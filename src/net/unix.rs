//! Loopback AF_UNIX family.
//!
//! Addresses are short byte strings matched exactly. Datagram sockets
//! deliver one skb per sendto; stream pairs splice their skb queues
//! after the listen/accept handshake.

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    net::{
        ProtOps, Skb, SockAddr, SockState, RCV_SHUTDOWN, SEND_SHUTDOWN, SOCK_DGRAM,
        SOCK_STREAM, SOL_SOCKET, SO_ERROR, SO_RCVBUF, SO_SNDBUF, SO_TYPE,
    },
    param::SKB_QUEUE_LEN,
    proc::Chan,
};

pub struct UnixOps;

impl UnixOps {
    /// Slot of the socket bound to `addr`, excluding `not`.
    fn find_bound(&self, k: &Kernel, addr: &SockAddr, not: usize) -> Option<usize> {
        let slots = k.sockets.slots.lock();
        slots
            .iter()
            .enumerate()
            .find(|(i, s)| {
                *i != not
                    && s.state != SockState::Free
                    && s.name.as_ref().map_or(false, |n| n.path() == addr.path())
            })
            .map(|(i, _)| i)
    }
}

impl ProtOps for UnixOps {
    fn create(&self, _k: &Kernel, _s: usize, _protocol: i32) -> Result<()> {
        Ok(())
    }

    fn dup(&self, k: &Kernel, news: usize, olds: usize) -> Result<()> {
        let (family, typ) = k.with_sock(olds, |s| (s.family, s.typ));
        k.with_sock(news, |s| {
            s.family = family;
            s.typ = typ;
        });
        Ok(())
    }

    fn release(&self, k: &Kernel, s: usize) -> Result<()> {
        let peer = k.with_sock(s, |sock| sock.peer.take());
        if let Some(peer) = peer {
            k.with_sock(peer, |p| {
                p.peer = None;
                if p.state == SockState::Connected {
                    p.state = SockState::Disconnecting;
                }
            });
            k.task_wakeup_all(Chan::Socket(peer));
        }
        Ok(())
    }

    fn bind(&self, k: &Kernel, s: usize, addr: &SockAddr) -> Result<()> {
        if addr.path().is_empty() {
            return Err(KernelError::InvalidArg);
        }
        if self.find_bound(k, addr, s).is_some() {
            return Err(KernelError::Exists);
        }
        k.with_sock(s, |sock| sock.name = Some(*addr));
        Ok(())
    }

    fn connect(&self, k: &Kernel, s: usize, addr: &SockAddr, nonblock: bool) -> Result<()> {
        let typ = k.with_sock(s, |sock| sock.typ);
        let target = self
            .find_bound(k, addr, s)
            .ok_or(KernelError::NoEntry)?;

        match typ {
            SOCK_DGRAM => {
                k.with_sock(s, |sock| {
                    sock.peer = Some(target);
                    sock.state = SockState::Connected;
                });
                Ok(())
            }
            SOCK_STREAM => {
                let queued = k.with_sock(target, |listener| {
                    if listener.state != SockState::Listening {
                        return Err(KernelError::NoEntry);
                    }
                    if listener.backlog.len() >= listener.backlog_max {
                        return Err(KernelError::WouldBlock);
                    }
                    listener.backlog.push_back(s);
                    Ok(())
                });
                queued?;
                k.with_sock(s, |sock| sock.state = SockState::Connecting);
                k.task_wakeup_all(Chan::Socket(target));

                loop {
                    let state = k.with_sock(s, |sock| sock.state);
                    match state {
                        SockState::Connected => return Ok(()),
                        SockState::Connecting => {
                            if nonblock {
                                return Err(KernelError::WouldBlock);
                            }
                            if k.procs.with_current(|t| t.signal_pending()) {
                                return Err(KernelError::Interrupted);
                            }
                            k.task_sleep(Chan::Socket(s));
                        }
                        _ => return Err(KernelError::Io),
                    }
                }
            }
            _ => Err(KernelError::NotSupported),
        }
    }

    fn listen(&self, k: &Kernel, s: usize, backlog: usize) -> Result<()> {
        k.with_sock(s, |sock| {
            if sock.typ != SOCK_STREAM {
                return Err(KernelError::NotSupported);
            }
            if sock.name.is_none() {
                return Err(KernelError::InvalidArg);
            }
            sock.state = SockState::Listening;
            sock.backlog_max = backlog;
            Ok(())
        })
    }

    fn accept(&self, k: &Kernel, s: usize, news: usize, nonblock: bool) -> Result<()> {
        loop {
            let client = k.with_sock(s, |sock| {
                if sock.state != SockState::Listening {
                    return Err(KernelError::InvalidArg);
                }
                Ok(sock.backlog.pop_front())
            })?;

            match client {
                Some(client) => {
                    let name = k.with_sock(s, |sock| sock.name);
                    k.with_sock(news, |sock| {
                        sock.peer = Some(client);
                        sock.state = SockState::Connected;
                        sock.name = name;
                    });
                    k.with_sock(client, |sock| {
                        sock.peer = Some(news);
                        sock.state = SockState::Connected;
                    });
                    k.task_wakeup_all(Chan::Socket(client));
                    return Ok(());
                }
                None => {
                    if nonblock {
                        return Err(KernelError::WouldBlock);
                    }
                    if k.procs.with_current(|t| t.signal_pending()) {
                        return Err(KernelError::Interrupted);
                    }
                    k.task_sleep(Chan::Socket(s));
                }
            }
        }
    }

    fn sendmsg(
        &self,
        k: &Kernel,
        s: usize,
        data: &[u8],
        to: Option<&SockAddr>,
        nonblock: bool,
    ) -> Result<usize> {
        let (typ, shutdown, name) = k.with_sock(s, |sock| (sock.typ, sock.shutdown, sock.name));
        if shutdown & SEND_SHUTDOWN != 0 {
            return Err(KernelError::BrokenPipe);
        }

        let target = match to {
            Some(addr) => self.find_bound(k, addr, s).ok_or(KernelError::NoEntry)?,
            None => k
                .with_sock(s, |sock| sock.peer)
                .ok_or(KernelError::BrokenPipe)?,
        };
        let _ = typ;

        loop {
            let pushed = k.with_sock(target, |peer| {
                if peer.state == SockState::Free || peer.shutdown & RCV_SHUTDOWN != 0 {
                    return Err(KernelError::BrokenPipe);
                }
                if peer.rcv.len() >= SKB_QUEUE_LEN {
                    return Ok(false);
                }
                peer.rcv.push_back(Skb {
                    from: name.unwrap_or_else(SockAddr::zeroed),
                    data: data.to_vec(),
                    off: 0,
                });
                Ok(true)
            })?;

            if pushed {
                k.task_wakeup_all(Chan::Socket(target));
                return Ok(data.len());
            }
            if nonblock {
                return Err(KernelError::WouldBlock);
            }
            if k.procs.with_current(|t| t.signal_pending()) {
                return Err(KernelError::Interrupted);
            }
            k.task_sleep(Chan::Socket(target));
        }
    }

    fn recvmsg(
        &self,
        k: &Kernel,
        s: usize,
        buf: &mut [u8],
        mut from: Option<&mut SockAddr>,
        nonblock: bool,
    ) -> Result<usize> {
        let typ = k.with_sock(s, |sock| sock.typ);
        loop {
            enum Got {
                Data(usize),
                Empty,
                Eof,
            }
            let got = k.with_sock(s, |sock| {
                if sock.rcv.is_empty() {
                    if sock.shutdown & RCV_SHUTDOWN != 0
                        || sock.state == SockState::Disconnecting
                    {
                        return Got::Eof;
                    }
                    return Got::Empty;
                }
                let mut copied = 0;
                if typ == SOCK_DGRAM {
                    let skb = sock.rcv.pop_front().expect("recvmsg: queue");
                    copied = buf.len().min(skb.data.len());
                    buf[..copied].copy_from_slice(&skb.data[..copied]);
                    if let Some(from) = from.as_deref_mut() {
                        *from = skb.from;
                    }
                } else {
                    // Stream: gather across segments.
                    while copied < buf.len() {
                        let done = match sock.rcv.front_mut() {
                            Some(skb) => {
                                let take = (buf.len() - copied).min(skb.data.len() - skb.off);
                                buf[copied..copied + take]
                                    .copy_from_slice(&skb.data[skb.off..skb.off + take]);
                                skb.off += take;
                                copied += take;
                                skb.off >= skb.data.len()
                            }
                            None => break,
                        };
                        if done {
                            sock.rcv.pop_front();
                        }
                    }
                    if let Some(from) = from.as_deref_mut() {
                        if let Some(name) = sock.name {
                            *from = name;
                        }
                    }
                }
                Got::Data(copied)
            });

            match got {
                Got::Data(n) => {
                    // A sender may be waiting for queue space.
                    k.task_wakeup_all(Chan::Socket(s));
                    return Ok(n);
                }
                Got::Eof => return Ok(0),
                Got::Empty => {
                    if nonblock {
                        return Err(KernelError::WouldBlock);
                    }
                    if k.procs.with_current(|t| t.signal_pending()) {
                        return Err(KernelError::Interrupted);
                    }
                    k.task_sleep(Chan::Socket(s));
                }
            }
        }
    }

    fn shutdown(&self, k: &Kernel, s: usize, how: i32) -> Result<()> {
        let bits = match how {
            0 => RCV_SHUTDOWN,
            1 => SEND_SHUTDOWN,
            2 => RCV_SHUTDOWN | SEND_SHUTDOWN,
            _ => return Err(KernelError::InvalidArg),
        };
        k.with_sock(s, |sock| sock.shutdown |= bits);
        k.task_wakeup_all(Chan::Socket(s));
        Ok(())
    }

    fn getsockname(&self, k: &Kernel, s: usize) -> Result<SockAddr> {
        k.with_sock(s, |sock| sock.name)
            .ok_or(KernelError::InvalidArg)
    }

    fn getpeername(&self, k: &Kernel, s: usize) -> Result<SockAddr> {
        let peer = k
            .with_sock(s, |sock| sock.peer)
            .ok_or(KernelError::NotSocket)?;
        k.with_sock(peer, |sock| sock.name)
            .ok_or(KernelError::InvalidArg)
    }

    fn getsockopt(&self, k: &Kernel, s: usize, level: i32, name: i32) -> Result<u32> {
        if level != SOL_SOCKET {
            return Err(KernelError::NotSupported);
        }
        k.with_sock(s, |sock| match name {
            SO_TYPE => Ok(sock.typ as u32),
            SO_ERROR => {
                let err = sock.err;
                sock.err = 0;
                Ok(err as u32)
            }
            SO_SNDBUF => Ok(sock.sndbuf),
            SO_RCVBUF => Ok(sock.rcvbuf),
            _ => Err(KernelError::NotSupported),
        })
    }

    fn setsockopt(&self, k: &Kernel, s: usize, level: i32, name: i32, val: u32) -> Result<()> {
        if level != SOL_SOCKET {
            return Err(KernelError::NotSupported);
        }
        k.with_sock(s, |sock| match name {
            SO_SNDBUF => {
                sock.sndbuf = val;
                Ok(())
            }
            SO_RCVBUF => {
                sock.rcvbuf = val;
                Ok(())
            }
            _ => Err(KernelError::NotSupported),
        })
    }
}
