//! Socket layer.
//!
//! Sockets are backed by anonymous inodes: the descriptor resolves to
//! an inode whose special field names a slot in the socket table, and
//! every operation forwards through the family's `ProtOps` vtable. A
//! missing op answers NotSupported. The table is small and scanned
//! linearly; inode-to-socket is unique by construction.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};

use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::{KernelError, Result},
    file::OpenFlags,
    fs::{IRef, Mode, Special, S_IFSOCK},
    kernel::Kernel,
    param::NR_SOCKETS,
    proc::Chan,
};

pub mod unix;

pub const AF_UNIX: u16 = 1;
pub const AF_INET: u16 = 2;

pub const SOCK_STREAM: u16 = 1;
pub const SOCK_DGRAM: u16 = 2;
pub const SOCK_RAW: u16 = 3;

pub const SOL_SOCKET: i32 = 1;
pub const SO_TYPE: i32 = 3;
pub const SO_ERROR: i32 = 4;
pub const SO_SNDBUF: i32 = 7;
pub const SO_RCVBUF: i32 = 8;

pub const RCV_SHUTDOWN: u8 = 1;
pub const SEND_SHUTDOWN: u8 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SockState {
    Free,
    Unconnected,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Dead,
}

/// Generic socket address, the wire form of struct sockaddr.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct SockAddr {
    pub family: u16,
    pub data: [u8; 14],
}

impl SockAddr {
    pub fn zeroed() -> Self {
        Self {
            family: 0,
            data: [0; 14],
        }
    }

    /// Address payload up to the first NUL.
    pub fn path(&self) -> &[u8] {
        let len = self.data.iter().position(|c| *c == 0).unwrap_or(14);
        &self.data[..len]
    }
}

/// One queued datagram (or stream segment).
pub struct Skb {
    pub from: SockAddr,
    pub data: Vec<u8>,
    /// Read offset for stream sockets.
    pub off: usize,
}

pub struct Socket {
    pub family: u16,
    pub typ: u16,
    pub state: SockState,
    pub inode: Option<IRef>,
    /// Connected peer slot.
    pub peer: Option<usize>,
    /// Bound address.
    pub name: Option<SockAddr>,
    /// Pending connections on a listener.
    pub backlog: VecDeque<usize>,
    pub backlog_max: usize,
    /// Incoming data.
    pub rcv: VecDeque<Skb>,
    pub shutdown: u8,
    pub err: i32,
    pub sndbuf: u32,
    pub rcvbuf: u32,
}

impl Socket {
    fn free() -> Self {
        Self {
            family: 0,
            typ: 0,
            state: SockState::Free,
            inode: None,
            peer: None,
            name: None,
            backlog: VecDeque::new(),
            backlog_max: 0,
            rcv: VecDeque::new(),
            shutdown: 0,
            err: 0,
            sndbuf: 64 * 1024,
            rcvbuf: 64 * 1024,
        }
    }
}

pub struct SocketTable {
    pub slots: Mutex<Vec<Socket>>,
}

impl SocketTable {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(NR_SOCKETS);
        for _ in 0..NR_SOCKETS {
            v.push(Socket::free());
        }
        Self {
            slots: Mutex::new(v),
        }
    }
}

/// Per-family operations. Defaults report the missing slot.
pub trait ProtOps: Send + Sync {
    fn create(&self, _k: &Kernel, _s: usize, _protocol: i32) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    /// Copy family/type state into a freshly allocated accept socket.
    fn dup(&self, _k: &Kernel, _news: usize, _olds: usize) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn release(&self, _k: &Kernel, _s: usize) -> Result<()> {
        Ok(())
    }

    fn bind(&self, _k: &Kernel, _s: usize, _addr: &SockAddr) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn connect(&self, _k: &Kernel, _s: usize, _addr: &SockAddr, _nonblock: bool) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn listen(&self, _k: &Kernel, _s: usize, _backlog: usize) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn accept(&self, _k: &Kernel, _s: usize, _news: usize, _nonblock: bool) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn sendmsg(
        &self,
        _k: &Kernel,
        _s: usize,
        _data: &[u8],
        _to: Option<&SockAddr>,
        _nonblock: bool,
    ) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn recvmsg(
        &self,
        _k: &Kernel,
        _s: usize,
        _buf: &mut [u8],
        _from: Option<&mut SockAddr>,
        _nonblock: bool,
    ) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn shutdown(&self, _k: &Kernel, _s: usize, _how: i32) -> Result<()> {
        Err(KernelError::NotSupported)
    }

    fn getsockname(&self, _k: &Kernel, _s: usize) -> Result<SockAddr> {
        Err(KernelError::NotSupported)
    }

    fn getpeername(&self, _k: &Kernel, _s: usize) -> Result<SockAddr> {
        Err(KernelError::NotSupported)
    }

    fn getsockopt(&self, _k: &Kernel, _s: usize, _level: i32, _name: i32) -> Result<u32> {
        Err(KernelError::NotSupported)
    }

    fn setsockopt(&self, _k: &Kernel, _s: usize, _level: i32, _name: i32, _val: u32) -> Result<()> {
        Err(KernelError::NotSupported)
    }
}

fn family_ops(family: u16) -> Result<&'static dyn ProtOps> {
    match family {
        AF_UNIX => Ok(&unix::UnixOps),
        _ => Err(KernelError::InvalidArg),
    }
}

impl Kernel {
    /// Allocate a socket slot plus its anonymous inode.
    fn sock_alloc(&self) -> Result<usize> {
        let idx = {
            let mut slots = self.sockets.slots.lock();
            let idx = slots
                .iter()
                .position(|s| s.state == SockState::Free)
                .ok_or(KernelError::TooManyOpen)?;
            slots[idx] = Socket::free();
            slots[idx].state = SockState::Unconnected;
            idx
        };
        let inode = match self.get_empty_inode() {
            Ok(i) => i,
            Err(e) => {
                self.sockets.slots.lock()[idx].state = SockState::Free;
                return Err(e);
            }
        };
        self.with_inode(inode, |d| {
            d.mode = Mode(S_IFSOCK | 0o600);
            d.nlinks = 1;
            d.special = Special::Socket(idx);
        });
        self.sockets.slots.lock()[idx].inode = Some(inode);
        Ok(idx)
    }

    /// The socket bound to an inode; constant-time over the fixed table.
    pub fn sock_lookup(&self, inode: IRef) -> Result<usize> {
        let slots = self.sockets.slots.lock();
        slots
            .iter()
            .position(|s| s.state != SockState::Free && s.inode == Some(inode))
            .ok_or(KernelError::NotSocket)
    }

    /// Socket slot behind a descriptor.
    pub fn sockfd_lookup(&self, fd: i32) -> Result<(usize, bool)> {
        let fid = self.fd_to_file(fd)?;
        let (inode, nonblock) = self.with_file(fid, |f| {
            (f.inode, f.flags.contains(OpenFlags::O_NONBLOCK))
        })?;
        Ok((self.sock_lookup(inode)?, nonblock))
    }

    pub fn with_sock<R>(&self, s: usize, f: impl FnOnce(&mut Socket) -> R) -> R {
        let mut slots = self.sockets.slots.lock();
        f(&mut slots[s])
    }

    fn sock_ops(&self, s: usize) -> Result<&'static dyn ProtOps> {
        let family = self.with_sock(s, |sock| sock.family);
        family_ops(family)
    }

    /// socket(2): allocate the slot, the inode and the descriptor.
    pub fn sys_socket(&self, family: i32, typ: i32, protocol: i32) -> Result<i32> {
        let ops = family_ops(family as u16)?;
        let idx = self.sock_alloc()?;
        self.with_sock(idx, |s| {
            s.family = family as u16;
            s.typ = typ as u16;
        });
        if let Err(e) = ops.create(self, idx, protocol) {
            self.sock_destroy(idx);
            return Err(e);
        }

        let inode = self.with_sock(idx, |s| s.inode).ok_or(KernelError::Io)?;
        self.idup(inode);
        let fid = match self.falloc(inode, OpenFlags::O_RDWR) {
            Ok(fid) => fid,
            Err(e) => {
                self.iput(inode);
                self.sock_destroy(idx);
                return Err(e);
            }
        };
        match self.fd_install(fid, false) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                self.file_put(fid);
                Err(e)
            }
        }
    }

    /// Tear down a socket slot and its inode binding.
    fn sock_destroy(&self, s: usize) {
        let inode = self.with_sock(s, |sock| {
            let inode = sock.inode.take();
            *sock = Socket::free();
            inode
        });
        if let Some(inode) = inode {
            self.with_inode(inode, |d| d.special = Special::None);
            self.iput(inode);
        }
        self.task_wakeup_all(Chan::Socket(s));
    }

    /// Last close of the owning file.
    pub fn sock_close(&self, s: usize) {
        if let Ok(ops) = self.sock_ops(s) {
            let _ = ops.release(self, s);
        }
        self.sock_destroy(s);
    }

    pub fn sys_bind(&self, fd: i32, addr: &SockAddr) -> Result<i32> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.bind(self, s, addr)?;
        Ok(0)
    }

    pub fn sys_connect(&self, fd: i32, addr: &SockAddr) -> Result<i32> {
        let (s, nonblock) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.connect(self, s, addr, nonblock)?;
        Ok(0)
    }

    pub fn sys_listen(&self, fd: i32, backlog: i32) -> Result<i32> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?
            .listen(self, s, backlog.max(1) as usize)?;
        Ok(0)
    }

    /// accept(2): allocate a second socket inheriting family/type, then
    /// let the family block for a connection.
    pub fn sys_accept(&self, fd: i32, addr_out: Option<&mut SockAddr>) -> Result<i32> {
        let (s, nonblock) = self.sockfd_lookup(fd)?;
        let ops = self.sock_ops(s)?;

        let news = self.sock_alloc()?;
        if let Err(e) = ops.dup(self, news, s) {
            self.sock_destroy(news);
            return Err(e);
        }
        if let Err(e) = ops.accept(self, s, news, nonblock) {
            self.sock_destroy(news);
            return Err(e);
        }

        if let Some(out) = addr_out {
            if let Ok(peer) = ops.getpeername(self, news) {
                *out = peer;
            }
        }

        let inode = self.with_sock(news, |s| s.inode).ok_or(KernelError::Io)?;
        self.idup(inode);
        let fid = match self.falloc(inode, OpenFlags::O_RDWR) {
            Ok(fid) => fid,
            Err(e) => {
                self.iput(inode);
                self.sock_destroy(news);
                return Err(e);
            }
        };
        match self.fd_install(fid, false) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                self.file_put(fid);
                Err(e)
            }
        }
    }

    pub fn sys_sendto(
        &self,
        fd: i32,
        data: &[u8],
        to: Option<&SockAddr>,
    ) -> Result<i32> {
        let (s, nonblock) = self.sockfd_lookup(fd)?;
        let n = self.sock_ops(s)?.sendmsg(self, s, data, to, nonblock)?;
        Ok(n as i32)
    }

    pub fn sys_recvfrom(
        &self,
        fd: i32,
        buf: &mut [u8],
        from: Option<&mut SockAddr>,
    ) -> Result<i32> {
        let (s, nonblock) = self.sockfd_lookup(fd)?;
        let n = self.sock_ops(s)?.recvmsg(self, s, buf, from, nonblock)?;
        Ok(n as i32)
    }

    /// Plain read(2)/write(2) on a socket descriptor.
    pub fn sock_read(&self, s: usize, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        self.sock_ops(s)?.recvmsg(self, s, buf, None, nonblock)
    }

    pub fn sock_write(&self, s: usize, data: &[u8], nonblock: bool) -> Result<usize> {
        self.sock_ops(s)?.sendmsg(self, s, data, None, nonblock)
    }

    pub fn sys_shutdown(&self, fd: i32, how: i32) -> Result<i32> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.shutdown(self, s, how)?;
        Ok(0)
    }

    pub fn sys_getsockname(&self, fd: i32) -> Result<SockAddr> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.getsockname(self, s)
    }

    pub fn sys_getpeername(&self, fd: i32) -> Result<SockAddr> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.getpeername(self, s)
    }

    pub fn sys_getsockopt(&self, fd: i32, level: i32, name: i32) -> Result<u32> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.getsockopt(self, s, level, name)
    }

    pub fn sys_setsockopt(&self, fd: i32, level: i32, name: i32, val: u32) -> Result<i32> {
        let (s, _) = self.sockfd_lookup(fd)?;
        self.sock_ops(s)?.setsockopt(self, s, level, name, val)?;
        Ok(0)
    }

    /// Iterate live sockets for /proc/net.
    pub fn sock_for_each(&self, mut f: impl FnMut(usize, u16, u16, &'static str)) {
        let slots = self.sockets.slots.lock();
        for (idx, s) in slots.iter().enumerate() {
            if s.state == SockState::Free {
                continue;
            }
            let state = match s.state {
                SockState::Free => "free",
                SockState::Unconnected => "unconnected",
                SockState::Listening => "listening",
                SockState::Connecting => "connecting",
                SockState::Connected => "connected",
                SockState::Disconnecting => "disconnecting",
                SockState::Dead => "dead",
            };
            f(idx, s.family, s.typ, state);
        }
    }
}
