//! Socket system-call marshalling.

use alloc::vec;

use zerocopy::AsBytes;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    net::SockAddr,
};

impl Kernel {
    fn fetch_sockaddr(&self, addr: u32, len: u32) -> Result<SockAddr> {
        if addr == 0 || (len as usize) < 2 {
            return Err(KernelError::InvalidArg);
        }
        let mut out = SockAddr::zeroed();
        let want = (len as usize).min(core::mem::size_of::<SockAddr>());
        let mut raw = vec![0u8; want];
        self.procs.with_current(|t| t.mm.copy_in(addr, &mut raw))?;
        out.as_bytes_mut()[..want].copy_from_slice(&raw);
        Ok(out)
    }

    fn store_sockaddr(&self, sa: &SockAddr, addr: u32, len_addr: u32) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let max = if len_addr != 0 {
            self.procs
                .with_current(|t| t.mm.copy_in_u32(len_addr))? as usize
        } else {
            core::mem::size_of::<SockAddr>()
        };
        let n = max.min(core::mem::size_of::<SockAddr>());
        self.procs
            .with_current(|t| t.mm.copy_out(addr, &sa.as_bytes()[..n]))?;
        if len_addr != 0 {
            self.procs.with_current(|t| {
                t.mm
                    .copy_out_u32(len_addr, core::mem::size_of::<SockAddr>() as u32)
            })?;
        }
        Ok(())
    }

    pub fn sys_bind_user(&self, fd: i32, addr: u32, len: u32) -> Result<i32> {
        let sa = self.fetch_sockaddr(addr, len)?;
        self.sys_bind(fd, &sa)
    }

    pub fn sys_connect_user(&self, fd: i32, addr: u32, len: u32) -> Result<i32> {
        let sa = self.fetch_sockaddr(addr, len)?;
        self.sys_connect(fd, &sa)
    }

    pub fn sys_accept_user(&self, fd: i32, addr: u32, len_addr: u32) -> Result<i32> {
        let mut peer = SockAddr::zeroed();
        let newfd = self.sys_accept(fd, Some(&mut peer))?;
        self.store_sockaddr(&peer, addr, len_addr)?;
        Ok(newfd)
    }

    pub fn sys_sendto_user(
        &self,
        fd: i32,
        buf: u32,
        len: usize,
        dest: u32,
        dest_len: u32,
    ) -> Result<i32> {
        let len = len.min(crate::param::PAGE_SIZE * 16);
        let mut data = vec![0u8; len];
        self.procs.with_current(|t| t.mm.copy_in(buf, &mut data))?;
        let to = if dest != 0 {
            Some(self.fetch_sockaddr(dest, dest_len)?)
        } else {
            None
        };
        self.sys_sendto(fd, &data, to.as_ref())
    }

    pub fn sys_recvfrom_user(
        &self,
        fd: i32,
        buf: u32,
        len: usize,
        src: u32,
        src_len_addr: u32,
    ) -> Result<i32> {
        let len = len.min(crate::param::PAGE_SIZE * 16);
        let mut data = vec![0u8; len];
        let mut from = SockAddr::zeroed();
        let n = self.sys_recvfrom(
            fd,
            &mut data,
            if src != 0 { Some(&mut from) } else { None },
        )?;
        self.procs
            .with_current(|t| t.mm.copy_out(buf, &data[..n as usize]))?;
        if src != 0 {
            self.store_sockaddr(&from, src, src_len_addr)?;
        }
        Ok(n)
    }

    /// sendmsg(2)/recvmsg(2) over the classic msghdr layout; the iovec
    /// list is gathered into one staged buffer.
    fn fetch_iovecs(&self, iov_addr: u32, iovlen: u32) -> Result<alloc::vec::Vec<(u32, u32)>> {
        let mut iovs = alloc::vec::Vec::new();
        for i in 0..iovlen.min(8) {
            let base = self
                .procs
                .with_current(|t| t.mm.copy_in_u32(iov_addr + i * 8))?;
            let len = self
                .procs
                .with_current(|t| t.mm.copy_in_u32(iov_addr + i * 8 + 4))?;
            iovs.push((base, len));
        }
        Ok(iovs)
    }

    pub fn sys_sendmsg_user(&self, fd: i32, msg_addr: u32, _flags: u32) -> Result<i32> {
        let name = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr))?;
        let namelen = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr + 4))?;
        let iov_addr = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr + 8))?;
        let iovlen = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr + 12))?;

        let mut data = vec![];
        for (base, len) in self.fetch_iovecs(iov_addr, iovlen)? {
            let mut chunk = vec![0u8; (len as usize).min(crate::param::PAGE_SIZE * 4)];
            self.procs
                .with_current(|t| t.mm.copy_in(base, &mut chunk))?;
            data.extend_from_slice(&chunk);
        }
        let to = if name != 0 {
            Some(self.fetch_sockaddr(name, namelen)?)
        } else {
            None
        };
        self.sys_sendto(fd, &data, to.as_ref())
    }

    pub fn sys_recvmsg_user(&self, fd: i32, msg_addr: u32, _flags: u32) -> Result<i32> {
        let name = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr))?;
        let iov_addr = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr + 8))?;
        let iovlen = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(msg_addr + 12))?;

        let iovs = self.fetch_iovecs(iov_addr, iovlen)?;
        let total: usize = iovs
            .iter()
            .map(|(_, l)| *l as usize)
            .sum::<usize>()
            .min(crate::param::PAGE_SIZE * 16);
        let mut data = vec![0u8; total];
        let mut from = SockAddr::zeroed();
        let n = self.sys_recvfrom(
            fd,
            &mut data,
            if name != 0 { Some(&mut from) } else { None },
        )? as usize;

        let mut done = 0;
        for (base, len) in iovs {
            if done >= n {
                break;
            }
            let take = (len as usize).min(n - done);
            self.procs
                .with_current(|t| t.mm.copy_out(base, &data[done..done + take]))?;
            done += take;
        }
        if name != 0 {
            self.store_sockaddr(&from, name, 0)?;
        }
        Ok(n as i32)
    }

    pub fn sys_sockname_user(&self, fd: i32, addr: u32, len_addr: u32, peer: bool) -> Result<i32> {
        let sa = if peer {
            self.sys_getpeername(fd)?
        } else {
            self.sys_getsockname(fd)?
        };
        self.store_sockaddr(&sa, addr, len_addr)?;
        Ok(0)
    }

    pub fn sys_getsockopt_user(
        &self,
        fd: i32,
        level: i32,
        name: i32,
        val_addr: u32,
        len_addr: u32,
    ) -> Result<i32> {
        let val = self.sys_getsockopt(fd, level, name)?;
        if val_addr != 0 {
            self.procs
                .with_current(|t| t.mm.copy_out_u32(val_addr, val))?;
        }
        if len_addr != 0 {
            self.procs.with_current(|t| t.mm.copy_out_u32(len_addr, 4))?;
        }
        Ok(0)
    }

    pub fn sys_setsockopt_user(
        &self,
        fd: i32,
        level: i32,
        name: i32,
        val_addr: u32,
        _len: u32,
    ) -> Result<i32> {
        let val = self
            .procs
            .with_current(|t| t.mm.copy_in_u32(val_addr))?;
        self.sys_setsockopt(fd, level, name, val)
    }
}
