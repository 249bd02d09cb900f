//! /proc: read-only views of kernel state.
//!
//! Inode numbers are synthesised: low numbers name the static files,
//! per-task inodes pack the pid above `PID_BASE`. Contents are
//! generated on every read.

use alloc::{format, string::String, vec::Vec};

use crate::{
    error::{KernelError, Result},
    fs::{stat::StatFs, FileSystem, IRef, InodeData, Mode, S_IFDIR, S_IFLNK, S_IFREG},
    kernel::Kernel,
    param::HZ,
    proc::{Pid, TaskState},
};

pub const PROC_SUPER_MAGIC: u32 = 0x9fa0;

const INO_ROOT: u32 = 1;
const INO_UPTIME: u32 = 2;
const INO_MEMINFO: u32 = 3;
const INO_NET: u32 = 4;
const INO_SELF: u32 = 5;

const PID_BASE: u32 = 0x100;
const PID_SLOTS: u32 = 8;

fn pid_dir_ino(pid: Pid) -> u32 {
    PID_BASE + pid as u32 * PID_SLOTS
}

fn ino_pid(ino: u32) -> Option<(Pid, u32)> {
    if ino < PID_BASE {
        return None;
    }
    let rel = ino - PID_BASE;
    Some(((rel / PID_SLOTS) as Pid, rel % PID_SLOTS))
}

fn parse_pid(name: &[u8]) -> Option<Pid> {
    if name.is_empty() || name.len() > 8 {
        return None;
    }
    let mut n: i64 = 0;
    for c in name {
        if !c.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (c - b'0') as i64;
    }
    Some(n as Pid)
}

pub struct ProcFs;

impl ProcFs {
    pub fn new() -> Self {
        Self
    }

    fn generate(&self, k: &Kernel, ino: u32) -> Result<Vec<u8>> {
        let text: String = match ino {
            INO_UPTIME => {
                let j = k.jiffies();
                format!("{}.{:02} 0.00\n", j / HZ, (j % HZ) * 100 / HZ)
            }
            INO_MEMINFO => format!(
                "MemTotal: {} kB\nMemFree: {} kB\n",
                0, 0
            ),
            INO_NET => {
                let mut out = String::from("slot family type state\n");
                k.sock_for_each(|idx, family, typ, state| {
                    out.push_str(&format!("{} {} {} {}\n", idx, family, typ, state));
                });
                out
            }
            _ => match ino_pid(ino) {
                Some((pid, 1)) => {
                    let info = k.procs.with_task(pid, |t| {
                        (
                            t.name,
                            t.state,
                            t.parent,
                            t.pgid,
                            t.uid,
                            t.gid,
                            t.sigpend,
                            t.sigmask,
                        )
                    })?;
                    let (name, state, ppid, pgid, uid, gid, pend, mask) = info;
                    let name_len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
                    format!(
                        "Name:\t{}\nState:\t{}\nPid:\t{}\nPPid:\t{}\nPgid:\t{}\nUid:\t{}\nGid:\t{}\nSigPnd:\t{:08x}\nSigMsk:\t{:08x}\n",
                        core::str::from_utf8(&name[..name_len]).unwrap_or("?"),
                        state_name(state),
                        pid,
                        ppid,
                        pgid,
                        uid,
                        gid,
                        pend,
                        mask,
                    )
                }
                Some((pid, 2)) => {
                    let (state, ppid, pgid, start) = k
                        .procs
                        .with_task(pid, |t| (t.state, t.parent, t.pgid, t.start_time))?;
                    format!(
                        "{} ({}) {} {} {} {}\n",
                        pid,
                        pid,
                        state_letter(state),
                        ppid,
                        pgid,
                        start
                    )
                }
                _ => return Err(KernelError::NoEntry),
            },
        };
        Ok(text.into_bytes())
    }
}

fn state_name(state: TaskState) -> &'static str {
    match state {
        TaskState::RUNNING => "R (running)",
        TaskState::SLEEPING => "S (sleeping)",
        TaskState::STOPPED => "T (stopped)",
        TaskState::ZOMBIE => "Z (zombie)",
        TaskState::TERMINATED => "X (dead)",
    }
}

fn state_letter(state: TaskState) -> char {
    match state {
        TaskState::RUNNING => 'R',
        TaskState::SLEEPING => 'S',
        TaskState::STOPPED => 'T',
        TaskState::ZOMBIE => 'Z',
        TaskState::TERMINATED => 'X',
    }
}

impl FileSystem for ProcFs {
    fn kind(&self) -> &'static str {
        "proc"
    }

    fn magic(&self) -> u32 {
        PROC_SUPER_MAGIC
    }

    fn root_ino(&self) -> u32 {
        INO_ROOT
    }

    fn read_inode(&self, k: &Kernel, ino: u32, d: &mut InodeData) -> Result<()> {
        let now = k.current_time();
        d.uid = 0;
        d.gid = 0;
        d.atime = now;
        d.mtime = now;
        d.ctime = now;
        d.nlinks = 1;
        d.size = 0;
        match ino {
            INO_ROOT => {
                d.mode = Mode(S_IFDIR | 0o555);
                d.nlinks = 2;
            }
            INO_UPTIME | INO_MEMINFO | INO_NET => d.mode = Mode(S_IFREG | 0o444),
            INO_SELF => d.mode = Mode(S_IFLNK | 0o777),
            _ => match ino_pid(ino) {
                Some((pid, 0)) => {
                    if !k.procs.exists(pid) {
                        return Err(KernelError::NoEntry);
                    }
                    d.mode = Mode(S_IFDIR | 0o555);
                    d.nlinks = 2;
                }
                Some((pid, 1)) | Some((pid, 2)) => {
                    if !k.procs.exists(pid) {
                        return Err(KernelError::NoEntry);
                    }
                    d.mode = Mode(S_IFREG | 0o444);
                }
                _ => return Err(KernelError::NoEntry),
            },
        }
        Ok(())
    }

    fn statfs(&self, _k: &Kernel) -> Result<StatFs> {
        Ok(StatFs {
            f_type: PROC_SUPER_MAGIC,
            bsize: crate::param::BLOCK_SIZE as u32,
            namelen: crate::param::MAX_NAME as u32,
            ..StatFs::default()
        })
    }

    fn lookup(&self, k: &Kernel, dir: IRef, name: &[u8]) -> Result<u32> {
        let dir_ino = k.ino_of(dir);
        if name == b"." {
            return Ok(dir_ino);
        }
        match dir_ino {
            INO_ROOT => match name {
                b".." => Ok(INO_ROOT),
                b"uptime" => Ok(INO_UPTIME),
                b"meminfo" => Ok(INO_MEMINFO),
                b"net" => Ok(INO_NET),
                b"self" => Ok(INO_SELF),
                _ => {
                    let pid = parse_pid(name).ok_or(KernelError::NoEntry)?;
                    if k.procs.exists(pid) {
                        Ok(pid_dir_ino(pid))
                    } else {
                        Err(KernelError::NoEntry)
                    }
                }
            },
            _ => match (ino_pid(dir_ino), name) {
                (Some(_), b"..") => Ok(INO_ROOT),
                (Some((pid, 0)), b"status") => Ok(pid_dir_ino(pid) + 1),
                (Some((pid, 0)), b"stat") => Ok(pid_dir_ino(pid) + 2),
                _ => Err(KernelError::NoEntry),
            },
        }
    }

    fn readlink(&self, k: &Kernel, i: IRef, buf: &mut [u8]) -> Result<usize> {
        if k.ino_of(i) != INO_SELF {
            return Err(KernelError::InvalidArg);
        }
        let pid = k.procs.current();
        let text = format!("{}", pid);
        let count = buf.len().min(text.len());
        buf[..count].copy_from_slice(&text.as_bytes()[..count]);
        Ok(count)
    }

    fn read(&self, k: &Kernel, i: IRef, off: u32, buf: &mut [u8]) -> Result<usize> {
        let content = self.generate(k, k.ino_of(i))?;
        let off = off as usize;
        if off >= content.len() {
            return Ok(0);
        }
        let count = buf.len().min(content.len() - off);
        buf[..count].copy_from_slice(&content[off..off + count]);
        Ok(count)
    }

    fn getdents(
        &self,
        k: &Kernel,
        i: IRef,
        pos: u32,
        emit: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
    ) -> Result<u32> {
        let dir_ino = k.ino_of(i);
        let mut entries: Vec<(Vec<u8>, u32)> = Vec::new();
        match dir_ino {
            INO_ROOT => {
                entries.push((b".".to_vec(), INO_ROOT));
                entries.push((b"..".to_vec(), INO_ROOT));
                entries.push((b"uptime".to_vec(), INO_UPTIME));
                entries.push((b"meminfo".to_vec(), INO_MEMINFO));
                entries.push((b"net".to_vec(), INO_NET));
                entries.push((b"self".to_vec(), INO_SELF));
                let pids: Vec<Pid> = {
                    let inner = k.procs.inner.lock();
                    inner.order().to_vec()
                };
                for pid in pids {
                    entries.push((format!("{}", pid).into_bytes(), pid_dir_ino(pid)));
                }
            }
            _ => match ino_pid(dir_ino) {
                Some((pid, 0)) => {
                    entries.push((b".".to_vec(), dir_ino));
                    entries.push((b"..".to_vec(), INO_ROOT));
                    entries.push((b"status".to_vec(), pid_dir_ino(pid) + 1));
                    entries.push((b"stat".to_vec(), pid_dir_ino(pid) + 2));
                }
                _ => return Err(KernelError::NotDir),
            },
        }

        let mut index = pos;
        while (index as usize) < entries.len() {
            let (name, ino) = &entries[index as usize];
            index += 1;
            if !emit(*ino, 0, name) {
                break;
            }
        }
        Ok(index)
    }
}
