//! Dispatch, argument marshalling and errno translation.

mod common;

use std::convert::TryInto;

use common::{boot, put_user_str, read_user, UBUF};
use rux_kernel::{
    proc::UserRegs,
    syscall::{
        SYS_CLOCK_GETTIME64, SYS_GETPID, SYS_GETRANDOM, SYS_OPEN, SYS_READ, SYS_UNAME,
        SYS_WRITE,
    },
    vm::PAGE_SIZE_U32,
};

fn call(k: &rux_kernel::kernel::Kernel, num: u32, args: [u32; 5]) -> i32 {
    let mut regs = UserRegs {
        eax: num,
        ebx: args[0],
        ecx: args[1],
        edx: args[2],
        esi: args[3],
        edi: args[4],
        esp: common::USTACK_TOP - 64,
        ..UserRegs::default()
    };
    k.syscall(&mut regs);
    regs.eax as i32
}

#[test]
fn unknown_numbers_return_enosys() {
    let k = boot();
    assert_eq!(call(&k, 9999, [0; 5]), -38);
}

#[test]
fn errors_come_back_negated() {
    let k = boot();
    put_user_str(&k, UBUF, b"/no/such/file");
    assert_eq!(call(&k, SYS_OPEN, [UBUF, 0, 0, 0, 0]), -2);
}

#[test]
fn getpid_reports_the_current_task() {
    let k = boot();
    let pid = k.procs.current();
    assert_eq!(call(&k, SYS_GETPID, [0; 5]), pid);
}

#[test]
fn open_write_read_through_user_memory() {
    let k = boot();
    put_user_str(&k, UBUF, b"/file");
    let fd = call(&k, SYS_OPEN, [UBUF, 0o102, 0o644, 0, 0]);
    assert!(fd >= 0);

    let data_addr = UBUF + 0x100;
    k.procs
        .with_current(|t| t.mm.copy_out(data_addr, b"through the trap").unwrap());
    assert_eq!(call(&k, SYS_WRITE, [fd as u32, data_addr, 16, 0, 0]), 16);

    // Rewind through a fresh open and read it back into user memory.
    let fd2 = call(&k, SYS_OPEN, [UBUF, 0, 0, 0, 0]);
    let out_addr = UBUF + 0x200;
    assert_eq!(call(&k, SYS_READ, [fd2 as u32, out_addr, 16, 0, 0]), 16);
    assert_eq!(read_user(&k, out_addr, 16), b"through the trap");
}

#[test]
fn bad_user_pointers_fault_cleanly() {
    let k = boot();
    put_user_str(&k, UBUF, b"/f2");
    let fd = call(&k, SYS_OPEN, [UBUF, 0o102, 0o644, 0, 0]);
    // Writing from an unmapped source address is EFAULT, not a panic.
    assert_eq!(call(&k, SYS_WRITE, [fd as u32, 0x0666_0000, 8, 0, 0]), -14);
}

#[test]
fn uname_fills_the_utsname_fields() {
    let k = boot();
    assert_eq!(call(&k, SYS_UNAME, [UBUF, 0, 0, 0, 0]), 0);
    let sysname = read_user(&k, UBUF, 3);
    assert_eq!(&sysname, b"rux");
    let machine = read_user(&k, UBUF + 65 * 4, 3);
    assert_eq!(&machine, b"x86");
}

#[test]
fn getrandom_fills_and_varies() {
    let k = boot();
    assert_eq!(call(&k, SYS_GETRANDOM, [UBUF, 16, 0, 0, 0]), 16);
    let first = read_user(&k, UBUF, 16);
    assert_eq!(call(&k, SYS_GETRANDOM, [UBUF, 16, 0, 0, 0]), 16);
    let second = read_user(&k, UBUF, 16);
    assert_ne!(first, second);
    assert_ne!(first, vec![0u8; 16]);
}

#[test]
fn clock_gettime_monotonic_follows_jiffies() {
    let k = boot();
    for _ in 0..150 {
        k.tick();
    }
    assert_eq!(call(&k, SYS_CLOCK_GETTIME64, [1, UBUF, 0, 0, 0]), 0);
    let raw = read_user(&k, UBUF, 8);
    let sec = u64::from_le_bytes(raw.try_into().unwrap());
    assert_eq!(sec, 1);
}

#[test]
fn brk_and_mmap_manage_the_address_space() {
    let k = boot();
    k.procs.with_current(|t| {
        t.mm.start_brk = 0x0900_0000;
        t.mm.brk = 0x0900_0000;
    });
    assert_eq!(k.sys_brk(0).unwrap(), 0x0900_0000);
    assert_eq!(k.sys_brk(0x0900_4000).unwrap(), 0x0900_4000);

    let addr = k.sys_mmap(0, 3 * PAGE_SIZE_U32, 3, 0x22, -1).unwrap() as u32;
    assert_eq!(addr % PAGE_SIZE_U32, 0);
    k.procs.with_current(|t| {
        t.mm.copy_out(addr, b"mapped").unwrap();
        let mut buf = [0u8; 6];
        t.mm.copy_in(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");
    });
    assert_eq!(k.sys_munmap(addr, 3 * PAGE_SIZE_U32).unwrap(), 0);
    let fault = k
        .procs
        .with_current(|t| t.mm.copy_in(addr, &mut [0u8; 1]));
    assert!(fault.is_err());
}

#[test]
fn umask_round_trips() {
    let k = boot();
    assert_eq!(k.sys_umask(0o077).unwrap(), 0o022);
    assert_eq!(k.sys_umask(0o022).unwrap(), 0o077);
}

#[test]
fn pipe_syscall_writes_both_descriptors() {
    let k = boot();
    let ret = call(&k, rux_kernel::syscall::SYS_PIPE, [UBUF, 0, 0, 0, 0]);
    assert_eq!(ret, 0);
    let raw = read_user(&k, UBUF, 8);
    let rfd = i32::from_le_bytes(raw[0..4].try_into().unwrap());
    let wfd = i32::from_le_bytes(raw[4..8].try_into().unwrap());
    assert!(rfd >= 0 && wfd >= 0 && rfd != wfd);
}

#[test]
fn sysinfo_reports_uptime_seconds() {
    let k = boot();
    for _ in 0..320 {
        k.tick();
    }
    assert_eq!(call(&k, rux_kernel::syscall::SYS_SYSINFO, [UBUF, 0, 0, 0, 0]), 0);
    let raw = read_user(&k, UBUF, 4);
    assert_eq!(u32::from_le_bytes(raw.try_into().unwrap()), 3);
}

#[test]
fn prlimit_reports_the_fd_table_size() {
    let k = boot();
    assert_eq!(
        call(&k, rux_kernel::syscall::SYS_PRLIMIT64, [0, 7, 0, UBUF, 0]),
        0
    );
    let raw = read_user(&k, UBUF, 8);
    let cur = u64::from_le_bytes(raw.try_into().unwrap());
    assert_eq!(cur, 32);
}
