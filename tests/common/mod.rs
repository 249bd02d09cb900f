//! Shared harness: a booted kernel with a Minix root on a ram disk,
//! a /dev tree and an init task with user memory.
#![allow(dead_code)]

use rux_kernel::{
    dev::{DevT, DISK_MAJOR},
    fs::minix::MinixFs,
    hal::{NullArch, NullVideo, RamDisk},
    kernel::Kernel,
    proc::Pid,
    vm::VmFlags,
};

pub const ROOT_DEV: DevT = DevT::new(DISK_MAJOR, 1);

/// User-space scratch area mapped into every test task.
pub const UBUF: u32 = 0x1000_0000;
pub const UBUF_SIZE: u32 = 0x4_0000;
/// A stack-like region for signal frames.
pub const USTACK_TOP: u32 = 0x2001_0000;

pub fn boot() -> Box<Kernel> {
    boot_sized(4096)
}

/// Boot with a root disk of `nzones` blocks.
pub fn boot_sized(nzones: u32) -> Box<Kernel> {
    let k = Kernel::boot(Box::new(NullVideo), Box::new(NullArch::new()), 1_700_000_000);
    k.disks.register(ROOT_DEV, Box::new(RamDisk::new(nzones)));
    MinixFs::mkfs(&k.disks, ROOT_DEV, 256, nzones).expect("mkfs");
    k.mount_root(ROOT_DEV).expect("mount root");

    k.do_mkdir(rux_kernel::fs::path::AT_FDCWD, b"/dev", rux_kernel::fs::Mode(0o755))
        .expect("mkdir /dev");
    k.init_dev().expect("init /dev");

    let init = spawn_task(&k, b"init");
    k.procs.inner.lock().set_current(init);
    k
}

/// Create a user task with a mapped scratch buffer and stack.
pub fn spawn_task(k: &Kernel, name: &[u8]) -> Pid {
    let pid = k.task_create_user(name).expect("task_create_user");
    k.procs
        .with_task(pid, |t| {
            t.mm
                .map_area(UBUF, UBUF + UBUF_SIZE, VmFlags::READ | VmFlags::WRITE)
                .expect("map scratch");
            t.mm
                .map_area(
                    USTACK_TOP - 0x1_0000,
                    USTACK_TOP,
                    VmFlags::READ | VmFlags::WRITE,
                )
                .expect("map stack");
            t.user_regs.esp = USTACK_TOP - 64;
        })
        .expect("spawn_task");
    pid
}

/// Switch the table's notion of the current task.
pub fn make_current(k: &Kernel, pid: Pid) {
    k.procs.inner.lock().set_current(pid);
}

/// Write a NUL-terminated string into the current task's scratch area.
pub fn put_user_str(k: &Kernel, addr: u32, s: &[u8]) {
    k.procs.with_current(|t| {
        t.mm.copy_out(addr, s).expect("copy_out str");
        t.mm.copy_out(addr + s.len() as u32, &[0]).expect("nul");
    });
}

pub fn read_user(k: &Kernel, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    k.procs.with_current(|t| {
        t.mm.copy_in(addr, &mut buf).expect("copy_in");
    });
    buf
}
