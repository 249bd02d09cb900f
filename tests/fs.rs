//! VFS and Minix driver behavior over a ram-disk root.

mod common;

use common::{boot, boot_sized, ROOT_DEV};
use rux_kernel::{
    error::KernelError,
    file::{OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET},
    fs::{minix::MAX_FILE_BLOCKS, path::AT_FDCWD, Mode},
    param::{BLOCK_SIZE, NR_BUFFER, NR_OPEN},
};

fn o(bits: u32) -> OpenFlags {
    OpenFlags::from_bits_truncate(bits)
}

const O_RDWR: u32 = 0o2;
const O_RDONLY: u32 = 0;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;

#[test]
fn create_write_read_round_trip() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/hello.txt", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    assert_eq!(k.file_write(fid, b"hello kernel").unwrap(), 12);

    k.file_lseek(fid, 0, SEEK_SET).unwrap();
    let mut buf = [0u8; 32];
    let n = k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello kernel");
    k.do_close(fd).unwrap();

    // Still there through a fresh open.
    let fd = k.do_open(AT_FDCWD, b"/hello.txt", o(O_RDONLY), Mode(0)).unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let n = k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello kernel");
    k.do_close(fd).unwrap();
}

#[test]
fn open_creat_respects_umask() {
    let k = boot();
    k.procs.with_current(|t| t.fs.umask = 0o027);
    let fd = k
        .do_open(AT_FDCWD, b"/masked", o(O_RDWR | O_CREAT), Mode(0o666))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let inode = k.with_file(fid, |f| f.inode).unwrap();
    let mode = k.with_inode(inode, |d| d.mode);
    assert_eq!(mode.perms(), 0o640);
    k.do_close(fd).unwrap();
}

#[test]
fn exclusive_create_fails_on_existing() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/x", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    k.do_close(fd).unwrap();
    assert_eq!(
        k.do_open(AT_FDCWD, b"/x", o(O_RDWR | O_CREAT | O_EXCL), Mode(0o644)),
        Err(KernelError::Exists)
    );
}

#[test]
fn truncate_on_open_resets_size() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/t", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, &[7u8; 3000]).unwrap();
    k.do_close(fd).unwrap();

    let fd = k
        .do_open(AT_FDCWD, b"/t", o(O_RDWR | O_TRUNC), Mode(0))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let inode = k.with_file(fid, |f| f.inode).unwrap();
    assert_eq!(k.with_inode(inode, |d| d.size), 0);
    assert_eq!(k.file_lseek(fid, 0, SEEK_END).unwrap(), 0);
    k.do_close(fd).unwrap();
}

#[test]
fn too_many_open_files_reports_emfile() {
    let k = boot();
    let mut fds = Vec::new();
    for _ in 0..NR_OPEN {
        fds.push(
            k.do_open(AT_FDCWD, b"/dev/null", o(O_RDONLY), Mode(0))
                .unwrap(),
        );
    }
    assert_eq!(
        k.do_open(AT_FDCWD, b"/dev/null", o(O_RDONLY), Mode(0)),
        Err(KernelError::TooManyOpen)
    );
    for fd in fds {
        k.do_close(fd).unwrap();
    }
}

#[test]
fn dup_shares_the_open_description() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/d", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, b"abcdef").unwrap();

    let dup = k.do_dup(fd, 0).unwrap();
    assert_ne!(dup, fd);
    let dup_fid = k.fd_to_file(dup).unwrap();
    assert_eq!(dup_fid, fid);
    assert_eq!(k.ftable.refs(fid), 2);

    // Shared offset: seek through one, read through the other.
    k.file_lseek(fid, 2, SEEK_SET).unwrap();
    let mut buf = [0u8; 2];
    k.file_read(dup_fid, &mut buf).unwrap();
    assert_eq!(&buf, b"cd");

    k.do_close(fd).unwrap();
    assert_eq!(k.ftable.refs(fid), 1);
    k.do_close(dup).unwrap();
}

#[test]
fn dup2_closes_the_target_slot() {
    let k = boot();
    let a = k
        .do_open(AT_FDCWD, b"/dev/null", o(O_RDONLY), Mode(0))
        .unwrap();
    let b = k
        .do_open(AT_FDCWD, b"/dev/zero", o(O_RDONLY), Mode(0))
        .unwrap();
    let a_fid = k.fd_to_file(a).unwrap();
    assert_eq!(k.do_dup2(a, b, false).unwrap(), b);
    assert_eq!(k.fd_to_file(b).unwrap(), a_fid);
    assert_eq!(k.ftable.refs(a_fid), 2);
    k.do_close(a).unwrap();
    k.do_close(b).unwrap();
}

#[test]
fn lseek_bounds() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/s", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    assert_eq!(k.file_lseek(fid, 0, SEEK_END).unwrap(), 0);
    assert_eq!(k.file_lseek(fid, -1, SEEK_CUR), Err(KernelError::Range));
    assert_eq!(k.file_lseek(fid, 100, SEEK_SET).unwrap(), 100);
    assert_eq!(k.file_lseek(fid, 0, 99), Err(KernelError::InvalidArg));
    k.do_close(fd).unwrap();
}

#[test]
fn unlink_removes_and_double_unlink_fails() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/gone", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    k.do_close(fd).unwrap();
    k.do_unlink(AT_FDCWD, b"/gone").unwrap();
    assert_eq!(
        k.do_open(AT_FDCWD, b"/gone", o(O_RDONLY), Mode(0)),
        Err(KernelError::NoEntry)
    );
    assert_eq!(k.do_unlink(AT_FDCWD, b"/gone"), Err(KernelError::NoEntry));
}

#[test]
fn unlinked_open_file_stays_readable_until_close() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/tmpfile", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, b"still here").unwrap();
    k.do_unlink(AT_FDCWD, b"/tmpfile").unwrap();

    k.file_lseek(fid, 0, SEEK_SET).unwrap();
    let mut buf = [0u8; 16];
    let n = k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here");
    k.do_close(fd).unwrap();
}

#[test]
fn mkdir_rmdir_and_not_empty() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/a", Mode(0o755)).unwrap();
    k.do_mkdir(AT_FDCWD, b"/a/b", Mode(0o755)).unwrap();
    assert_eq!(k.do_rmdir(AT_FDCWD, b"/a"), Err(KernelError::NotEmpty));
    k.do_rmdir(AT_FDCWD, b"/a/b").unwrap();
    k.do_rmdir(AT_FDCWD, b"/a").unwrap();
    assert_eq!(k.do_rmdir(AT_FDCWD, b"/a"), Err(KernelError::NoEntry));
}

#[test]
fn hard_link_shares_the_inode() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/orig", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, b"linked").unwrap();
    k.do_close(fd).unwrap();

    k.do_link(AT_FDCWD, b"/orig", AT_FDCWD, b"/alias").unwrap();
    let orig = k.namei(AT_FDCWD, b"/orig", true).unwrap();
    let alias = k.namei(AT_FDCWD, b"/alias", true).unwrap();
    assert_eq!(orig, alias);
    assert_eq!(k.with_inode(orig, |d| d.nlinks), 2);
    k.iput(orig);
    k.iput(alias);

    // Dropping one name keeps the data reachable through the other.
    k.do_unlink(AT_FDCWD, b"/orig").unwrap();
    let fd = k.do_open(AT_FDCWD, b"/alias", o(O_RDONLY), Mode(0)).unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let mut buf = [0u8; 8];
    let n = k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"linked");
    k.do_close(fd).unwrap();
}

#[test]
fn symlink_resolution_and_nofollow() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/target", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    k.do_close(fd).unwrap();
    k.do_symlink(b"/target", AT_FDCWD, b"/ln").unwrap();

    let through = k.namei(AT_FDCWD, b"/ln", true).unwrap();
    let direct = k.namei(AT_FDCWD, b"/target", true).unwrap();
    assert_eq!(through, direct);
    k.iput(through);
    k.iput(direct);

    let raw = k.namei(AT_FDCWD, b"/ln", false).unwrap();
    assert!(k.with_inode(raw, |d| d.mode.is_lnk()));
    let mut buf = [0u8; 64];
    let n = k.do_readlink(AT_FDCWD, b"/ln", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"/target");
    k.iput(raw);
}

#[test]
fn symlink_loops_are_bounded() {
    let k = boot();
    k.do_symlink(b"/loop-b", AT_FDCWD, b"/loop-a").unwrap();
    k.do_symlink(b"/loop-a", AT_FDCWD, b"/loop-b").unwrap();
    assert_eq!(
        k.namei(AT_FDCWD, b"/loop-a", true),
        Err(KernelError::Loop)
    );
}

#[test]
fn iget_twice_returns_the_same_slot() {
    let k = boot();
    let a = k.namei(AT_FDCWD, b"/", true).unwrap();
    let b = k.namei(AT_FDCWD, b"/", true).unwrap();
    assert_eq!(a, b);
    let before = k.icache.refs(a);
    k.iput(b);
    assert_eq!(k.icache.refs(a), before - 1);
    k.iput(a);
}

#[test]
fn bmap_create_is_idempotent() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/bm", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let inode = k.with_file(fid, |f| f.inode).unwrap();
    let fs = k.fs_of(0).unwrap();

    let first = fs.bmap(&k, inode, 3, true).unwrap();
    assert_ne!(first, 0);
    let again = fs.bmap(&k, inode, 3, true).unwrap();
    assert_eq!(first, again);

    // Absent block without create stays absent.
    assert_eq!(fs.bmap(&k, inode, 100, false).unwrap(), 0);
    // Beyond the double-indirect map there is nothing.
    assert_eq!(fs.bmap(&k, inode, MAX_FILE_BLOCKS, true).unwrap(), 0);
    k.do_close(fd).unwrap();
}

#[test]
fn file_contents_survive_the_indirect_boundaries() {
    let k = boot_sized(4096);
    let fd = k
        .do_open(AT_FDCWD, b"/big", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();

    // Straddle direct -> single indirect (block 7) and single ->
    // double indirect (block 519).
    for boundary in [7u32, 7 + 512] {
        let off = boundary * BLOCK_SIZE as u32 - 3;
        k.file_lseek(fid, off as i32, SEEK_SET).unwrap();
        assert_eq!(k.file_write(fid, b"boundary!").unwrap(), 9);
        k.file_lseek(fid, off as i32, SEEK_SET).unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(k.file_read(fid, &mut buf).unwrap(), 9);
        assert_eq!(&buf, b"boundary!");
    }

    // A hole in the middle reads back as zeroes.
    k.file_lseek(fid, 2 * BLOCK_SIZE as i32, SEEK_SET).unwrap();
    let mut buf = [0xffu8; 16];
    assert_eq!(k.file_read(fid, &mut buf).unwrap(), 16);
    assert_eq!(buf, [0u8; 16]);
    k.do_close(fd).unwrap();
}

#[test]
fn write_crossing_the_size_limit_reports_no_space() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/limit", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let max = MAX_FILE_BLOCKS * BLOCK_SIZE as u32;
    k.file_lseek(fid, (max - 2) as i32, SEEK_SET).unwrap();
    assert_eq!(k.file_write(fid, b"xxxx"), Err(KernelError::NoSpace));
    k.do_close(fd).unwrap();
}

#[test]
fn buffer_eviction_rereads_from_disk() {
    let k = boot();
    // Touch one block, then cycle more distinct blocks than the cache
    // holds; the first must be evicted and read back afresh.
    let first = k.bcache.bread(&k.disks, ROOT_DEV, 100).unwrap();
    k.bcache.brelse(&k.disks, first);
    for blk in 200..200 + NR_BUFFER as u32 {
        let b = k.bcache.bread(&k.disks, ROOT_DEV, blk).unwrap();
        k.bcache.brelse(&k.disks, b);
    }
    assert!(!k.bcache.resident(ROOT_DEV, 100));
    let again = k.bcache.bread(&k.disks, ROOT_DEV, 100).unwrap();
    assert_eq!(k.bcache.refcnt(again), 1);
    k.bcache.brelse(&k.disks, again);
}

#[test]
fn getdents_lists_created_entries() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/list", Mode(0o755)).unwrap();
    for name in [&b"/list/one"[..], b"/list/two"] {
        let fd = k
            .do_open(AT_FDCWD, name, o(O_RDWR | O_CREAT), Mode(0o644))
            .unwrap();
        k.do_close(fd).unwrap();
    }

    let dir = k.namei(AT_FDCWD, b"/list", true).unwrap();
    let fs = k.fs_of(0).unwrap();
    let mut names: Vec<Vec<u8>> = Vec::new();
    fs.getdents(&k, dir, 0, &mut |_ino, _t, name| {
        names.push(name.to_vec());
        true
    })
    .unwrap();
    k.iput(dir);

    assert!(names.contains(&b".".to_vec()));
    assert!(names.contains(&b"..".to_vec()));
    assert!(names.contains(&b"one".to_vec()));
    assert!(names.contains(&b"two".to_vec()));
}

#[test]
fn rename_moves_between_directories() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/from", Mode(0o755)).unwrap();
    k.do_mkdir(AT_FDCWD, b"/to", Mode(0o755)).unwrap();
    let fd = k
        .do_open(AT_FDCWD, b"/from/f", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    k.do_close(fd).unwrap();

    k.do_rename(AT_FDCWD, b"/from/f", AT_FDCWD, b"/to/g").unwrap();
    assert_eq!(
        k.namei(AT_FDCWD, b"/from/f", true),
        Err(KernelError::NoEntry)
    );
    let moved = k.namei(AT_FDCWD, b"/to/g", true).unwrap();
    k.iput(moved);
}

#[test]
fn chdir_and_getcwd() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/work", Mode(0o755)).unwrap();
    k.do_mkdir(AT_FDCWD, b"/work/sub", Mode(0o755)).unwrap();
    k.do_chdir(b"/work/sub").unwrap();

    let mut buf = [0u8; 64];
    let n = k.do_getcwd(&mut buf).unwrap();
    assert_eq!(&buf[..n - 1], b"/work/sub");

    // Relative resolution now starts at the new cwd.
    let fd = k
        .do_open(AT_FDCWD, b"here", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    k.do_close(fd).unwrap();
    let found = k.namei(AT_FDCWD, b"/work/sub/here", true).unwrap();
    k.iput(found);
}

#[test]
fn mount_crossing_and_umount() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/mnt", Mode(0o755)).unwrap();
    k.do_mount(b"", b"/mnt", b"tmpfs").unwrap();

    let fd = k
        .do_open(AT_FDCWD, b"/mnt/inside", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, b"tmp data").unwrap();
    k.file_lseek(fid, 0, SEEK_SET).unwrap();
    let mut buf = [0u8; 8];
    k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf, b"tmp data");
    k.do_close(fd).unwrap();

    // The mounted root hides the underlying directory.
    let inside = k.namei(AT_FDCWD, b"/mnt", true).unwrap();
    let root0 = k.root_inode().unwrap();
    assert_ne!(inside, root0);
    k.iput(inside);

    k.do_umount(b"/mnt").unwrap();
    assert_eq!(
        k.namei(AT_FDCWD, b"/mnt/inside", true),
        Err(KernelError::NoEntry)
    );
}

#[test]
fn procfs_reports_uptime() {
    let k = boot();
    k.do_mkdir(AT_FDCWD, b"/proc", Mode(0o555)).unwrap();
    k.do_mount(b"", b"/proc", b"proc").unwrap();

    for _ in 0..250 {
        k.tick();
    }
    let fd = k
        .do_open(AT_FDCWD, b"/proc/uptime", o(O_RDONLY), Mode(0))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let mut buf = [0u8; 32];
    let n = k.file_read(fid, &mut buf).unwrap();
    let text = core::str::from_utf8(&buf[..n]).unwrap();
    assert!(text.starts_with("2.50"), "uptime was {:?}", text);
    k.do_close(fd).unwrap();
}

#[test]
fn statfs_reports_minix_magic() {
    let k = boot();
    let fs = k.fs_of(0).unwrap();
    let st = fs.statfs(&k).unwrap();
    assert_eq!(st.f_type, 0x138f);
    assert_eq!(st.bsize, BLOCK_SIZE as u32);
    assert!(st.bfree > 0);
}

#[test]
fn stat_reflects_size_and_mode() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/st", o(O_RDWR | O_CREAT), Mode(0o640))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, &[1u8; 1500]).unwrap();
    let inode = k.with_file(fid, |f| f.inode).unwrap();
    let st = k.stat_inode(inode);
    assert_eq!(st.size, 1500);
    assert_eq!(st.mode & 0o777, 0o640);
    assert!(st.mode().is_reg());
    assert_eq!(st.blocks, 2);
    k.do_close(fd).unwrap();
}

#[test]
fn data_survives_sync_and_remount() {
    let k = boot();
    let fd = k
        .do_open(AT_FDCWD, b"/persist", o(O_RDWR | O_CREAT), Mode(0o644))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    k.file_write(fid, b"durable").unwrap();
    k.do_close(fd).unwrap();
    k.sync_all();

    // Push everything out of the block cache and re-read through it.
    for blk in 300..300 + NR_BUFFER as u32 {
        let b = k.bcache.bread(&k.disks, ROOT_DEV, blk).unwrap();
        k.bcache.brelse(&k.disks, b);
    }
    let fd = k
        .do_open(AT_FDCWD, b"/persist", o(O_RDONLY), Mode(0))
        .unwrap();
    let fid = k.fd_to_file(fd).unwrap();
    let mut buf = [0u8; 7];
    k.file_read(fid, &mut buf).unwrap();
    assert_eq!(&buf, b"durable");
    k.do_close(fd).unwrap();
}
