//! Loopback socket layer.

mod common;

use common::boot;
use rux_kernel::{
    error::KernelError,
    net::{SockAddr, AF_INET, AF_UNIX, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_TYPE},
};

fn addr(name: &[u8]) -> SockAddr {
    let mut sa = SockAddr::zeroed();
    sa.family = AF_UNIX;
    sa.data[..name.len()].copy_from_slice(name);
    sa
}

#[test]
fn unknown_family_is_rejected() {
    let k = boot();
    assert_eq!(
        k.sys_socket(AF_INET as i32 + 5, SOCK_DGRAM as i32, 0),
        Err(KernelError::InvalidArg)
    );
}

#[test]
fn datagram_round_trip_with_addresses() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    let b = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    k.sys_bind(a, &addr(b"sock-a")).unwrap();
    k.sys_bind(b, &addr(b"sock-b")).unwrap();

    assert_eq!(
        k.sys_sendto(a, b"ping", Some(&addr(b"sock-b"))).unwrap(),
        4
    );

    let mut buf = [0u8; 16];
    let mut from = SockAddr::zeroed();
    let n = k.sys_recvfrom(b, &mut buf, Some(&mut from)).unwrap();
    assert_eq!(&buf[..n as usize], b"ping");
    assert_eq!(from.path(), b"sock-a");
}

#[test]
fn datagrams_preserve_message_boundaries() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    let b = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    k.sys_bind(b, &addr(b"dst")).unwrap();
    k.sys_connect(a, &addr(b"dst")).unwrap();

    k.sys_sendto(a, b"first", None).unwrap();
    k.sys_sendto(a, b"second", None).unwrap();

    let mut buf = [0u8; 3];
    // A short read truncates the datagram rather than merging them.
    assert_eq!(k.sys_recvfrom(b, &mut buf, None).unwrap(), 3);
    assert_eq!(&buf, b"fir");
    let mut buf2 = [0u8; 16];
    let n = k.sys_recvfrom(b, &mut buf2, None).unwrap();
    assert_eq!(&buf2[..n as usize], b"second");
}

#[test]
fn duplicate_bind_is_refused() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    let b = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    k.sys_bind(a, &addr(b"taken")).unwrap();
    assert_eq!(k.sys_bind(b, &addr(b"taken")), Err(KernelError::Exists));
}

#[test]
fn stream_connect_accept_and_data() {
    let k = boot();
    let server = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    k.sys_bind(server, &addr(b"srv")).unwrap();
    k.sys_listen(server, 4).unwrap();

    let client = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    // Single task: queue the connection without blocking, then accept.
    {
        let fid = k.fd_to_file(client).unwrap();
        k.with_file(fid, |f| f.flags |= rux_kernel::file::OpenFlags::O_NONBLOCK)
            .unwrap();
    }
    assert_eq!(
        k.sys_connect(client, &addr(b"srv")),
        Err(KernelError::WouldBlock)
    );

    let conn = k.sys_accept(server, None).unwrap();

    // The handshake completed for the client side too.
    let (csock, _) = k.sockfd_lookup(client).unwrap();
    assert_eq!(
        k.with_sock(csock, |s| s.state),
        rux_kernel::net::SockState::Connected
    );

    // Data flows both ways, stream style.
    k.sys_sendto(client, b"hello ", None).unwrap();
    k.sys_sendto(client, b"world", None).unwrap();
    let mut buf = [0u8; 16];
    let n = k.sys_recvfrom(conn, &mut buf, None).unwrap();
    assert_eq!(&buf[..n as usize], b"hello world");

    k.sys_sendto(conn, b"ack", None).unwrap();
    let n = k.sys_recvfrom(client, &mut buf, None).unwrap();
    assert_eq!(&buf[..n as usize], b"ack");
}

#[test]
fn accept_inherits_family_and_type() {
    let k = boot();
    let server = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    k.sys_bind(server, &addr(b"inh")).unwrap();
    k.sys_listen(server, 1).unwrap();

    let client = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    let fid = k.fd_to_file(client).unwrap();
    k.with_file(fid, |f| f.flags |= rux_kernel::file::OpenFlags::O_NONBLOCK)
        .unwrap();
    let _ = k.sys_connect(client, &addr(b"inh"));
    let conn = k.sys_accept(server, None).unwrap();

    assert_eq!(k.sys_getsockopt(conn, SOL_SOCKET, SO_TYPE).unwrap(), SOCK_STREAM as u32);
    let name = k.sys_getsockname(conn).unwrap();
    assert_eq!(name.path(), b"inh");
}

#[test]
fn shutdown_wakes_readers_with_eof() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    k.sys_bind(a, &addr(b"shut")).unwrap();
    k.sys_shutdown(a, 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(k.sys_recvfrom(a, &mut buf, None).unwrap(), 0);
}

#[test]
fn closing_a_peer_ends_the_stream() {
    let k = boot();
    let server = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    k.sys_bind(server, &addr(b"bye")).unwrap();
    k.sys_listen(server, 1).unwrap();
    let client = k.sys_socket(AF_UNIX as i32, SOCK_STREAM as i32, 0).unwrap();
    let fid = k.fd_to_file(client).unwrap();
    k.with_file(fid, |f| f.flags |= rux_kernel::file::OpenFlags::O_NONBLOCK)
        .unwrap();
    let _ = k.sys_connect(client, &addr(b"bye"));
    let conn = k.sys_accept(server, None).unwrap();

    k.do_close(conn).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(k.sys_recvfrom(client, &mut buf, None).unwrap(), 0);
}

#[test]
fn socket_inode_binding_is_unique() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    let b = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();

    let (sa, _) = k.sockfd_lookup(a).unwrap();
    let (sb, _) = k.sockfd_lookup(b).unwrap();
    assert_ne!(sa, sb);

    let ia = k.with_sock(sa, |s| s.inode).unwrap();
    let ib = k.with_sock(sb, |s| s.inode).unwrap();
    assert_ne!(ia, ib);
    assert_eq!(k.sock_lookup(ia).unwrap(), sa);
    assert_eq!(k.sock_lookup(ib).unwrap(), sb);

    let mut live = 0;
    k.sock_for_each(|_, family, _, _| {
        assert_eq!(family, AF_UNIX);
        live += 1;
    });
    assert_eq!(live, 2);
}

#[test]
fn plain_read_write_work_on_connected_sockets() {
    let k = boot();
    let a = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    let b = k.sys_socket(AF_UNIX as i32, SOCK_DGRAM as i32, 0).unwrap();
    k.sys_bind(a, &addr(b"ra")).unwrap();
    k.sys_bind(b, &addr(b"rb")).unwrap();
    k.sys_connect(a, &addr(b"rb")).unwrap();
    k.sys_connect(b, &addr(b"ra")).unwrap();

    let fa = k.fd_to_file(a).unwrap();
    let fb = k.fd_to_file(b).unwrap();
    assert_eq!(k.file_write(fa, b"via write").unwrap(), 9);
    let mut buf = [0u8; 16];
    let n = k.file_read(fb, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"via write");
}

#[test]
fn descriptor_that_is_not_a_socket_is_rejected() {
    let k = boot();
    let fd = k
        .do_open(
            rux_kernel::fs::path::AT_FDCWD,
            b"/dev/null",
            rux_kernel::file::OpenFlags::from_bits_truncate(0o2),
            rux_kernel::fs::Mode(0),
        )
        .unwrap();
    assert_eq!(k.sys_listen(fd, 1), Err(KernelError::NotSocket));
}
