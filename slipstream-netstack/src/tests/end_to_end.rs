//! End-to-end tests: device packets through the real TUN plumbing, the
//! engine and an in-process relay.
//!
//! A Unix datagram socketpair stands in for the TUN fd. The test plays the
//! device role on one end while the supervisor runs the full stack on the
//! other.

use crate::packet::{build_ipv4_tcp, parse_packet, TcpFlags, Transport};
use crate::supervisor::{Supervisor, SupervisorState};
use async_trait::async_trait;
use slipstream_core::testing::MockRelay;
use slipstream_core::{ConfigFile, Result as CoreResult, SecureSession, SessionConnector};
use std::net::Ipv4Addr;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixDatagram;

const DEVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PEER: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

struct MockConnector {
    relay: MockRelay,
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self) -> CoreResult<SecureSession> {
        self.relay.dial().await
    }
}

fn test_config() -> slipstream_core::ProxyConfig {
    ConfigFile {
        sni_host: "cdn.example.com".to_string(),
        relay_address: "127.0.0.1".to_string(),
        relay_port: 443,
        ws_path: "/tunnel".to_string(),
        psk: "00".repeat(32),
        verify_certificates: false,
        upstream_dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
        log_level: "info".to_string(),
    }
    .into_proxy_config()
    .unwrap()
}

/// Device side of the fake TUN: a datagram socket preserving packet
/// boundaries.
fn host_socket(fd: i32) -> UnixDatagram {
    let sock = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(fd) };
    sock.set_nonblocking(true).unwrap();
    UnixDatagram::from_std(sock).unwrap()
}

fn tun_fd_pair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

async fn recv_tcp(host: &UnixDatagram) -> (TcpFlags, u32, u32, Vec<u8>) {
    let mut buf = vec![0u8; 2000];
    let n = tokio::time::timeout(Duration::from_secs(5), host.recv(&mut buf))
        .await
        .expect("no packet from the stack")
        .unwrap();
    let parsed = parse_packet(&buf[..n]).unwrap();
    assert_eq!(parsed.src_addr, PEER);
    assert_eq!(parsed.dst_addr, DEVICE);
    match parsed.transport {
        Transport::Tcp(seg) => (seg.flags, seg.seq, seg.ack, seg.payload.to_vec()),
        other => panic!("expected TCP, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_flow_through_tun() {
    let relay = MockRelay::spawn([0u8; 32], MockRelay::connect_behavior(0x00)).await;
    let mut supervisor =
        Supervisor::with_connector(test_config(), Arc::new(MockConnector { relay }));

    let (device_fd, host_fd) = tun_fd_pair();
    supervisor.start(device_fd).await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    let host = host_socket(host_fd);

    // Device opens a connection to 1.2.3.4:443.
    let syn = TcpFlags {
        syn: true,
        ..Default::default()
    };
    host.send(&build_ipv4_tcp(DEVICE, PEER, 40000, 443, 5000, 0, syn, &[]))
        .await
        .unwrap();

    let (flags, isn, ack, _) = recv_tcp(&host).await;
    assert!(flags.syn && flags.ack);
    assert_eq!(ack, 5001);

    host.send(&build_ipv4_tcp(
        DEVICE,
        PEER,
        40000,
        443,
        5001,
        isn.wrapping_add(1),
        TcpFlags::ack_only(),
        &[],
    ))
    .await
    .unwrap();

    // Payload goes out through the relay; the mock echoes it back.
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    host.send(&build_ipv4_tcp(
        DEVICE,
        PEER,
        40000,
        443,
        5001,
        isn.wrapping_add(1),
        TcpFlags::psh_ack(),
        request,
    ))
    .await
    .unwrap();

    let mut saw_ack = false;
    let mut echoed = Vec::new();
    while !(saw_ack && echoed.len() >= request.len()) {
        let (flags, _seq, ack, data) = recv_tcp(&host).await;
        assert_eq!(ack, 5001 + request.len() as u32);
        if data.is_empty() {
            assert!(flags.ack);
            saw_ack = true;
        } else {
            assert!(flags.psh && flags.ack);
            echoed.extend_from_slice(&data);
        }
    }
    assert_eq!(echoed, request);

    // Device closes; the stack acknowledges and sends its own FIN.
    host.send(&build_ipv4_tcp(
        DEVICE,
        PEER,
        40000,
        443,
        5001 + request.len() as u32,
        0,
        TcpFlags::fin_ack(),
        &[],
    ))
    .await
    .unwrap();

    let (flags, _, ack, _) = recv_tcp(&host).await;
    assert!(flags.ack);
    assert_eq!(ack, 5001 + request.len() as u32 + 1);
    let (flags, _, _, _) = recv_tcp(&host).await;
    assert!(flags.fin && flags.ack);

    let stats = supervisor.engine_stats().unwrap();
    assert_eq!(stats.bytes_uploaded(), request.len() as u64);
    assert_eq!(stats.bytes_downloaded(), request.len() as u64);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    unsafe { libc::close(host_fd) };
}

#[tokio::test]
async fn test_refused_connect_through_tun() {
    let relay = MockRelay::spawn([0u8; 32], MockRelay::connect_behavior(0x05)).await;
    let mut supervisor =
        Supervisor::with_connector(test_config(), Arc::new(MockConnector { relay }));

    let (device_fd, host_fd) = tun_fd_pair();
    supervisor.start(device_fd).await.unwrap();
    let host = host_socket(host_fd);

    let syn = TcpFlags {
        syn: true,
        ..Default::default()
    };
    host.send(&build_ipv4_tcp(DEVICE, PEER, 41000, 80, 9000, 0, syn, &[]))
        .await
        .unwrap();

    let (flags, _, ack, _) = recv_tcp(&host).await;
    assert!(flags.rst);
    assert_eq!(ack, 9001);

    supervisor.stop().await;
    unsafe { libc::close(host_fd) };
}
