//! The six literal end-to-end scenarios of §8, run against the mock
//! authenticator and a loopback-style harness: a real UDP socket pair for
//! the network side, a `socketpair(2)` standing in for the tap device (no
//! root or real tap device is available in CI, per SPEC_FULL.md §E).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use hex_literal::hex;
use mio::net::UdpSocket;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use slog::{o, Discard, Logger};

use crate::auth::testing::MockAuthenticator;
use crate::codec::{self, PacketKind};
use crate::config::ServerConfig;
use crate::connection::GssState;
use crate::mac::MacAddr;
use crate::server::Server;
use crate::table::ConnectionHandle;

fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

fn loopback_socket() -> StdUdpSocket {
    StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind loopback")
}

/// A pair of fds standing in for a bidirectional tap device: the server
/// reads/writes `server_fd`, the test injects/observes frames on `test_fd`.
/// `SOCK_DGRAM` keeps each `write` a single frame on the matching `read`,
/// which a real tap device also guarantees and a stream pipe would not.
fn tap_pair() -> (RawFd, RawFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_NONBLOCK,
    )
    .expect("socketpair")
}

/// Build a server with a fresh `MockAuthenticator`, wired to a loopback UDP
/// socket and a fake tap pair. Returns the server, a UDP socket the test
/// drives as "the client", and the test-side tap fd.
fn new_test_server(config: ServerConfig, auth: MockAuthenticator) -> (Server<MockAuthenticator>, StdUdpSocket, RawFd) {
    let server_std = loopback_socket();
    server_std.set_nonblocking(true).unwrap();
    let server_addr = server_std.local_addr().unwrap();
    let server_udp = UdpSocket::from_std(server_std);

    let client = loopback_socket();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    client.connect(server_addr).expect("connect to server");

    let (server_tap, test_tap) = tap_pair();

    let server = Server::new_for_test(auth, config, server_udp, server_tap, test_logger())
        .expect("construct test server");
    (server, client, test_tap)
}

fn client_v4(sock: &StdUdpSocket) -> SocketAddrV4 {
    match sock.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!("loopback binds IPv4"),
    }
}

fn send(client: &StdUdpSocket, kind: PacketKind, session_id: u16, payload: Option<&[u8]>) {
    let datagram = codec::encode(kind, session_id, payload);
    client.send(&datagram).expect("send to server");
}

fn recv(client: &StdUdpSocket) -> (PacketKind, u16, Vec<u8>) {
    let mut buf = [0u8; 2048];
    let n = client.recv(&mut buf).expect("recv from server");
    let dummy_peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
    let (packet, _) = codec::decode(&buf[..n], dummy_peer).expect("decode server reply");
    (packet.kind, packet.session_id, packet.payload.to_vec())
}

fn expect_nothing(client: &StdUdpSocket) {
    let mut buf = [0u8; 64];
    match client.recv(&mut buf) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
        other => panic!("expected no further datagram, got {:?}", other),
    }
}

fn handle_for(server: &Server<MockAuthenticator>, client: &StdUdpSocket, session_id: u16) -> ConnectionHandle {
    server
        .table
        .find_by_peer(client_v4(client), session_id)
        .expect("connection exists")
}

/// Scenario 1 (§8): cold handshake over two `GSSINIT` round trips, then a
/// `NETSTART` nudge (MAC unlearned) and an `ECHO` round trip.
#[test]
fn cold_handshake_and_echo() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 2;
    let (mut server, client, _tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let session_id = 0x1234;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let (kind, sid, payload) = recv(&client);
    assert_eq!(kind, PacketKind::GssInit);
    assert_eq!(sid, session_id);
    assert_eq!(payload, b"tok1");

    send(&client, PacketKind::GssInit, session_id, Some(b"tok2"));
    server.on_udp_readable().unwrap();
    let (kind, sid, _) = recv(&client);
    assert_eq!(kind, PacketKind::NetStart);
    assert_eq!(sid, session_id);

    let handle = handle_for(&server, &client, session_id);
    assert_eq!(server.table.get(handle).unwrap().gss_state, GssState::Established);

    send(&client, PacketKind::Echo, session_id, None);
    server.on_udp_readable().unwrap();
    let (kind, _, payload) = recv(&client);
    assert_eq!(kind, PacketKind::Echo);
    assert!(payload.is_empty());
}

/// Scenario 2 (§8): no helper configured, so `NETINIT` is admitted
/// immediately with an empty reply, and the MAC becomes findable.
#[test]
fn netinit_accept_without_helper() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let (mut server, client, _tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let session_id = 0x1;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let (kind, _, _) = recv(&client);
    assert_eq!(kind, PacketKind::NetStart);

    let mac = MacAddr(hex!("525400123456"));
    let mut netinit_payload = mac.0.to_vec();
    netinit_payload.extend_from_slice(b"hello");
    send(&client, PacketKind::NetInit, session_id, Some(&netinit_payload));
    server.on_udp_readable().unwrap();
    let (kind, _, payload) = recv(&client);
    assert_eq!(kind, PacketKind::NetInit);
    assert!(payload.is_empty());

    assert_eq!(server.table.find_by_mac(&mac), Some(handle_for(&server, &client, session_id)));
}

/// Scenario 3 (§8): a configured helper that exits non-zero rejects the
/// client; the connection is destroyed and a later request gets a fresh one.
#[test]
fn netinit_reject_by_helper_exit_code() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let mut config = ServerConfig::new("vpn/host.example.com");
    config.netinit_helper = Some(PathBuf::from("/bin/false"));
    let (mut server, client, _tap) = new_test_server(config, auth);
    let session_id = 0x7;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client); // NETSTART

    let mac = MacAddr(hex!("010203040506"));
    let payload = mac.0.to_vec();
    send(&client, PacketKind::NetInit, session_id, Some(&payload));
    server.on_udp_readable().unwrap();
    assert!(server.table.get(handle_for(&server, &client, session_id)).unwrap().netinit.is_some());

    let mut reaped = false;
    for _ in 0..200 {
        server.run_netinit_child_reaps();
        if server.table.find_by_peer(client_v4(&client), session_id).is_none() {
            reaped = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(reaped, "helper exit was never reaped");

    let (kind, _, _) = recv(&client);
    assert_eq!(kind, PacketKind::Shutdown);
    assert!(server.table.find_by_peer(client_v4(&client), session_id).is_none());

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0-again"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client);
    assert!(server.table.find_by_peer(client_v4(&client), session_id).is_some());
}

fn establish_with_mac(
    server: &mut Server<MockAuthenticator>,
    client: &StdUdpSocket,
    session_id: u16,
    mac: MacAddr,
) -> ConnectionHandle {
    send(client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(client); // NETSTART
    let handle = handle_for(server, client, session_id);
    server.table.relearn_mac(handle, mac);
    handle
}

/// Scenario 4 (§8): a unicast tap frame is delivered only to the connection
/// whose learned MAC matches the destination.
#[test]
fn unicast_frame_goes_to_matching_connection_only() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let (mut server, client_a, tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let client_b = loopback_socket();
    client_b.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    client_b.connect(client_a.peer_addr().unwrap()).unwrap();

    let mac_a = MacAddr(hex!("525400aabbcc"));
    let mac_b = MacAddr(hex!("525400ddeeff"));
    establish_with_mac(&mut server, &client_a, 0x10, mac_a);
    establish_with_mac(&mut server, &client_b, 0x20, mac_b);

    let mut frame = mac_a.0.to_vec();
    frame.extend_from_slice(&[0u8; 6]); // source MAC, unused
    frame.extend_from_slice(b"payload");
    nix::unistd::write(tap, &frame).expect("inject tap frame");
    server.on_tap_readable().unwrap();

    let (kind, _, payload) = recv(&client_a);
    assert_eq!(kind, PacketKind::Data);
    assert_eq!(payload, [b"WRAP".as_ref(), &frame[..]].concat());
    expect_nothing(&client_a);
    expect_nothing(&client_b);
}

/// Scenario 5 (§8): a broadcast tap frame reaches every `Established`
/// connection exactly once; a `Handshaking` connection gets none.
#[test]
fn broadcast_frame_reaches_established_connections_only() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 2;
    let (mut server, client_a, tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let client_b = loopback_socket();
    client_b.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    client_b.connect(client_a.peer_addr().unwrap()).unwrap();

    // A completes both rounds and learns a MAC.
    send(&client_a, PacketKind::GssInit, 0x30, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client_a);
    send(&client_a, PacketKind::GssInit, 0x30, Some(b"tok2"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client_a);
    let handle_a = handle_for(&server, &client_a, 0x30);
    server.table.relearn_mac(handle_a, MacAddr(hex!("010101010101")));

    // B only completes the first round; it stays Handshaking.
    send(&client_b, PacketKind::GssInit, 0x31, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client_b);
    let handle_b = handle_for(&server, &client_b, 0x31);
    assert_eq!(server.table.get(handle_b).unwrap().gss_state, GssState::Handshaking);

    let mut frame = MacAddr::BROADCAST.0.to_vec();
    frame.extend_from_slice(&[0u8; 6]);
    frame.extend_from_slice(b"broadcast payload");
    nix::unistd::write(tap, &frame).expect("inject broadcast frame");
    server.on_tap_readable().unwrap();

    let (kind, _, payload) = recv(&client_a);
    assert_eq!(kind, PacketKind::Data);
    assert_eq!(payload, [b"WRAP".as_ref(), &frame[..]].concat());
    expect_nothing(&client_a);
    expect_nothing(&client_b);
}

/// Scenario 6 (§8): soft expiry. The timer fires with `Expired` and
/// `kill_on_timeout = false`, so the server nudges the client back to
/// `Fresh` instead of destroying it, and a fresh handshake succeeds.
#[test]
fn soft_expiry_resets_to_fresh_and_resumes() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let (mut server, client, _tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let session_id = 0x99;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client); // NETSTART
    let handle = handle_for(&server, &client, session_id);
    assert_eq!(server.table.get(handle).unwrap().gss_state, GssState::Established);

    server.authenticator.force_expired = true;
    server.timers.arm(handle, 0);
    std::thread::sleep(Duration::from_millis(5));
    server.run_expired_timers();

    let (kind, _, payload) = recv(&client);
    assert_eq!(kind, PacketKind::GssInit);
    assert!(payload.is_empty());
    assert_eq!(server.table.get(handle).unwrap().gss_state, GssState::Fresh);
    assert!(server.table.get(handle).unwrap().context.is_none());

    server.authenticator.force_expired = false;
    send(&client, PacketKind::GssInit, session_id, Some(b"tok0-retry"));
    server.on_udp_readable().unwrap();
    let (kind, _, _) = recv(&client);
    assert_eq!(kind, PacketKind::NetStart);
    assert_eq!(server.table.get(handle).unwrap().gss_state, GssState::Established);
}

/// §4.3: a `NETINIT` while one is already running for that connection is
/// ignored, not restarted.
#[test]
fn second_netinit_while_running_is_ignored() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let mut config = ServerConfig::new("vpn/host.example.com");
    // `yes` ignores its stdin (already `/dev/null`) and loops forever
    // echoing its arguments, so it never exits on its own; `netinit` stays
    // populated for the duration of the test.
    config.netinit_helper = Some(PathBuf::from("/usr/bin/yes"));
    let (mut server, client, _tap) = new_test_server(config, auth);
    let session_id = 0x55;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client);

    let mac = MacAddr(hex!("020202020202"));
    send(&client, PacketKind::NetInit, session_id, Some(&mac.0));
    server.on_udp_readable().unwrap();
    let handle = handle_for(&server, &client, session_id);
    assert!(server.table.get(handle).unwrap().netinit.is_some());

    send(&client, PacketKind::NetInit, session_id, Some(&mac.0));
    server.on_udp_readable().unwrap();
    expect_nothing(&client);
    assert!(server.table.get(handle).unwrap().netinit.is_some());

    // Clean up the still-running helper so the test process doesn't leak it.
    if let Some(conn) = server.table.get_mut(handle) {
        if let Some(netinit) = conn.netinit.as_mut() {
            let _ = netinit.child.kill();
            let _ = netinit.child.wait();
        }
    }
}

/// §4.6: a decode-level `rekey_needed` finds the connection, drops its
/// context, and nudges the peer without the authenticator ever seeing a
/// token.
#[test]
fn decode_level_rekey_request_resets_context() {
    let mut auth = MockAuthenticator::new();
    auth.rounds_to_complete = 1;
    let (mut server, client, _tap) = new_test_server(ServerConfig::new("vpn/host.example.com"), auth);
    let session_id = 0x42;

    send(&client, PacketKind::GssInit, session_id, Some(b"tok0"));
    server.on_udp_readable().unwrap();
    let _ = recv(&client);
    let handle = handle_for(&server, &client, session_id);
    assert!(server.table.get(handle).unwrap().context.is_some());

    let rekey_datagram = [0xfeu8, (session_id >> 8) as u8, session_id as u8];
    client.send(&rekey_datagram).unwrap();
    server.on_udp_readable().unwrap();

    let (kind, _, payload) = recv(&client);
    assert_eq!(kind, PacketKind::GssInit);
    assert!(payload.is_empty());
    assert!(server.table.get(handle).unwrap().context.is_none());
    assert_eq!(server.table.get(handle).unwrap().gss_state, GssState::Fresh);
}
