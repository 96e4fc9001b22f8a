//! End-to-end tests for the server.
//!
//! Each test starts a real server on a loopback port and talks to it through raw framed links, so
//! every byte crosses an actual socket.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use rooms::codec::Received;
use rooms::config::ServerConfig;
use rooms::packet::{Kind, Packet, PacketBuilder, HEADER_SIZE};
use rooms::server::Server;
use rooms::transport::{self, link, Link};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start(max_clients: Option<usize>) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = Server::bind(addr, ServerConfig::default(), max_clients)
        .await
        .expect("bind server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn dial(addr: SocketAddr) -> Link {
    let stream = transport::connect(addr, WAIT).await.expect("connect");
    link(stream, 8)
}

async fn send(link: &mut Link, packet: &Packet) {
    transport::send(link, packet, WAIT).await.expect("send");
}

async fn next(link: &mut Link) -> Received {
    timeout(WAIT, link.next())
        .await
        .map(Received::from_next)
        .expect("nothing received in time")
}

async fn next_packet(link: &mut Link) -> Packet {
    match next(link).await {
        Received::Packet(packet) => packet,
        other => panic!("expected a packet, got {:?}", other),
    }
}

/// Round-trips a PING. Getting the PONG back also proves the server has registered this link.
async fn ping(link: &mut Link, builder: &mut PacketBuilder) {
    let ping = builder.signal(Kind::Ping).unwrap();
    send(link, &ping).await;
    let pong = next_packet(link).await;
    assert_eq!(pong.kind, Kind::Pong);
    assert_eq!(pong.nonce, ping.nonce);
}

/// Waits for the server to drop this link.
async fn expect_kicked(link: &mut Link) {
    loop {
        match next(link).await {
            Received::Disconnected | Received::Transport(_) => return,
            Received::Packet(packet) if packet.kind == Kind::Pong => {
                panic!("server still answering")
            }
            _ => {}
        }
    }
}

/// A well-formed frame with one payload byte flipped after encoding.
fn corrupt_frame(builder: &mut PacketBuilder) -> BytesMut {
    let mut buf = BytesMut::new();
    builder.message("tampered").unwrap().encode(&mut buf).unwrap();
    let last = buf.len() - 1;
    buf[last] ^= 0xff;
    buf
}

async fn write_raw(link: &mut Link, bytes: &[u8]) {
    link.get_mut().write_all(bytes).await.expect("raw write");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_reaches_the_other_client_and_sender_is_acked() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    let (mut bob, mut bob_tx) = (dial(addr).await, PacketBuilder::new("bob"));
    ping(&mut alice, &mut alice_tx).await;
    ping(&mut bob, &mut bob_tx).await;

    let hello = alice_tx.message("hello bob").unwrap();
    send(&mut alice, &hello).await;

    let relayed = next_packet(&mut bob).await;
    assert_eq!(relayed, hello);
    assert_eq!(relayed.usrname, "alice");
    assert_eq!(relayed.timestamp, hello.timestamp);
    assert_eq!(&relayed.payload[..], b"hello bob");

    let ack = next_packet(&mut alice).await;
    assert_eq!(ack.kind, Kind::Ack);
    assert_eq!(ack.nonce, hello.nonce);
    assert!(ack.payload.is_empty());
}

#[tokio::test]
async fn losing_one_client_leaves_the_others_alone() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    let (mut bob, mut bob_tx) = (dial(addr).await, PacketBuilder::new("bob"));
    ping(&mut alice, &mut alice_tx).await;
    ping(&mut bob, &mut bob_tx).await;

    drop(bob);

    for text in &["anyone?", "still here"] {
        let msg = alice_tx.message(text).unwrap();
        send(&mut alice, &msg).await;
        let ack = next_packet(&mut alice).await;
        assert_eq!((ack.kind, ack.nonce), (Kind::Ack, msg.nonce));
    }
    ping(&mut alice, &mut alice_tx).await;
}

#[tokio::test]
async fn join_exit_and_whisper_are_relayed_verbatim() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    let (mut bob, mut bob_tx) = (dial(addr).await, PacketBuilder::new("bob"));
    ping(&mut alice, &mut alice_tx).await;
    ping(&mut bob, &mut bob_tx).await;

    let sent = vec![
        bob_tx.signal(Kind::Join).unwrap(),
        bob_tx.whisper("alice", "psst").unwrap(),
        bob_tx.signal(Kind::Exit).unwrap(),
    ];
    for packet in &sent {
        send(&mut bob, packet).await;
    }
    for packet in &sent {
        assert_eq!(&next_packet(&mut alice).await, packet);
    }
    for packet in &sent {
        let ack = next_packet(&mut bob).await;
        assert_eq!((ack.kind, ack.nonce), (Kind::Ack, packet.nonce));
    }
}

#[tokio::test]
async fn disconnect_packet_ends_the_session() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let bye = alice_tx.signal(Kind::Disconnect).unwrap();
    send(&mut alice, &bye).await;
    expect_kicked(&mut alice).await;
}

#[tokio::test]
async fn a_single_bad_frame_is_forgiven() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let bad = corrupt_frame(&mut alice_tx);
    write_raw(&mut alice, &bad).await;
    ping(&mut alice, &mut alice_tx).await;
}

#[tokio::test]
async fn three_bad_frames_get_the_client_kicked() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let mut bad = BytesMut::new();
    for _ in 0..3 {
        bad.extend_from_slice(&corrupt_frame(&mut alice_tx));
    }
    write_raw(&mut alice, &bad).await;
    expect_kicked(&mut alice).await;
}

#[tokio::test]
async fn valid_packets_reset_the_strike_count() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    for _ in 0..3 {
        let mut bad = corrupt_frame(&mut alice_tx);
        bad.extend_from_slice(&corrupt_frame(&mut alice_tx));
        write_raw(&mut alice, &bad).await;
        ping(&mut alice, &mut alice_tx).await;
    }
}

#[tokio::test]
async fn resyncs_past_line_noise() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let mut noisy = BytesMut::from(&[0xaa; 100][..]);
    let ping_packet = alice_tx.signal(Kind::Ping).unwrap();
    ping_packet.encode(&mut noisy).unwrap();
    write_raw(&mut alice, &noisy).await;

    let pong = next_packet(&mut alice).await;
    assert_eq!((pong.kind, pong.nonce), (Kind::Pong, ping_packet.nonce));
}

#[tokio::test]
async fn sustained_noise_gets_the_client_kicked() {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    write_raw(&mut alice, &[0x55; 4096]).await;
    expect_kicked(&mut alice).await;
}

/// Writes the first `cut` bytes of a frame and then goes quiet.
async fn stall_after(cut: usize) {
    let addr = start(None).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let mut frame = BytesMut::new();
    alice_tx.message("hello").unwrap().encode(&mut frame).unwrap();
    assert!(cut < frame.len());
    write_raw(&mut alice, &frame[..cut]).await;
    expect_kicked(&mut alice).await;
}

#[tokio::test]
async fn a_client_stalled_mid_header_is_kicked() {
    stall_after(30).await;
}

#[tokio::test]
async fn a_client_stalled_after_a_whole_header_is_kicked() {
    stall_after(HEADER_SIZE).await;
}

#[tokio::test]
async fn a_full_server_refuses_new_clients() {
    let addr = start(Some(1)).await;
    let (mut alice, mut alice_tx) = (dial(addr).await, PacketBuilder::new("alice"));
    ping(&mut alice, &mut alice_tx).await;

    let mut bob = dial(addr).await;
    expect_kicked(&mut bob).await;

    ping(&mut alice, &mut alice_tx).await;
    drop(alice);

    // The freed slot admits the next client once the server has seen alice go.
    let mut carol_tx = PacketBuilder::new("carol");
    for _ in 0..50 {
        let mut carol = dial(addr).await;
        let ping = carol_tx.signal(Kind::Ping).unwrap();
        if transport::send(&mut carol, &ping, WAIT).await.is_ok() {
            if let Received::Packet(pong) = next(&mut carol).await {
                assert_eq!(pong.kind, Kind::Pong);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("freed slot was never reused");
}
