//! # A multi-user chat room over a small binary protocol.
//!
//! One server fans every message out to the other connected clients. Clients join under a
//! username, broadcast lines of text, whisper to a single user and are told when people come and
//! go. Each client-server hop is acknowledged: the server ACKs every relayed packet and answers
//! PING with PONG.
//!
//! Frames are fixed-layout: a magic tag, the sender's username, a single-bit kind flag, payload
//! length and CRC32, whisper addressing, a nonce and a timestamp, then up to 255 bytes of payload.
//! Decoders resynchronize on the magic tag when a stream loses alignment, and report corrupt
//! frames without tearing down the connection. On the server, protocol faults count as strikes;
//! three inside ten seconds and the client is kicked. On the client, a lost connection is
//! re-established forever, first eagerly and then with jittered exponential backoff.
//!
//! TODO: Whispers are fanned out to everybody and filtered by the receiving client. Route them by
//! username on the server once it keeps a name table for its peers.
//!
//! Architecture:
//!
//! ```text
//!  TcpListener
//!     v
//! +-----------+                 +------+
//! | TcpStream |<-PacketCodec--->| Peer |--+
//! +-----------+                 +------+  |   Slots<Peer>, polled for readiness by one
//! | TcpStream |<-PacketCodec--->| Peer |--+-> select! loop: accept, dispatch, fanout,
//! +-----------+                 +------+  |   strikes, kicks, stall sweep
//! | ...       |                 | ...  |--+
//! +-----------+                 +------+
//!       ^
//!       | PacketCodec
//!       v
//! +------------+  Outbound  +--------+  TerminalCodec  +-------+
//! | Connection |<-----------| talker |<----------------| stdin |
//! |  (session) |            +--------+                 +-------+
//! +------------+
//!       | UiEvent
//!       v
//! +----------+
//! | render   |---> stdout
//! +----------+
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod packet;
pub mod peer;
pub mod server;
pub mod slots;
pub mod terminal;
pub mod transport;
