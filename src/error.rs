//! Error taxonomy shared by the client and the server.
//!
//! Protocol faults ([`ProtocolError`]) are per-frame and never end a session. Transport faults
//! ([`TransportError`]) are split into the recoverable set, which triggers a reconnect on the
//! client and a kick on the server, and everything else, which is fatal.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::{PORT_MAX, PORT_MIN};
use crate::packet::USRNAME_SIZE;

/// Bad command line input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port number {0:?} (expected {min}..={max})", min = PORT_MIN, max = PORT_MAX)]
    InvalidPort(String),
    #[error("invalid ip address {0:?}")]
    InvalidIp(String),
    #[error("usrname length must be between 1 and {max} bytes", max = USRNAME_SIZE)]
    UsernameLength,
    #[error("usrname may not contain NUL bytes")]
    UsernameNul,
}

/// A single reason a frame was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("empty usrname")]
    EmptyUsername,
    #[error("corrupt {0} (not sanitized)")]
    Unsanitized(&'static str),
    #[error("{0} is not valid utf-8")]
    NotUtf8(&'static str),
    #[error("corrupt flags 0x{0:02x}")]
    Flags(u8),
    #[error("incoherent contents (payload-bearing packet without payload or crc)")]
    MissingPayload,
    #[error("incoherent contents (packet carries an unexpected payload or crc)")]
    UnexpectedPayload,
    #[error("incoherent contents (whisper without options)")]
    MissingOptions,
    #[error("incoherent contents (options on a non-whisper packet)")]
    UnexpectedOptions,
    #[error("corrupt crc (expected {expected:08x}, got {actual:08x})")]
    Crc { expected: u32, actual: u32 },
    #[error("{field} is {len} bytes, at most {max} fit")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// A frame-level fault. The stream itself stays usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("discarded packet: {0}")]
    Invalid(#[from] Violation),
    #[error("lost frame alignment, discarded {discarded} bytes")]
    Desync { discarded: usize },
}

/// A socket-level fault, split by whether the session may be re-established.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("recoverable transport error: {0}")]
    Recoverable(io::Error),
    #[error("fatal transport error: {0}")]
    Fatal(io::Error),
}

impl TransportError {
    /// Sorts an I/O error into the recoverable set (timeouts, resets, half-closed peers) or the
    /// fatal rest.
    pub fn classify(err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => TransportError::Recoverable(err),
            _ => TransportError::Fatal(err),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Recoverable(_) => true,
            TransportError::Fatal(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("couldn't bind listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("listener failed: {0}")]
    Listener(io::Error),
    #[error("couldn't query the descriptor limit: {0}")]
    Limit(io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {target}: {source}")]
    Connect { target: SocketAddr, source: io::Error },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("terminal error: {0}")]
    Terminal(io::Error),
    #[error("client task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
