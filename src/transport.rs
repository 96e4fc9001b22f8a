//! Stream transport plumbing shared by both roles.
//!
//! Full-length transfer is the codec's job: a framed sink only completes once the whole encoded
//! frame has been written, and a framed stream only yields once a whole frame has been read.
//! Interrupted system calls are retried inside the runtime. Writes to a half-closed peer surface
//! as `BrokenPipe` errors because the Rust runtime ignores `SIGPIPE`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::PacketCodec;
use crate::error::TransportError;
use crate::packet::{Packet, MAX_FRAME_SIZE};

/// A connected stream with packet framing on both directions.
pub type Link = Framed<TcpStream, PacketCodec>;

pub fn link(stream: TcpStream, max_resyncs: usize) -> Link {
    Framed::with_capacity(stream, PacketCodec::new(max_resyncs), MAX_FRAME_SIZE)
}

/// Connects once, giving up after `limit`.
pub async fn connect(target: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(limit, TcpStream::connect(target)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sends one whole frame, bounded by `limit`. A stalled peer reads as a recoverable timeout.
pub async fn send(link: &mut Link, packet: &Packet, limit: Duration) -> Result<(), TransportError> {
    match timeout(limit, link.send(packet)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TransportError::classify(err)),
        Err(_) => Err(TransportError::Recoverable(io::Error::from(
            io::ErrorKind::TimedOut,
        ))),
    }
}
