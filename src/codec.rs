//! Framing over an unstructured byte stream.
//!
//! [`PacketCodec`] plugs into `tokio_util::codec`. Decoding recovers frame alignment by scanning a
//! header-sized window for [`MAGIC`]:
//!
//! 1. magic at offset 0: the window is the header.
//! 2. magic at offset `k > 0`: drop `k` bytes of noise and wait for the window to refill.
//! 3. no magic: slide forward by `HEADER_SIZE - (MAGIC_SIZE - 1)`, keeping the tail in case a
//!    partial magic straddles the boundary. Each slide spends one unit of the resync budget; an
//!    exhausted budget yields [`ProtocolError::Desync`].
//!
//! Header coherence is checked as soon as the header is complete, so a bogus payload length is
//! never waited on. The payload crc is checked once all payload bytes are buffered.
//!
//! Protocol faults are returned as items, not errors, so a framed stream survives them. Only I/O
//! errors end the stream.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, TransportError};
use crate::packet::{Header, Kind, Packet, HEADER_SIZE, MAGIC, MAGIC_SIZE};

/// Bytes discarded by one slide of the resync window.
pub const SLIDE: usize = HEADER_SIZE - (MAGIC_SIZE - 1);

#[derive(Debug, Clone)]
enum DecodeState {
    Head,
    Payload(Header, Kind),
}

#[derive(Debug, Clone)]
pub struct PacketCodec {
    state: DecodeState,
    max_resyncs: usize,
    resyncs: usize,
    discarded: usize,
}

impl PacketCodec {
    pub fn new(max_resyncs: usize) -> PacketCodec {
        PacketCodec {
            state: DecodeState::Head,
            max_resyncs,
            resyncs: 0,
            discarded: 0,
        }
    }

    /// Noise bytes guaranteed to be skipped before a desync is reported.
    pub fn resync_byte_budget(&self) -> usize {
        self.max_resyncs * SLIDE + (HEADER_SIZE - MAGIC_SIZE)
    }

    /// True once a header has been accepted and its payload is still outstanding.
    pub fn in_frame(&self) -> bool {
        match self.state {
            DecodeState::Payload(..) => true,
            DecodeState::Head => false,
        }
    }

    fn reset_resync(&mut self) {
        self.resyncs = 0;
        self.discarded = 0;
    }

    /// Aligns `buf` so that it starts with the magic. `Ok(false)` means more bytes are needed.
    fn align(&mut self, buf: &mut BytesMut) -> Result<bool, ProtocolError> {
        loop {
            if buf.len() < HEADER_SIZE {
                return Ok(false);
            }
            match find_magic(&buf[..HEADER_SIZE]) {
                Some(0) => return Ok(true),
                Some(noise) => {
                    buf.advance(noise);
                    self.discarded += noise;
                }
                None => {
                    if self.resyncs >= self.max_resyncs {
                        let discarded = self.discarded + SLIDE;
                        buf.advance(SLIDE);
                        self.reset_resync();
                        return Err(ProtocolError::Desync { discarded });
                    }
                    buf.advance(SLIDE);
                    self.resyncs += 1;
                    self.discarded += SLIDE;
                }
            }
        }
    }
}

fn find_magic(window: &[u8]) -> Option<usize> {
    window.windows(MAGIC_SIZE).position(|candidate| candidate == &MAGIC[..])
}

impl Decoder for PacketCodec {
    type Item = Result<Packet, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.clone() {
                DecodeState::Head => {
                    match self.align(buf) {
                        Ok(true) => {}
                        Ok(false) => return Ok(None),
                        Err(desync) => return Ok(Some(Err(desync))),
                    }
                    if self.discarded > 0 {
                        log::debug!("resynced after {} noise bytes", self.discarded);
                    }
                    self.reset_resync();

                    let header = Header::decode(&buf[..HEADER_SIZE]);
                    // Only the header is consumed on rejection; whatever follows is resynced.
                    let kind = match header.validate() {
                        Ok(kind) => kind,
                        Err(violation) => {
                            buf.advance(HEADER_SIZE);
                            return Ok(Some(Err(violation.into())));
                        }
                    };
                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload(header, kind);
                }
                DecodeState::Payload(header, kind) => {
                    let len = header.payload_len as usize;
                    if buf.len() < len {
                        buf.reserve(len - buf.len());
                        return Ok(None);
                    }
                    let payload: Bytes = buf.split_to(len).freeze();
                    self.state = DecodeState::Head;
                    return Ok(Some(
                        Packet::from_parts(&header, kind, payload).map_err(ProtocolError::from),
                    ));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                // A truncated trailing frame is noise from a peer that went away.
                buf.clear();
                self.state = DecodeState::Head;
                Ok(None)
            }
        }
    }
}

impl<'a> Encoder<&'a Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &'a Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|violation| io::Error::new(io::ErrorKind::InvalidInput, violation))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Packet>::encode(self, &item, dst)
    }
}

/// One step of a framed packet stream, classified.
#[derive(Debug)]
pub enum Received {
    Packet(Packet),
    /// The peer closed its end.
    Disconnected,
    Transport(TransportError),
    Invalid(ProtocolError),
    Desync(usize),
}

impl Received {
    /// Classifies the output of `StreamExt::next` on a framed reader.
    pub fn from_next(next: Option<Result<Result<Packet, ProtocolError>, io::Error>>) -> Received {
        match next {
            None => Received::Disconnected,
            Some(Err(err)) => Received::Transport(TransportError::classify(err)),
            Some(Ok(Ok(packet))) => Received::Packet(packet),
            Some(Ok(Err(ProtocolError::Desync { discarded }))) => Received::Desync(discarded),
            Some(Ok(Err(invalid))) => Received::Invalid(invalid),
        }
    }
}
