//! The unit of wire communication.
//!
//! Every frame is a fixed 52 byte header followed by up to 255 payload bytes. Multi-byte integers
//! are big-endian, fixed-width strings are NUL-padded.
//!
//! ```text
//! +--------+-----------+-----+-------+-----+-----------+-------+-----------+---------+
//! | magic  | usrname   | len | flags | crc | options   | nonce | timestamp | payload |
//! | 6      | 12        | 1   | 1     | 4   | 12        | 8     | 8         | 0..=255 |
//! +--------+-----------+-----+-------+-----+-----------+-------+-----------+---------+
//! ```
//!
//! `crc` is the CRC32 (ISO-HDLC) of the payload and is zero when there is no payload. `options`
//! carries the addressee of a whisper and is empty for every other kind.

use std::borrow::Cow;
use std::fmt;
use std::str::from_utf8;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::Violation;

/// Literal tag opening every frame.
pub const MAGIC: &[u8; MAGIC_SIZE] = b"rooms\0";
pub const MAGIC_SIZE: usize = 6;
pub const USRNAME_SIZE: usize = 12;
pub const OPTIONS_SIZE: usize = 12;
pub const MAX_PAYLOAD: usize = 255;

pub const HEADER_SIZE: usize = OFF_TIMESTAMP + 8;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

const OFF_USRNAME: usize = MAGIC_SIZE;
const OFF_PAYLOAD_LEN: usize = OFF_USRNAME + USRNAME_SIZE;
const OFF_FLAGS: usize = OFF_PAYLOAD_LEN + 1;
const OFF_CRC: usize = OFF_FLAGS + 1;
const OFF_OPTIONS: usize = OFF_CRC + 4;
const OFF_NONCE: usize = OFF_OPTIONS + OPTIONS_SIZE;
const OFF_TIMESTAMP: usize = OFF_NONCE + 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// Message kind. Exactly one flag bit on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Msg,
    Whisper,
    Join,
    Exit,
    Disconnect,
    Ping,
    Pong,
    Ack,
}

const KINDS: [Kind; 8] = [
    Kind::Msg,
    Kind::Whisper,
    Kind::Join,
    Kind::Exit,
    Kind::Disconnect,
    Kind::Ping,
    Kind::Pong,
    Kind::Ack,
];

impl Kind {
    pub fn flag(self) -> u8 {
        match self {
            Kind::Msg => 1 << 0,
            Kind::Whisper => 1 << 1,
            Kind::Join => 1 << 2,
            Kind::Exit => 1 << 3,
            Kind::Disconnect => 1 << 4,
            Kind::Ping => 1 << 5,
            Kind::Pong => 1 << 6,
            Kind::Ack => 1 << 7,
        }
    }

    /// Rejects zero or more than one set bit.
    pub fn from_flags(flags: u8) -> Result<Kind, Violation> {
        if flags.count_ones() != 1 {
            return Err(Violation::Flags(flags));
        }
        KINDS
            .iter()
            .copied()
            .find(|kind| kind.flag() == flags)
            .ok_or(Violation::Flags(flags))
    }

    pub fn carries_payload(self) -> bool {
        match self {
            Kind::Msg | Kind::Whisper => true,
            _ => false,
        }
    }
}

/// The fixed-size part of a frame, exactly as laid out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub usrname: [u8; USRNAME_SIZE],
    pub payload_len: u8,
    pub flags: u8,
    pub crc: u32,
    pub options: [u8; OPTIONS_SIZE],
    pub nonce: u64,
    pub timestamp: u64,
}

impl Header {
    /// Reads the fields that follow the magic. The caller has already located the magic.
    pub fn decode(buf: &[u8]) -> Header {
        let mut usrname = [0u8; USRNAME_SIZE];
        usrname.copy_from_slice(&buf[OFF_USRNAME..OFF_PAYLOAD_LEN]);
        let mut options = [0u8; OPTIONS_SIZE];
        options.copy_from_slice(&buf[OFF_OPTIONS..OFF_NONCE]);

        Header {
            usrname,
            payload_len: buf[OFF_PAYLOAD_LEN],
            flags: buf[OFF_FLAGS],
            crc: BigEndian::read_u32(&buf[OFF_CRC..OFF_OPTIONS]),
            options,
            nonce: BigEndian::read_u64(&buf[OFF_NONCE..OFF_TIMESTAMP]),
            timestamp: BigEndian::read_u64(&buf[OFF_TIMESTAMP..HEADER_SIZE]),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..OFF_USRNAME].copy_from_slice(MAGIC);
        buf[OFF_USRNAME..OFF_PAYLOAD_LEN].copy_from_slice(&self.usrname);
        buf[OFF_PAYLOAD_LEN] = self.payload_len;
        buf[OFF_FLAGS] = self.flags;
        BigEndian::write_u32(&mut buf[OFF_CRC..OFF_OPTIONS], self.crc);
        buf[OFF_OPTIONS..OFF_NONCE].copy_from_slice(&self.options);
        BigEndian::write_u64(&mut buf[OFF_NONCE..OFF_TIMESTAMP], self.nonce);
        BigEndian::write_u64(&mut buf[OFF_TIMESTAMP..HEADER_SIZE], self.timestamp);
        dst.put_slice(&buf);
    }

    /// Coherence checks that can run before the payload is read.
    pub fn validate(&self) -> Result<Kind, Violation> {
        let usrname = field_str(&self.usrname, "usrname")?;
        if usrname.is_empty() {
            return Err(Violation::EmptyUsername);
        }
        let kind = Kind::from_flags(self.flags)?;

        if kind.carries_payload() && (self.payload_len == 0 || self.crc == 0) {
            return Err(Violation::MissingPayload);
        }
        if !kind.carries_payload() && (self.payload_len != 0 || self.crc != 0) {
            return Err(Violation::UnexpectedPayload);
        }

        let options = field_str(&self.options, "options")?;
        if kind == Kind::Whisper && options.is_empty() {
            return Err(Violation::MissingOptions);
        }
        if kind != Kind::Whisper && !options.is_empty() {
            return Err(Violation::UnexpectedOptions);
        }

        Ok(kind)
    }
}

/// Reads a NUL-padded field. Anything but NUL after the terminator is garbage.
fn field_str<'a>(field: &'a [u8], name: &'static str) -> Result<&'a str, Violation> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    if field[end..].iter().any(|b| *b != 0) {
        return Err(Violation::Unsanitized(name));
    }
    from_utf8(&field[..end]).map_err(|_| Violation::NotUtf8(name))
}

fn pad<const N: usize>(value: &str, name: &'static str) -> Result<[u8; N], Violation> {
    let bytes = value.as_bytes();
    if bytes.len() > N {
        return Err(Violation::TooLong {
            field: name,
            len: bytes.len(),
            max: N,
        });
    }
    if bytes.contains(&0) {
        return Err(Violation::Unsanitized(name));
    }
    let mut field = [0u8; N];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// A decoded, well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub usrname: String,
    pub kind: Kind,
    pub options: String,
    pub nonce: u64,
    pub timestamp: u64,
    pub payload: Bytes,
}

impl Packet {
    /// Builds the wire header, refusing anything a receiver would reject.
    pub fn header(&self) -> Result<Header, Violation> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Violation::TooLong {
                field: "payload",
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        let crc = if self.payload.is_empty() {
            0
        } else {
            checksum(&self.payload)
        };
        let header = Header {
            usrname: pad(&self.usrname, "usrname")?,
            payload_len: self.payload.len() as u8,
            flags: self.kind.flag(),
            crc,
            options: pad(&self.options, "options")?,
            nonce: self.nonce,
            timestamp: self.timestamp,
        };
        header.validate()?;
        Ok(header)
    }

    /// Joins a validated header with its payload, checking the payload crc.
    pub fn from_parts(header: &Header, kind: Kind, payload: Bytes) -> Result<Packet, Violation> {
        if !payload.is_empty() {
            let actual = checksum(&payload);
            if actual != header.crc {
                return Err(Violation::Crc {
                    expected: header.crc,
                    actual,
                });
            }
        }
        Ok(Packet {
            usrname: field_str(&header.usrname, "usrname")?.to_string(),
            kind,
            options: field_str(&header.options, "options")?.to_string(),
            nonce: header.nonce,
            timestamp: header.timestamp,
            payload,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Violation> {
        let header = self.header()?;
        dst.reserve(HEADER_SIZE + self.payload.len());
        header.encode(dst);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn text(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// The server's reply to a delivered packet: same sender and stamps, no content.
    pub fn ack(&self) -> Packet {
        Packet {
            kind: Kind::Ack,
            options: String::new(),
            payload: Bytes::new(),
            ..self.clone()
        }
    }

    pub fn pong(&self) -> Packet {
        Packet {
            kind: Kind::Pong,
            options: String::new(),
            payload: Bytes::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} from {} (nonce {})", self.kind, self.usrname, self.nonce)
    }
}

/// Per-sender sealing state. The nonce is seeded randomly and bumped on every seal.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    usrname: String,
    nonce: u64,
}

impl PacketBuilder {
    pub fn new(usrname: &str) -> PacketBuilder {
        PacketBuilder::with_nonce(usrname, rand::random())
    }

    pub fn with_nonce(usrname: &str, nonce: u64) -> PacketBuilder {
        PacketBuilder {
            usrname: usrname.to_string(),
            nonce,
        }
    }

    pub fn usrname(&self) -> &str {
        &self.usrname
    }

    /// Stamps and checks a packet ready for transmission.
    pub fn seal(&mut self, kind: Kind, options: &str, payload: Bytes) -> Result<Packet, Violation> {
        self.nonce = self.nonce.wrapping_add(1);
        let packet = Packet {
            usrname: self.usrname.clone(),
            kind,
            options: options.to_string(),
            nonce: self.nonce,
            timestamp: now(),
            payload,
        };
        packet.header()?;
        Ok(packet)
    }

    pub fn message(&mut self, text: &str) -> Result<Packet, Violation> {
        self.seal(Kind::Msg, "", Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn whisper(&mut self, to: &str, text: &str) -> Result<Packet, Violation> {
        self.seal(Kind::Whisper, to, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn signal(&mut self, kind: Kind) -> Result<Packet, Violation> {
        self.seal(kind, "", Bytes::new())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
