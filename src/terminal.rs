//! Line-oriented terminal front end for the client.
//!
//! [`TerminalCodec`] turns raw input into [`Command`]s: a plain line is a chat message, and a line
//! starting with `/` is a command in honor of IRC. [`render`] is the only writer of the output,
//! so UI updates from the talker and the listener are totally ordered by its queue.

use std::io;
use std::str::from_utf8;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use crate::packet::{Kind, Packet, MAX_PAYLOAD, USRNAME_SIZE};

pub const HELP: &str = "type a line to send it, /w <user> <text> to whisper, /quit to leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Whisper { to: String, text: String },
    Help,
    Quit,
    /// A line that could not be understood, with the reason.
    Invalid(String),
}

/// What the renderer is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Received(Packet),
    Sent(Packet),
    Online(bool),
    Notice(String),
}

#[derive(Debug, Default)]
pub struct TerminalCodec {
    /// How far the buffer has already been scanned for a newline.
    idx: usize,
}

impl TerminalCodec {
    pub fn new() -> TerminalCodec {
        TerminalCodec { idx: 0 }
    }
}

/// Cuts `text` to at most `max` bytes without splitting a character.
fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    if line.trim().is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(truncate(line, MAX_PAYLOAD)));
    }

    let mut args = line.splitn(3, char::is_whitespace);
    let cmd = args.next().unwrap_or("").to_lowercase();
    Some(match &cmd[..] {
        "/quit" | "/exit" => Command::Quit,
        "/help" => Command::Help,
        "/w" | "/whisper" => {
            let to = args.next().unwrap_or("");
            let text = args.next().unwrap_or("").trim();
            if to.is_empty() || text.is_empty() {
                Command::Invalid("usage: /w <user> <text>".to_string())
            } else if to.len() > USRNAME_SIZE {
                Command::Invalid(format!("no user can be called {}", to))
            } else {
                Command::Whisper {
                    to: to.to_string(),
                    text: truncate(text, MAX_PAYLOAD),
                }
            }
        }
        _ => Command::Invalid(format!("unknown command {}", cmd)),
    })
}

impl Decoder for TerminalCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = match buf[self.idx..].iter().position(|b| *b == b'\n') {
                Some(offset) => self.idx + offset,
                None => {
                    self.idx = buf.len();
                    return Ok(None);
                }
            };
            let line = buf.split_to(newline + 1);
            self.idx = 0;
            let command = match from_utf8(&line) {
                Ok(text) => parse_line(text),
                Err(_) => Some(Command::Invalid("input is not valid utf-8".to_string())),
            };
            if let Some(command) = command {
                return Ok(Some(command));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(command) = self.decode(buf)? {
            return Ok(Some(command));
        }
        self.idx = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = String::from_utf8_lossy(&buf[..]).into_owned();
        buf.advance(buf.len());
        Ok(parse_line(&rest))
    }
}

/// `HH:MM` in UTC.
fn clock(timestamp: u64) -> String {
    let secs = timestamp % 86_400;
    format!("{:02}:{:02}", secs / 3600, secs % 3600 / 60)
}

/// Renders one event as a line, or nothing for events the user does not see.
pub fn format_event(event: &UiEvent, me: &str) -> Option<String> {
    match event {
        UiEvent::Received(packet) => {
            let at = clock(packet.timestamp);
            match packet.kind {
                Kind::Msg => Some(format!("[{}] {}: {}", at, packet.usrname, packet.text())),
                Kind::Whisper if packet.options == me => Some(format!(
                    "[{}] {} whispered: {}",
                    at,
                    packet.usrname,
                    packet.text()
                )),
                Kind::Join => Some(format!("[{}] {} joined", at, packet.usrname)),
                Kind::Exit => Some(format!("[{}] {} left", at, packet.usrname)),
                Kind::Disconnect => Some(format!("[{}] {} disconnected", at, packet.usrname)),
                _ => None,
            }
        }
        UiEvent::Sent(packet) => {
            let at = clock(packet.timestamp);
            match packet.kind {
                Kind::Msg => Some(format!("[{}] {}: {}", at, packet.usrname, packet.text())),
                Kind::Whisper => Some(format!(
                    "[{}] you whispered to {}: {}",
                    at,
                    packet.options,
                    packet.text()
                )),
                _ => None,
            }
        }
        UiEvent::Online(true) => Some("*** connected".to_string()),
        UiEvent::Online(false) => Some("*** connection lost, reconnecting...".to_string()),
        UiEvent::Notice(notice) => Some(format!("*** {}", notice)),
    }
}

/// Drains `events` into `out` until every sender is gone.
pub async fn render<W>(mut events: mpsc::Receiver<UiEvent>, me: String, mut out: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        if let Some(line) = format_event(&event, &me) {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
    }
    Ok(())
}
