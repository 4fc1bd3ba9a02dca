//! Binary packet format spoken on the message channel.
//!
//! ```text
//! | kind u32 | sender len u32 | body len u32 | sender bytes | body bytes |
//! ```
//!
//! All integers are little-endian and both text fields are UTF-8. There is no
//! magic number or version, so decoding is strict: any length mismatch is an
//! error rather than a silently truncated field.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the three fixed `u32` headers.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Message,
    Login,
    Logout,
    /// Uninitialised sentinel. Never encoded and never accepted on decode.
    #[default]
    Null,
    /// Server-to-originator reply to a login, carrying the session id.
    Welcome,
}

impl PacketKind {
    pub fn ordinal(self) -> u32 {
        match self {
            PacketKind::Message => 0,
            PacketKind::Login => 1,
            PacketKind::Logout => 2,
            PacketKind::Null => 3,
            PacketKind::Welcome => 4,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        match ordinal {
            0 => Some(PacketKind::Message),
            1 => Some(PacketKind::Login),
            2 => Some(PacketKind::Logout),
            3 => Some(PacketKind::Null),
            4 => Some(PacketKind::Welcome),
            _ => None,
        }
    }
}

/// Identifier the server hands out at login so the file channel can be tied
/// back to a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet is {0} bytes, shorter than the 12 byte header")]
    ShortHeader(usize),
    #[error("unknown packet kind {0}")]
    UnknownKind(u32),
    #[error("null packets are never sent over the wire")]
    NullKind,
    #[error("{field} claims {claimed} bytes but only {available} remain")]
    Truncated {
        field: &'static str,
        claimed: usize,
        available: usize,
    },
    #[error("{0} unexpected bytes after the body")]
    TrailingBytes(usize),
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("{field} is {len} bytes, too long for a u32 length")]
    FieldTooLong { field: &'static str, len: usize },
}

impl Packet {
    pub fn new(kind: PacketKind, sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            body: body.into(),
        }
    }

    pub fn message(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(PacketKind::Message, sender, text)
    }

    pub fn login(sender: impl Into<String>) -> Self {
        Self::new(PacketKind::Login, sender, "")
    }

    pub fn logout(sender: impl Into<String>) -> Self {
        Self::new(PacketKind::Logout, sender, "")
    }

    pub fn welcome(sender: impl Into<String>, session: SessionId) -> Self {
        Self::new(PacketKind::Welcome, sender, session.to_string())
    }

    /// Session id carried by a Welcome packet, if this is one.
    pub fn session_id(&self) -> Option<SessionId> {
        if self.kind != PacketKind::Welcome {
            return None;
        }
        self.body.parse().ok().map(SessionId)
    }

    /// Size of the encoded packet in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.sender.len() + self.body.len()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.kind == PacketKind::Null {
            return Err(CodecError::NullKind);
        }

        let sender = self.sender.as_bytes();
        let body = self.body.as_bytes();
        let sender_len = wire_len("sender", sender)?;
        let body_len = wire_len("body", body)?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + sender.len() + body.len());
        buf.put_u32_le(self.kind.ordinal());
        buf.put_u32_le(sender_len);
        buf.put_u32_le(body_len);
        buf.put_slice(sender);
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::ShortHeader(buf.len()));
        }

        let ordinal = buf.get_u32_le();
        let kind = match PacketKind::from_ordinal(ordinal) {
            Some(PacketKind::Null) => return Err(CodecError::NullKind),
            Some(kind) => kind,
            None => return Err(CodecError::UnknownKind(ordinal)),
        };
        let sender_len = buf.get_u32_le() as usize;
        let body_len = buf.get_u32_le() as usize;

        let sender = take_text(&mut buf, "sender", sender_len)?;
        let body = take_text(&mut buf, "body", body_len)?;
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }

        Ok(Self { kind, sender, body })
    }
}

fn wire_len(field: &'static str, bytes: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: bytes.len(),
    })
}

fn take_text(buf: &mut &[u8], field: &'static str, len: usize) -> Result<String, CodecError> {
    if len > buf.remaining() {
        return Err(CodecError::Truncated {
            field,
            claimed: len,
            available: buf.remaining(),
        });
    }
    let remaining: &[u8] = *buf;
    let (text, rest) = remaining.split_at(len);
    *buf = rest;
    String::from_utf8(text.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}
