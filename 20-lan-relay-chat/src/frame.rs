//! Payloads carried on the file channel.
//!
//! The stream itself is split into frames by [`LengthDelimitedCodec`]; this
//! module only interprets what is inside one frame. File frames are relayed
//! to other peers exactly as received, so the server never re-encodes them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

use crate::packet::SessionId;

/// Largest frame accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TAG_XML: u8 = 0;
const TAG_JSON: u8 = 1;
const TAG_ATTACH: u8 = 0xA0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Xml,
    Json,
}

impl FileType {
    pub fn flag(self) -> u8 {
        match self {
            FileType::Xml => TAG_XML,
            FileType::Json => TAG_JSON,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileType::Xml => "xml",
            FileType::Json => "json",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        if extension.eq_ignore_ascii_case("xml") {
            Some(FileType::Xml)
        } else if extension.eq_ignore_ascii_case("json") {
            Some(FileType::Json)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFrame {
    File { file_type: FileType, contents: Bytes },
    Attach(SessionId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("attach frame must carry 8 bytes, got {0}")]
    BadAttach(usize),
}

impl FileFrame {
    pub fn file(file_type: FileType, contents: impl Into<Bytes>) -> Self {
        FileFrame::File {
            file_type,
            contents: contents.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            FileFrame::File {
                file_type,
                contents,
            } => {
                let mut buf = BytesMut::with_capacity(1 + contents.len());
                buf.put_u8(file_type.flag());
                buf.put_slice(contents);
                buf.freeze()
            }
            FileFrame::Attach(session) => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(TAG_ATTACH);
                buf.put_u64_le(session.0);
                buf.freeze()
            }
        }
    }

    /// Parses a frame without copying the file contents.
    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }
        match frame.get_u8() {
            TAG_XML => Ok(FileFrame::file(FileType::Xml, frame)),
            TAG_JSON => Ok(FileFrame::file(FileType::Json, frame)),
            TAG_ATTACH if frame.len() == 8 => Ok(FileFrame::Attach(SessionId(frame.get_u64_le()))),
            TAG_ATTACH => Err(FrameError::BadAttach(frame.len())),
            tag => Err(FrameError::UnknownTag(tag)),
        }
    }
}

/// Codec used by both ends of the file channel.
pub fn file_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}
