//! FLV tags and an incremental tag reader.
//!
//! A tag on the wire is an 11-byte header, a payload of `data_size` bytes and
//! the 4-byte PreviousTagSize trailer that follows it, so a complete tag is
//! `data_size + 15` bytes. The reader assembles exactly one tag at a time
//! from a non-blocking source, carrying partial state across calls.

/*
 +--------------------------------------------------------------------------------+
 | Tag Type(1) | Data Size(3) | Timestamp(3) | Ts Ext(1) | Stream ID(3) | Payload |
 +--------------------------------------------------------------------------------+

 Video payload: FrameType(4 bits) | CodecID(4 bits) | ...
   frame type 1 = keyframe, codec id 7 = AVC (then payload[1] 0 = sequence header)
 Audio payload: SoundFormat(4 bits) | SoundRate(2) | SoundSize(1) | SoundType(1) | ...
   sound format 10 = AAC (then payload[1] 0 = sequence header)
*/

use std::io::{ErrorKind, Read};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};

/// The 13-byte FLV file header (9-byte header, audio+video flags, plus
/// PreviousTagSize0), sent verbatim to every joining viewer.
pub const FLV_FILE_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

pub mod tag_type {
    pub const AUDIO: u8 = 0x08;
    pub const VIDEO: u8 = 0x09;
    pub const SCRIPT: u8 = 0x12;
}

#[derive(Debug, thiserror::Error)]
pub enum FlvError {
    #[error("invalid tag type {0:#04x}")]
    InvalidTagType(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One complete FLV tag, header and PreviousTagSize trailer included.
#[derive(Debug, Clone)]
pub struct Tag {
    pub data: Bytes,
}

impl Tag {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The tag type byte: `0x08` audio, `0x09` video, `0x12` script data.
    #[must_use]
    pub fn packtype(&self) -> u8 {
        self.data[0]
    }

    /// The first byte after the 11-byte header; carries the codec nibbles.
    #[must_use]
    pub fn codec_tag(&self) -> u8 {
        self.payload().first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[11..self.data.len() - 4]
    }

    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.packtype() == tag_type::VIDEO
            && self.payload().first().map_or(false, |b| b >> 4 == 1)
    }

    /// Tag timestamp in milliseconds.
    #[must_use]
    pub fn tag_time(&self) -> u32 {
        BigEndian::read_u24(&self.data[4..7]) | (u32::from(self.data[7]) << 24)
    }

    /// A copy of this tag with the timestamp rewritten.
    #[must_use]
    pub fn with_time(&self, ms: u32) -> Tag {
        let mut data = BytesMut::from(&self.data[..]);
        data[4] = (ms >> 16) as u8;
        data[5] = (ms >> 8) as u8;
        data[6] = ms as u8;
        data[7] = (ms >> 24) as u8;
        Tag {
            data: data.freeze(),
        }
    }
}

/// Encodes one complete tag: header, payload and PreviousTagSize trailer.
#[must_use]
pub fn encode_tag(tag_type: u8, timestamp: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 15);
    out.extend_from_slice(&[
        tag_type,
        (payload.len() >> 16) as u8,
        (payload.len() >> 8) as u8,
        payload.len() as u8,
        (timestamp >> 16) as u8,
        (timestamp >> 8) as u8,
        timestamp as u8,
        (timestamp >> 24) as u8,
        0,
        0,
        0,
    ]);
    out.extend_from_slice(payload);
    out.extend_from_slice(&(payload.len() as u32 + 11).to_be_bytes());
    out.freeze()
}

/// Result of one [`TagReader::load_from`] call.
#[derive(Debug)]
pub enum TagOutcome {
    /// A complete tag was assembled.
    Tag(Tag),
    /// The source would block; retry next tick.
    Pending,
    /// The source reached end of input.
    Eof,
}

/// Assembles FLV tags one at a time from a non-blocking byte source.
#[derive(Default)]
pub struct TagReader {
    buf: BytesMut,
    /// Until the first tag, the stream may lead with the 13-byte file header.
    at_start: bool,
}

impl TagReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            at_start: true,
        }
    }

    /// Reads from `src` until one complete tag is assembled, the source would
    /// block, or it reaches end of input. Never reads past the current tag.
    pub fn load_from(&mut self, src: &mut dyn Read) -> Result<TagOutcome, FlvError> {
        loop {
            if let Some(tag) = self.extract()? {
                return Ok(TagOutcome::Tag(tag));
            }
            let mut chunk = vec![0u8; self.needed()];
            match src.read(&mut chunk) {
                Ok(0) => return Ok(TagOutcome::Eof),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(TagOutcome::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(FlvError::Io(e)),
            }
        }
    }

    /// Bytes still missing before the next parse step can happen.
    fn needed(&self) -> usize {
        if self.at_start {
            return 13usize.saturating_sub(self.buf.len()).max(1);
        }
        if self.buf.len() < 11 {
            return 11 - self.buf.len();
        }
        Self::total_len(&self.buf).saturating_sub(self.buf.len()).max(1)
    }

    fn total_len(buf: &[u8]) -> usize {
        BigEndian::read_u24(&buf[1..4]) as usize + 15
    }

    fn extract(&mut self) -> Result<Option<Tag>, FlvError> {
        if self.at_start {
            if self.buf.len() < 3 {
                return Ok(None);
            }
            if &self.buf[..3] == b"FLV" {
                if self.buf.len() < 13 {
                    return Ok(None);
                }
                self.buf.advance(13);
            }
            self.at_start = false;
        }
        if self.buf.len() < 11 {
            return Ok(None);
        }
        let kind = self.buf[0];
        if kind != tag_type::AUDIO && kind != tag_type::VIDEO && kind != tag_type::SCRIPT {
            return Err(FlvError::InvalidTagType(kind));
        }
        let total = Self::total_len(&self.buf);
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(Tag {
            data: self.buf.split_to(total).freeze(),
        }))
    }
}
