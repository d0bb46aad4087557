//! Shared wire-format constants.
//!
//! A DTSC byte stream (and a DTSC file) is a sequence of frames, each
//! `magic(4) | size(4, big-endian) | payload(size)`. Three magics exist:
//! `DTSC` carries a metadata header, `DTPD` a v1 payload and `DTP2` a v2
//! payload. v2 payloads additionally lead with `trackid(4) | timestamp(8)`
//! before the DTMI-encoded body, which is what makes files seekable by
//! scanning 20-byte packet prefixes.

/// Magic for metadata header frames.
pub const MAGIC_HEADER: &[u8; 4] = b"DTSC";
/// Magic for v1 payload frames.
pub const MAGIC_PACKET: &[u8; 4] = b"DTPD";
/// Magic for v2 payload frames.
pub const MAGIC_PACKET2: &[u8; 4] = b"DTP2";

/// Bytes of `magic | size` in front of every frame.
pub const FRAME_PREFIX: usize = 8;

/// Fragments group consecutive keyframes until at least this much media time
/// has accumulated.
pub const FRAGMENT_DURATION_MS: i64 = 10_000;

/// Classification of the most recently parsed payload, derived from its
/// `datatype` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataKind {
    Video,
    Audio,
    Meta,
    PauseMark,
    #[default]
    Invalid,
}

impl DataKind {
    #[must_use]
    pub fn from_datatype(datatype: &[u8]) -> Self {
        match datatype {
            b"video" => Self::Video,
            b"audio" => Self::Audio,
            b"meta" => Self::Meta,
            b"pause_marker" => Self::PauseMark,
            _ => Self::Invalid,
        }
    }
}
