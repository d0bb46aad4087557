use std::io;

use crate::bytesio::BytesReadError;

#[derive(Debug, thiserror::Error)]
pub enum DtscErrorValue {
    #[error("not enough bytes to read")]
    NotEnoughBytes,
    #[error("unknown DTMI type marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("invalid frame magic {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("header size mismatch: file has {existing} bytes, new header has {new}")]
    HeaderSizeMismatch { existing: usize, new: usize },
    #[error("bytes read error: {0}")]
    BytesReadError(BytesReadError),
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct DtscError {
    pub value: DtscErrorValue,
}

impl From<DtscErrorValue> for DtscError {
    fn from(value: DtscErrorValue) -> Self {
        Self { value }
    }
}

impl From<io::Error> for DtscError {
    fn from(error: io::Error) -> Self {
        Self {
            value: DtscErrorValue::Io(error),
        }
    }
}

impl From<BytesReadError> for DtscError {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: DtscErrorValue::BytesReadError(error),
        }
    }
}
