use thiserror::Error;

use crate::flv::FlvError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("FLV error: {0}")]
    FlvError(#[from] FlvError),

    #[error("Invalid buffer count: {0}")]
    InvalidBufferCount(usize),
}

pub type RelayResult<T> = Result<T, RelayError>;
