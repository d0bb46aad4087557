pub mod bytesio;
pub mod define;
pub mod errors;
pub mod file;
pub mod live;
pub mod value;

pub use define::DataKind;
pub use errors::{DtscError, DtscErrorValue};
pub use file::{FileStore, SeekPos};
pub use live::{LiveStream, Ring, RingId};
pub use value::Value;
