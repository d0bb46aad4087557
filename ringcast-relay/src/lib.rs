pub mod errors;
pub mod flv;
pub mod relay;
pub mod ring;
pub mod viewer;

pub use errors::{RelayError, RelayResult};
pub use relay::Relay;
