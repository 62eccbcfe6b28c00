//! Client-facing relay: event vocabulary, framing and the encoder that
//! drives them

pub mod encoder;
pub mod event;
pub mod frame;

pub use encoder::{RelayEncoder, RelayState};
pub use event::NormalizedEvent;
