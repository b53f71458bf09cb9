//! Wire codec: framing and typed (de)serialization

pub mod buffer;
pub mod frame;
pub mod message;

pub use buffer::{MessageBuffer, MessageReader, WireError, MAX_FRAME_SIZE};
pub use frame::{read_frame, to_wire, write_frame};
pub use message::*;
