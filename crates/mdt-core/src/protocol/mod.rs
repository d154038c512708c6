//! Protocol module - MDT frame definitions and codec.

pub mod chunk;
pub mod constants;
pub mod crc;
pub mod frame;

pub use chunk::{Chunk, SequenceCounter, chunk_command};
pub use constants::*;
pub use crc::crc16;
pub use frame::{EncodeError, Frame, FrameFlags, ProtocolError, decode_and_validate, encode};
