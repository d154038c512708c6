//! Protocol constants for the MDT serial frame.
//!
//! Every frame on the wire is exactly [`FRAME_SIZE`] bytes. Multi-byte fields
//! are little-endian.

// ============================================================================
// Framing
// ============================================================================

/// First byte of every command/response frame.
pub const START_BYTE: u8 = 0xAA;

/// Last byte of every command/response frame.
pub const END_BYTE: u8 = 0x55;

/// Legacy start byte. Declared by older firmware headers, never emitted.
pub const LEGACY_START_BYTE: u8 = 0x7E;

/// Legacy end byte. Declared by older firmware headers, never emitted.
pub const LEGACY_END_BYTE: u8 = 0x7F;

/// Fixed frame length in bytes.
pub const FRAME_SIZE: usize = 18;

/// Payload bytes carried by a single frame.
pub const DATA_SIZE: usize = 4;

// ============================================================================
// Field offsets
// ============================================================================

pub const OFFSET_START: usize = 0;
pub const OFFSET_CMD_ID: usize = 1;
pub const OFFSET_FLAGS: usize = 2;
pub const OFFSET_SEQ: usize = 3;
pub const OFFSET_MEM_ID: usize = 4;
pub const OFFSET_ADDRESS: usize = 5;
pub const OFFSET_LENGTH: usize = 9;
pub const OFFSET_DATA: usize = 11;
pub const OFFSET_CRC: usize = 15;
pub const OFFSET_END: usize = 17;

/// CRC covers CMD_ID up to (not including) the CRC field.
pub const CRC_RANGE: std::ops::Range<usize> = OFFSET_CMD_ID..OFFSET_CRC;

// ============================================================================
// Sequencing
// ============================================================================

/// Sequence numbers wrap with this modulus, so 0xFF is never emitted.
pub const SEQUENCE_MODULUS: u8 = 0xFF;
