//! 18-byte frame encoding and response validation.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::constants::*;
use super::crc::crc16;
use crate::command::{LogicalCommand, to_hex};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Payload chunk is {actual} bytes, frame carries at most {max}")]
    PayloadTooLong { actual: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame length error: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("Framing error: start=0x{start:02X} end=0x{end:02X}")]
    Framing { start: u8, end: u8 },
    #[error("Checksum error: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    Checksum { received: u16, computed: u16 },
    #[error("Length field {length} exceeds the {max}-byte payload")]
    LengthField { length: u16, max: usize },
    #[error("Device reported an error for command 0x{cmd_id:02X} (seq {seq})")]
    DeviceStatus { cmd_id: u8, seq: u8 },
}

/// FLAGS byte of a frame.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const MEM_ID_PRESENT: u8 = 0x01;
    pub const LENGTH_PRESENT: u8 = 0x02;
    /// Set by the receiver.
    pub const ACK_NACK: u8 = 0x04;
    pub const SEQ_PRESENT: u8 = 0x08;
    pub const LAST_PACKET: u8 = 0x10;
    /// Set by the receiver when the command failed on the device.
    pub const STATUS_ERROR: u8 = 0x20;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Flags a sender puts on a command frame.
    pub fn for_command(has_memory: bool, is_multi: bool, is_last: bool) -> Self {
        let mut flags = Self(Self::LENGTH_PRESENT);
        if has_memory {
            flags.set(Self::MEM_ID_PRESENT);
        }
        if is_multi {
            flags.set(Self::SEQ_PRESENT);
            if is_last {
                flags.set(Self::LAST_PACKET);
            }
        }
        flags
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (FrameFlags::MEM_ID_PRESENT, "MEM"),
            (FrameFlags::LENGTH_PRESENT, "LEN"),
            (FrameFlags::ACK_NACK, "ACK"),
            (FrameFlags::SEQ_PRESENT, "SEQ"),
            (FrameFlags::LAST_PACKET, "LAST"),
            (FrameFlags::STATUS_ERROR, "ERR"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "FrameFlags(0x{:02X} [{}])", self.0, set.join("|"))
    }
}

/// A decoded, validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd_id: u8,
    pub flags: FrameFlags,
    pub seq: u8,
    pub mem_id: u8,
    pub address: u32,
    pub length: u16,
    pub data: [u8; DATA_SIZE],
    pub crc: u16,
}

impl Frame {
    pub fn is_ack(&self) -> bool {
        self.flags.contains(FrameFlags::ACK_NACK)
    }

    pub fn is_last(&self) -> bool {
        self.flags.contains(FrameFlags::LAST_PACKET)
    }

    pub fn has_sequence(&self) -> bool {
        self.flags.contains(FrameFlags::SEQ_PRESENT)
    }

    /// The payload bytes the LENGTH field marks as meaningful.
    pub fn payload(&self) -> &[u8] {
        let len = (self.length as usize).min(DATA_SIZE);
        &self.data[..len]
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd=0x{:02X} seq={} mem={} addr=0x{:08X} len={} data={}",
            self.cmd_id,
            self.seq,
            self.mem_id,
            self.address,
            self.length,
            to_hex(&self.data)
        )
    }
}

/// Encode one command (or one chunk of one) into a wire frame.
pub fn encode(
    command: &LogicalCommand,
    sequence: u8,
    is_multi: bool,
    is_last: bool,
) -> Result<[u8; FRAME_SIZE], EncodeError> {
    let payload = command.data.as_deref().unwrap_or(&[]);
    if payload.len() > DATA_SIZE {
        return Err(EncodeError::PayloadTooLong {
            actual: payload.len(),
            max: DATA_SIZE,
        });
    }
    let mut data = [0u8; DATA_SIZE];
    data[..payload.len()].copy_from_slice(payload);

    let flags = FrameFlags::for_command(command.memory_kind.is_some(), is_multi, is_last);
    let mem_id = command.memory_kind.map(|k| k.mem_id()).unwrap_or(0);
    let length = command.length.unwrap_or(0).min(DATA_SIZE as u16);

    // Writes into a Vec cannot fail.
    let mut buf = Vec::with_capacity(FRAME_SIZE);
    buf.push(START_BYTE);
    buf.push(command.opcode);
    buf.push(flags.bits());
    buf.push(sequence);
    buf.push(mem_id);
    buf.write_u32::<LittleEndian>(command.address).unwrap();
    buf.write_u16::<LittleEndian>(length).unwrap();
    buf.extend_from_slice(&data);
    let crc = crc16(&buf[CRC_RANGE]);
    buf.write_u16::<LittleEndian>(crc).unwrap();
    buf.push(END_BYTE);

    let mut frame = [0u8; FRAME_SIZE];
    frame.copy_from_slice(&buf);
    Ok(frame)
}

/// Check a received frame and parse its fields.
///
/// Checks run in wire order: size, START/END, CRC, LENGTH sanity, then the
/// device status flag.
pub fn decode_and_validate(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() != FRAME_SIZE {
        return Err(ProtocolError::Length {
            expected: FRAME_SIZE,
            actual: bytes.len(),
        });
    }

    let start = bytes[OFFSET_START];
    let end = bytes[OFFSET_END];
    if start != START_BYTE || end != END_BYTE {
        return Err(ProtocolError::Framing { start, end });
    }

    let received = u16::from_le_bytes([bytes[OFFSET_CRC], bytes[OFFSET_CRC + 1]]);
    let computed = crc16(&bytes[CRC_RANGE]);
    if received != computed {
        return Err(ProtocolError::Checksum { received, computed });
    }

    let frame = parse_fields(bytes, received).map_err(|_| ProtocolError::Length {
        expected: FRAME_SIZE,
        actual: bytes.len(),
    })?;

    if frame.length as usize > DATA_SIZE {
        return Err(ProtocolError::LengthField {
            length: frame.length,
            max: DATA_SIZE,
        });
    }

    if frame.flags.contains(FrameFlags::STATUS_ERROR) {
        return Err(ProtocolError::DeviceStatus {
            cmd_id: frame.cmd_id,
            seq: frame.seq,
        });
    }

    Ok(frame)
}

fn parse_fields(bytes: &[u8], crc: u16) -> std::io::Result<Frame> {
    let mut cursor = Cursor::new(&bytes[OFFSET_CMD_ID..OFFSET_CRC]);
    let cmd_id = cursor.read_u8()?;
    let flags = FrameFlags::from_bits(cursor.read_u8()?);
    let seq = cursor.read_u8()?;
    let mem_id = cursor.read_u8()?;
    let address = cursor.read_u32::<LittleEndian>()?;
    let length = cursor.read_u16::<LittleEndian>()?;
    let mut data = [0u8; DATA_SIZE];
    std::io::Read::read_exact(&mut cursor, &mut data)?;
    Ok(Frame {
        cmd_id,
        flags,
        seq,
        mem_id,
        address,
        length,
        data,
        crc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandId, MemoryKind};

    fn sample() -> LogicalCommand {
        LogicalCommand::write_mem(MemoryKind::Ram, 0x0100_0200, vec![0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let frame = encode(&sample(), 7, true, false).unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(frame[OFFSET_START], START_BYTE);
        assert_eq!(frame[OFFSET_CMD_ID], CommandId::WRITE_MEM);
        assert_eq!(
            frame[OFFSET_FLAGS],
            FrameFlags::MEM_ID_PRESENT | FrameFlags::LENGTH_PRESENT | FrameFlags::SEQ_PRESENT
        );
        assert_eq!(frame[OFFSET_SEQ], 7);
        assert_eq!(frame[OFFSET_MEM_ID], 0);
        assert_eq!(&frame[OFFSET_ADDRESS..OFFSET_LENGTH], &[0x00, 0x02, 0x00, 0x01]);
        assert_eq!(&frame[OFFSET_LENGTH..OFFSET_DATA], &[0x04, 0x00]);
        assert_eq!(&frame[OFFSET_DATA..OFFSET_CRC], &[0xDE, 0xAD, 0xBE, 0xEF]);
        let crc = crc16(&frame[1..15]);
        assert_eq!(&frame[OFFSET_CRC..OFFSET_END], &crc.to_le_bytes());
        assert_eq!(frame[OFFSET_END], END_BYTE);
    }

    #[test]
    fn test_length_field_clamped() {
        let cmd = LogicalCommand::read_mem(MemoryKind::Flash, 0, 0x100);
        let frame = encode(&cmd, 0, false, false).unwrap();
        assert_eq!(&frame[OFFSET_LENGTH..OFFSET_DATA], &[0x04, 0x00]);
        assert_eq!(&frame[OFFSET_DATA..OFFSET_CRC], &[0, 0, 0, 0]);

        let ping = LogicalCommand::ping();
        let frame = encode(&ping, 0, false, false).unwrap();
        assert_eq!(frame[OFFSET_FLAGS], FrameFlags::LENGTH_PRESENT);
        assert_eq!(&frame[OFFSET_LENGTH..OFFSET_DATA], &[0x00, 0x00]);
    }

    #[test]
    fn test_short_payload_padded() {
        let cmd = LogicalCommand::write_mem(MemoryKind::Eeprom, 0x10, vec![0x11, 0x22]).unwrap();
        let frame = encode(&cmd, 0, false, false).unwrap();
        assert_eq!(&frame[OFFSET_DATA..OFFSET_CRC], &[0x11, 0x22, 0x00, 0x00]);
        assert_eq!(frame[OFFSET_MEM_ID], 2);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cmd = LogicalCommand::write_mem(MemoryKind::Ram, 0, vec![0; 5]).unwrap();
        assert_eq!(
            encode(&cmd, 0, false, false),
            Err(EncodeError::PayloadTooLong { actual: 5, max: 4 })
        );
    }

    #[test]
    fn test_last_flag_only_with_multi() {
        let frame = encode(&sample(), 3, true, true).unwrap();
        let flags = FrameFlags::from_bits(frame[OFFSET_FLAGS]);
        assert!(flags.contains(FrameFlags::SEQ_PRESENT));
        assert!(flags.contains(FrameFlags::LAST_PACKET));

        let single = encode(&sample(), 0, false, true).unwrap();
        let flags = FrameFlags::from_bits(single[OFFSET_FLAGS]);
        assert!(!flags.contains(FrameFlags::SEQ_PRESENT));
        assert!(!flags.contains(FrameFlags::LAST_PACKET));
    }

    #[test]
    fn test_roundtrip_all_sequences() {
        let cmd = sample();
        for seq in 0..=254u8 {
            let bytes = encode(&cmd, seq, true, seq == 254).unwrap();
            let frame = decode_and_validate(&bytes).unwrap();
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.cmd_id, CommandId::WRITE_MEM);
            assert_eq!(frame.address, 0x0100_0200);
            assert_eq!(frame.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
            assert!(!frame.flags.contains(FrameFlags::STATUS_ERROR));
            assert_eq!(frame.is_last(), seq == 254);
        }
    }

    #[test]
    fn test_single_bit_flip_in_covered_bytes() {
        let bytes = encode(&sample(), 9, true, false).unwrap();
        for offset in CRC_RANGE {
            for bit in 0..8 {
                let mut corrupted = bytes;
                corrupted[offset] ^= 1 << bit;
                assert!(
                    matches!(
                        decode_and_validate(&corrupted),
                        Err(ProtocolError::Checksum { .. })
                    ),
                    "offset {} bit {} not detected",
                    offset,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_single_bit_flip_in_crc_field() {
        let bytes = encode(&sample(), 1, false, false).unwrap();
        for offset in OFFSET_CRC..OFFSET_END {
            for bit in 0..8 {
                let mut corrupted = bytes;
                corrupted[offset] ^= 1 << bit;
                assert!(matches!(
                    decode_and_validate(&corrupted),
                    Err(ProtocolError::Checksum { .. })
                ));
            }
        }
    }

    #[test]
    fn test_wrong_size() {
        let bytes = encode(&sample(), 0, false, false).unwrap();
        assert_eq!(
            decode_and_validate(&bytes[..17]),
            Err(ProtocolError::Length {
                expected: 18,
                actual: 17
            })
        );
        assert!(matches!(
            decode_and_validate(&[]),
            Err(ProtocolError::Length { actual: 0, .. })
        ));
    }

    #[test]
    fn test_bad_delimiters() {
        let mut bytes = encode(&sample(), 0, false, false).unwrap();
        bytes[OFFSET_START] = LEGACY_START_BYTE;
        assert!(matches!(
            decode_and_validate(&bytes),
            Err(ProtocolError::Framing { start: 0x7E, .. })
        ));

        let mut bytes = encode(&sample(), 0, false, false).unwrap();
        bytes[OFFSET_END] = LEGACY_END_BYTE;
        assert!(matches!(
            decode_and_validate(&bytes),
            Err(ProtocolError::Framing { end: 0x7F, .. })
        ));
    }

    /// Re-seal a frame after editing it, as the MCU would.
    fn reseal(bytes: &mut [u8; FRAME_SIZE]) {
        let crc = crc16(&bytes[CRC_RANGE]);
        bytes[OFFSET_CRC..OFFSET_END].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_device_status_error() {
        let mut bytes = encode(&sample(), 4, false, false).unwrap();
        bytes[OFFSET_FLAGS] |= FrameFlags::STATUS_ERROR;
        reseal(&mut bytes);
        assert_eq!(
            decode_and_validate(&bytes),
            Err(ProtocolError::DeviceStatus {
                cmd_id: CommandId::WRITE_MEM,
                seq: 4
            })
        );
    }

    #[test]
    fn test_ack_response_accepted() {
        let mut bytes = encode(&sample(), 0, false, false).unwrap();
        bytes[OFFSET_FLAGS] |= FrameFlags::ACK_NACK;
        reseal(&mut bytes);
        let frame = decode_and_validate(&bytes).unwrap();
        assert!(frame.is_ack());
    }

    #[test]
    fn test_length_field_out_of_range() {
        let mut bytes = encode(&sample(), 0, false, false).unwrap();
        bytes[OFFSET_LENGTH] = 5;
        reseal(&mut bytes);
        assert_eq!(
            decode_and_validate(&bytes),
            Err(ProtocolError::LengthField { length: 5, max: 4 })
        );
    }
}
