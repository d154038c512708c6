//! Splitting a logical command into frame-sized chunks.

use super::constants::{DATA_SIZE, FRAME_SIZE, SEQUENCE_MODULUS};
use super::frame::{EncodeError, encode};
use crate::command::LogicalCommand;

/// One frame's worth of a logical command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub command: LogicalCommand,
    pub sequence: u8,
    pub is_multi: bool,
    pub is_last: bool,
}

impl Chunk {
    pub fn encode(&self) -> Result<[u8; FRAME_SIZE], EncodeError> {
        encode(&self.command, self.sequence, self.is_multi, self.is_last)
    }
}

/// Frame sequence counter.
///
/// Wraps modulo 0xFF, matching the firmware; 0xFF itself never appears.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&mut self) -> u8 {
        let seq = self.next;
        self.next = ((seq as u16 + 1) % SEQUENCE_MODULUS as u16) as u8;
        seq
    }
}

/// Split `command` into 4-byte chunks, one per frame.
///
/// Commands without payload pass through as a single non-multi chunk.
pub fn chunk_command(command: &LogicalCommand) -> Vec<Chunk> {
    let payload = match command.data.as_deref() {
        Some(data) if !data.is_empty() => data,
        _ => {
            return vec![Chunk {
                command: command.clone(),
                sequence: 0,
                is_multi: false,
                is_last: false,
            }];
        }
    };

    let total = payload.len().div_ceil(DATA_SIZE);
    let mut counter = SequenceCounter::new();

    payload
        .chunks(DATA_SIZE)
        .enumerate()
        .map(|(index, part)| {
            let mut data = part.to_vec();
            data.resize(DATA_SIZE, 0);

            let mut chunk_cmd = command.clone();
            chunk_cmd.address = command
                .address
                .wrapping_add((index * DATA_SIZE) as u32);
            chunk_cmd.data = Some(data);
            chunk_cmd.length = Some(DATA_SIZE as u16);

            Chunk {
                command: chunk_cmd,
                sequence: counter.next_seq(),
                is_multi: true,
                is_last: index + 1 == total,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MemoryKind;
    use crate::protocol::frame::decode_and_validate;

    #[test]
    fn test_no_payload_passthrough() {
        let cmd = LogicalCommand::read_mem(MemoryKind::Ram, 0x100, 16);
        let chunks = chunk_command(&cmd);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].command, cmd);
        assert_eq!(chunks[0].sequence, 0);
        assert!(!chunks[0].is_multi);
        assert!(!chunks[0].is_last);

        let empty = cmd.clone().with_data(Vec::new());
        assert_eq!(chunk_command(&empty)[0].command, empty);
    }

    #[test]
    fn test_eleven_bytes() {
        let data: Vec<u8> = (1..=11).collect();
        let cmd = LogicalCommand::write_mem(MemoryKind::Ram, 0x1000, data).unwrap();
        let chunks = chunk_command(&cmd);

        assert_eq!(chunks.len(), 3);
        let addresses: Vec<u32> = chunks.iter().map(|c| c.command.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x1004, 0x1008]);
        assert_eq!(chunks[2].command.data.as_deref(), Some(&[9, 10, 11, 0][..]));
        assert_eq!(
            chunks.iter().map(|c| c.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert!(chunks.iter().all(|c| c.is_multi));
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_single_aligned_chunk_is_multi_and_last() {
        let cmd = LogicalCommand::write_mem(MemoryKind::Eeprom, 0, vec![1, 2, 3, 4]).unwrap();
        let chunks = chunk_command(&cmd);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_multi);
        assert!(chunks[0].is_last);
    }

    #[test]
    fn test_sequence_wraps_mod_0xff() {
        let cmd =
            LogicalCommand::write_mem(MemoryKind::Ram, 0, vec![0xA5; 300 * DATA_SIZE]).unwrap();
        let chunks = chunk_command(&cmd);
        assert_eq!(chunks.len(), 300);

        assert_eq!(chunks[254].sequence, 254);
        assert_eq!(chunks[255].sequence, 0);
        assert_eq!(chunks[299].sequence, 44);
        assert!(chunks.iter().all(|c| c.sequence != 0xFF));
    }

    #[test]
    fn test_chunks_encode_and_validate() {
        let cmd = LogicalCommand::write_mem(MemoryKind::Flash, 0x200, (0..10).collect()).unwrap();
        for chunk in chunk_command(&cmd) {
            let bytes = chunk.encode().unwrap();
            let frame = decode_and_validate(&bytes).unwrap();
            assert_eq!(frame.address, chunk.command.address);
            assert_eq!(frame.length, 4);
        }
    }
}
