//! Logical commands: what the user wants done, before framing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Unknown memory type: {0}")]
    UnknownMemoryKind(String),
    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

/// Command identifiers shared with the firmware dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    ReadMem,
    WriteMem,
    ReadReg,
    WriteReg,
    Ping,
    Reset,
    /// Host-side only, never framed.
    Exit,
    /// Host-side only, never framed.
    Help,
    Unknown(u8),
}

impl CommandId {
    pub const READ_MEM: u8 = 0x01;
    pub const WRITE_MEM: u8 = 0x02;
    pub const READ_REG: u8 = 0x03;
    pub const WRITE_REG: u8 = 0x04;
    pub const PING: u8 = 0x05;
    pub const RESET: u8 = 0x06;
    pub const EXIT: u8 = 0x07;
    pub const HELP: u8 = 0x08;

    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            Self::READ_MEM => Self::ReadMem,
            Self::WRITE_MEM => Self::WriteMem,
            Self::READ_REG => Self::ReadReg,
            Self::WRITE_REG => Self::WriteReg,
            Self::PING => Self::Ping,
            Self::RESET => Self::Reset,
            Self::EXIT => Self::Exit,
            Self::HELP => Self::Help,
            other => Self::Unknown(other),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::ReadMem => Self::READ_MEM,
            Self::WriteMem => Self::WRITE_MEM,
            Self::ReadReg => Self::READ_REG,
            Self::WriteReg => Self::WRITE_REG,
            Self::Ping => Self::PING,
            Self::Reset => Self::RESET,
            Self::Exit => Self::EXIT,
            Self::Help => Self::HELP,
            Self::Unknown(op) => *op,
        }
    }

    /// Symbolic name as used in the command table.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadMem => "READ_MEM",
            Self::WriteMem => "WRITE_MEM",
            Self::ReadReg => "READ_REG",
            Self::WriteReg => "WRITE_REG",
            Self::Ping => "PING",
            Self::Reset => "RESET",
            Self::Exit => "EXIT",
            Self::Help => "HELP",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Commands handled by the host that must never reach the wire.
    pub fn is_host_only(&self) -> bool {
        matches!(self, Self::Exit | Self::Help)
    }
}

impl FromStr for CommandId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "READ_MEM" => Ok(Self::ReadMem),
            "WRITE_MEM" => Ok(Self::WriteMem),
            "READ_REG" => Ok(Self::ReadReg),
            "WRITE_REG" => Ok(Self::WriteReg),
            "PING" => Ok(Self::Ping),
            "RESET" => Ok(Self::Reset),
            "EXIT" => Ok(Self::Exit),
            "HELP" => Ok(Self::Help),
            _ => Err(CommandError::UnknownCommand(s.to_string())),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(op) => write!(f, "UNKNOWN(0x{:02X})", op),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Memory space selector. The discriminant is the on-wire MEM_ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryKind {
    Ram = 0,
    Flash = 1,
    Eeprom = 2,
}

impl MemoryKind {
    pub fn mem_id(&self) -> u8 {
        *self as u8
    }

    pub fn from_mem_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Ram),
            1 => Some(Self::Flash),
            2 => Some(Self::Eeprom),
            _ => None,
        }
    }
}

impl FromStr for MemoryKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ram" | "sram" | "iram" => Ok(Self::Ram),
            "flash" | "prog" => Ok(Self::Flash),
            "eeprom" => Ok(Self::Eeprom),
            _ => Err(CommandError::UnknownMemoryKind(s.to_string())),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram => write!(f, "ram"),
            Self::Flash => write!(f, "flash"),
            Self::Eeprom => write!(f, "eeprom"),
        }
    }
}

/// A user-level request prior to framing.
///
/// `data` and `length` may disagree here; the validator rejects that, the
/// codec does not look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalCommand {
    pub name: String,
    pub opcode: u8,
    pub memory_kind: Option<MemoryKind>,
    pub address: u32,
    pub data: Option<Vec<u8>>,
    pub length: Option<u16>,
}

impl LogicalCommand {
    pub fn new(id: CommandId, address: u32) -> Self {
        Self {
            name: id.name().to_string(),
            opcode: id.opcode(),
            memory_kind: None,
            address,
            data: None,
            length: None,
        }
    }

    pub fn read_mem(kind: MemoryKind, address: u32, length: u16) -> Self {
        Self::new(CommandId::ReadMem, address)
            .with_memory(kind)
            .with_length(length)
    }

    /// Fails when `data` is too long for the 16-bit LENGTH field.
    pub fn write_mem(kind: MemoryKind, address: u32, data: Vec<u8>) -> Result<Self, CommandError> {
        let length = data_length(&data)?;
        Ok(Self::new(CommandId::WriteMem, address)
            .with_memory(kind)
            .with_length(length)
            .with_data(data))
    }

    pub fn read_reg(address: u32) -> Self {
        Self::new(CommandId::ReadReg, address)
    }

    pub fn ping() -> Self {
        Self::new(CommandId::Ping, 0)
    }

    pub fn with_memory(mut self, kind: MemoryKind) -> Self {
        self.memory_kind = Some(kind);
        self
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn id(&self) -> CommandId {
        CommandId::from_opcode(self.opcode)
    }

    /// Build a command from already-tokenized arguments.
    ///
    /// `address` is hex (with or without `0x`), `data` is a hex string
    /// without prefix.
    pub fn from_parts(
        name: &str,
        memory: Option<&str>,
        address: Option<&str>,
        length: Option<u16>,
        data: Option<&str>,
    ) -> Result<Self, CommandError> {
        let id: CommandId = name.parse()?;
        let address = match address {
            Some(text) => parse_hex_address(text)?,
            None => 0,
        };

        let mut command = Self::new(id, address);
        if let Some(mem) = memory {
            command.memory_kind = Some(mem.parse()?);
        }
        command.length = length;
        if let Some(hex) = data {
            command.data = Some(parse_hex_payload(hex)?);
        }
        Ok(command)
    }
}

impl fmt::Display for LogicalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ 0x{:08X}", self.name, self.address)?;
        if let Some(kind) = self.memory_kind {
            write!(f, " [{}]", kind)?;
        }
        if let Some(len) = self.length {
            write!(f, " len={}", len)?;
        }
        if let Some(data) = &self.data {
            write!(f, " data={}", to_hex(data))?;
        }
        Ok(())
    }
}

/// Length of a payload as carried in the 16-bit LENGTH field.
pub fn data_length(data: &[u8]) -> Result<u16, CommandError> {
    u16::try_from(data.len()).map_err(|_| {
        CommandError::MalformedInput(format!(
            "payload of {} bytes exceeds {} bytes",
            data.len(),
            u16::MAX
        ))
    })
}

fn is_hex(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse an address written in hex, `0x` prefix optional.
pub fn parse_hex_address(text: &str) -> Result<u32, CommandError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if !is_hex(digits) {
        return Err(CommandError::MalformedInput(format!(
            "address '{}' is not hex",
            text
        )));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|e| CommandError::MalformedInput(format!("address '{}': {}", text, e)))
}

/// Parse a hex byte string such as `DEADBEEF`.
pub fn parse_hex_payload(text: &str) -> Result<Vec<u8>, CommandError> {
    let text = text.trim();
    if !text.is_empty() && !is_hex(text) {
        return Err(CommandError::MalformedInput(format!(
            "invalid hex digit in '{}'",
            text
        )));
    }
    if text.len() % 2 != 0 {
        return Err(CommandError::MalformedInput(format!(
            "hex payload '{}' has an odd number of digits",
            text
        )));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| {
                CommandError::MalformedInput(format!("invalid hex byte in '{}'", text))
            })
        })
        .collect()
}

pub(crate) fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}
