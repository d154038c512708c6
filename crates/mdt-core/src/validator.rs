//! Bounds checking of logical commands against device metadata.
//!
//! Only commands that touch memory or registers are accepted here. Anything
//! else is rejected, including opcodes this module does not know about.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::command::{CommandId, LogicalCommand, MemoryKind};
use crate::descriptor::DeviceMetadata;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{opcode} rejected: {reason}")]
    Rejected { opcode: CommandId, reason: String },
}

impl ValidationError {
    fn rejected(command: &LogicalCommand, reason: impl Into<String>) -> Self {
        ValidationError::Rejected {
            opcode: command.id(),
            reason: reason.into(),
        }
    }
}

/// What an accepted command resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationTarget {
    Memory {
        segment: String,
        kind: MemoryKind,
        start: u64,
        end: u64,
    },
    Register {
        module: String,
        group: String,
        register: String,
        address: u64,
    },
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub target: ValidationTarget,
    /// Non-fatal remarks the caller may want to surface.
    pub advisories: Vec<String>,
}

impl ValidationReport {
    fn new(target: ValidationTarget) -> Self {
        Self {
            target,
            advisories: Vec::new(),
        }
    }
}

/// Check `command` against `metadata`.
#[instrument(level = "debug", skip_all, fields(command = %command))]
pub fn validate(
    command: &LogicalCommand,
    metadata: &DeviceMetadata,
) -> Result<ValidationReport, ValidationError> {
    let report = match command.id() {
        CommandId::ReadMem => {
            let length = command
                .length
                .ok_or_else(|| ValidationError::rejected(command, "no length given"))?;
            check_memory(command, metadata, u64::from(length))?
        }
        CommandId::WriteMem => {
            let data = command
                .data
                .as_deref()
                .ok_or_else(|| ValidationError::rejected(command, "no data given"))?;
            let length = command.length.map_or(data.len(), usize::from);
            if length != data.len() {
                return Err(ValidationError::rejected(
                    command,
                    format!(
                        "length {} does not match {} data bytes",
                        length,
                        data.len()
                    ),
                ));
            }
            let mut report = check_memory(command, metadata, length as u64)?;
            if command.memory_kind == Some(MemoryKind::Flash) {
                report
                    .advisories
                    .push("flash programming may require a bootloader sequence".to_string());
            }
            report
        }
        CommandId::ReadReg => {
            let address = u64::from(command.address);
            let location = metadata.register_at(address).ok_or_else(|| {
                ValidationError::rejected(
                    command,
                    format!("no register covers 0x{:08X}", address),
                )
            })?;
            ValidationReport::new(ValidationTarget::Register {
                module: location.module.to_string(),
                group: location.group.to_string(),
                register: location.name.to_string(),
                address: location.address,
            })
        }
        CommandId::WriteReg => {
            return Err(ValidationError::rejected(
                command,
                "register writes are not permitted",
            ));
        }
        other => {
            return Err(ValidationError::rejected(
                command,
                format!("{} is not subject to address validation", other),
            ));
        }
    };
    debug!(resolved = ?report.target, "Command accepted");
    Ok(report)
}

/// Boolean form of [`validate`].
pub fn is_valid(command: &LogicalCommand, metadata: &DeviceMetadata) -> bool {
    validate(command, metadata).is_ok()
}

fn check_memory(
    command: &LogicalCommand,
    metadata: &DeviceMetadata,
    length: u64,
) -> Result<ValidationReport, ValidationError> {
    let kind = command
        .memory_kind
        .ok_or_else(|| ValidationError::rejected(command, "no memory type given"))?;
    let address = u64::from(command.address);

    let mut segments = metadata.memories_of_kind(kind).peekable();
    if segments.peek().is_none() {
        return Err(ValidationError::rejected(
            command,
            format!("device has no {} segment", kind),
        ));
    }

    segments
        .find(|(_, seg)| seg.contains_range(address, length))
        .map(|(name, seg)| {
            ValidationReport::new(ValidationTarget::Memory {
                segment: name.to_string(),
                kind,
                start: seg.start,
                end: seg.end(),
            })
        })
        .ok_or_else(|| {
            ValidationError::rejected(
                command,
                format!(
                    "0x{:08X}..0x{:08X} is outside every {} segment",
                    address,
                    address.saturating_add(length),
                    kind
                ),
            )
        })
}
