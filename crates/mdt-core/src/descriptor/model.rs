//! Canonical device metadata.
//!
//! Both descriptor schemas are lowered into this one tree. It is built once
//! and never mutated afterwards, so it can be shared behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::command::MemoryKind;

/// A contiguous memory region of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySegment {
    pub start: u64,
    pub size: u64,
    pub kind: MemoryKind,
    pub page_size: Option<u64>,
}

impl MemorySegment {
    /// One past the last address of the segment.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// Whether `[address, address + length)` lies entirely inside.
    pub fn contains_range(&self, address: u64, length: u64) -> bool {
        address >= self.start && address.saturating_add(length) <= self.end()
    }
}

/// Register access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
    WriteOnce,
    ReadWriteOnce,
}

impl Access {
    pub fn is_readable(&self) -> bool {
        !matches!(self, Access::WriteOnly | Access::WriteOnce)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

impl FromStr for Access {
    type Err = String;

    /// Accepts both the short (`R`, `RW`) and the long (`read-write`) spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "read-only" | "readonly" => Ok(Access::ReadOnly),
            "w" | "write-only" | "writeonly" => Ok(Access::WriteOnly),
            "rw" | "read-write" | "readwrite" => Ok(Access::ReadWrite),
            "writeonce" | "write-once" => Ok(Access::WriteOnce),
            "read-writeonce" | "read-write-once" => Ok(Access::ReadWriteOnce),
            other => Err(format!("unknown access '{}'", other)),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::ReadOnly => write!(f, "read-only"),
            Access::WriteOnly => write!(f, "write-only"),
            Access::ReadWrite => write!(f, "read-write"),
            Access::WriteOnce => write!(f, "write-once"),
            Access::ReadWriteOnce => write!(f, "read-write-once"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumeratedValue {
    pub caption: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    pub caption: String,
    pub mask: u64,
    pub enumerated_values: BTreeMap<String, EnumeratedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Register {
    pub caption: String,
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    pub mask: Option<u64>,
    pub access: Access,
    pub bitfields: BTreeMap<String, Bitfield>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterGroup {
    pub name_in_module: String,
    pub caption: String,
    pub offset: u64,
    pub registers: BTreeMap<String, Register>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleInstance {
    pub name: String,
    /// Module-level register group this instance places.
    pub register_group_ref: Option<String>,
    pub offset: u64,
    pub address_space: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub caption: String,
    pub instances: Vec<ModuleInstance>,
    pub register_groups: BTreeMap<String, RegisterGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interrupt {
    pub index: u32,
    pub caption: String,
    pub owning_module_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeripheralInstance {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Peripheral {
    pub caption: String,
    pub instances: Vec<PeripheralInstance>,
}

/// A register resolved to its absolute address.
#[derive(Debug, Clone, Copy)]
pub struct RegisterLocation<'a> {
    pub module: &'a str,
    pub group: &'a str,
    pub name: &'a str,
    pub register: &'a Register,
    pub address: u64,
}

impl RegisterLocation<'_> {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.address.saturating_add(self.register.size)
    }
}

/// Everything the tool knows about one MCU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceMetadata {
    pub device_name: String,
    pub memories: BTreeMap<String, MemorySegment>,
    pub modules: BTreeMap<String, Module>,
    pub interrupts: BTreeMap<String, Interrupt>,
    pub peripherals: BTreeMap<String, Peripheral>,
}

impl DeviceMetadata {
    /// Memory segments of the given kind, by name.
    pub fn memories_of_kind(
        &self,
        kind: MemoryKind,
    ) -> impl Iterator<Item = (&str, &MemorySegment)> + '_ {
        self.memories
            .iter()
            .filter(move |(_, seg)| seg.kind == kind)
            .map(|(name, seg)| (name.as_str(), seg))
    }

    /// Every register of every module, at its absolute address.
    pub fn registers(&self) -> impl Iterator<Item = RegisterLocation<'_>> + '_ {
        self.modules.iter().flat_map(|(module_name, module)| {
            module
                .register_groups
                .iter()
                .flat_map(move |(group_name, group)| {
                    group
                        .registers
                        .iter()
                        .map(move |(reg_name, register)| RegisterLocation {
                            module: module_name.as_str(),
                            group: group_name.as_str(),
                            name: reg_name.as_str(),
                            register,
                            address: group.offset.saturating_add(register.offset),
                        })
                })
        })
    }

    /// First register whose extent covers `address`.
    pub fn register_at(&self, address: u64) -> Option<RegisterLocation<'_>> {
        self.registers().find(|loc| loc.contains(address))
    }

    pub fn register_count(&self) -> usize {
        self.registers().count()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty() && self.modules.is_empty()
    }
}
