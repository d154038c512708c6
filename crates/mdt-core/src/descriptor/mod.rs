//! Device descriptor ingestion.
//!
//! Two vendor XML schemas are supported, each behind a [`DescriptorParser`]:
//!
//! - `atdf`: attribute-centric chip descriptions (AVR family)
//! - `svd`: element-centric register maps (Arm family)
//!
//! [`build_device_metadata`] picks the parser from the target [`Platform`].

pub mod atdf;
pub mod model;
pub mod svd;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use atdf::AtdfParser;
pub use model::{
    Access, Bitfield, DeviceMetadata, EnumeratedValue, Interrupt, MemorySegment, Module,
    ModuleInstance, Peripheral, PeripheralInstance, Register, RegisterGroup, RegisterLocation,
};
pub use svd::SvdParser;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("No {extension} descriptor for '{mcu}' under {root}")]
    NotFound {
        mcu: String,
        extension: &'static str,
        root: PathBuf,
    },
    #[error("Malformed descriptor {path}: {message}")]
    MalformedInput { path: PathBuf, message: String },
    #[error("Descriptor {path} describes '{found}', expected '{expected}'")]
    DeviceMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("Descriptor parsing not implemented for platform {0}")]
    NotImplemented(Platform),
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Target platform family, as declared in the build descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Avr,
    Arm,
    Riscv,
}

impl FromStr for Platform {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avr" => Ok(Platform::Avr),
            "arm" | "cortex-m" => Ok(Platform::Arm),
            "riscv" | "risc-v" => Ok(Platform::Riscv),
            other => Err(DescriptorError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Avr => write!(f, "avr"),
            Platform::Arm => write!(f, "arm"),
            Platform::Riscv => write!(f, "riscv"),
        }
    }
}

/// Produces canonical metadata for one MCU from a descriptor collection.
pub trait DescriptorParser {
    /// File extension (without dot) this parser reads.
    fn extension(&self) -> &'static str;

    /// Parse already-loaded descriptor text.
    fn parse_str(
        &self,
        text: &str,
        mcu_name: &str,
        path: &Path,
    ) -> Result<DeviceMetadata, DescriptorError>;

    /// Locate the descriptor for `mcu_name` under `root` and parse it.
    fn parse(&self, root: &Path, mcu_name: &str) -> Result<DeviceMetadata, DescriptorError> {
        let path = find_descriptor(root, mcu_name, self.extension())?;
        info!(path = %path.display(), mcu = mcu_name, "Loading device descriptor");
        let text = fs::read_to_string(&path).map_err(|source| DescriptorError::Io {
            path: path.clone(),
            source,
        })?;
        self.parse_str(&text, mcu_name, &path)
    }
}

/// Build the metadata for `mcu_name` using the parser for `platform`.
#[instrument(skip(descriptor_root), fields(root = %descriptor_root.as_ref().display()))]
pub fn build_device_metadata(
    mcu_name: &str,
    platform: Platform,
    descriptor_root: impl AsRef<Path>,
) -> Result<DeviceMetadata, DescriptorError> {
    let root = descriptor_root.as_ref();
    let metadata = match platform {
        Platform::Avr => AtdfParser.parse(root, mcu_name)?,
        Platform::Arm => SvdParser.parse(root, mcu_name)?,
        Platform::Riscv => return Err(DescriptorError::NotImplemented(platform)),
    };
    info!(
        device = %metadata.device_name,
        memories = metadata.memories.len(),
        modules = metadata.modules.len(),
        registers = metadata.register_count(),
        interrupts = metadata.interrupts.len(),
        "Device metadata built"
    );
    Ok(metadata)
}

/// Recursively search `root` for `<mcu_name>.<extension>`, ignoring case.
pub fn find_descriptor(
    root: &Path,
    mcu_name: &str,
    extension: &'static str,
) -> Result<PathBuf, DescriptorError> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        let mut entries: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                pending.push(path);
            } else if matches_descriptor(&path, mcu_name, extension) {
                return Ok(path);
            }
        }
    }
    Err(DescriptorError::NotFound {
        mcu: mcu_name.to_string(),
        extension,
        root: root.to_path_buf(),
    })
}

fn matches_descriptor(path: &Path, mcu_name: &str, extension: &str) -> bool {
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension));
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.eq_ignore_ascii_case(mcu_name));
    ext_ok && stem_ok
}

/// Parse an integer with base auto-detection: `0x`, `0o`, `0b` or decimal.
pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        lower.parse().ok()
    }
}

pub(crate) fn malformed(path: &Path, message: impl Into<String>) -> DescriptorError {
    DescriptorError::MalformedInput {
        path: path.to_path_buf(),
        message: message.into(),
    }
}
