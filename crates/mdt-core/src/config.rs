//! Build descriptor: which board, which port, where the device files live.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::descriptor::Platform;
use crate::protocol::EncodeError;
use crate::transport::{LinkSettings, SessionSettings};

/// Configuration for one target board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Serial port name, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    /// MCU name, matched against descriptor file stems.
    pub mcu: String,
    pub platform: Platform,
    /// Directory searched recursively for `.atdf` / `.svd` files.
    pub descriptor_root: PathBuf,
    /// Settle time after opening the port, for boards that reset on connect.
    pub reset_delay_ms: u64,
    pub read_timeout_ms: u64,
    /// Send a PING on open and wait for its echo.
    pub startup_ping: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 19200,
            mcu: String::new(),
            platform: Platform::Avr,
            descriptor_root: PathBuf::from("descriptors"),
            reset_delay_ms: 2000,
            read_timeout_ms: 1000,
            startup_ping: true,
        }
    }
}

impl BuildConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: BuildConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    /// Session settings, with the PING probe when `startup_ping` is set.
    pub fn session_settings(&self) -> Result<SessionSettings, EncodeError> {
        let probe = if self.startup_ping {
            Some(crate::debugger::startup_probe()?.to_vec())
        } else {
            None
        };
        Ok(SessionSettings {
            link: self.link_settings(),
            reset_delay: Duration::from_millis(self.reset_delay_ms),
            probe,
        })
    }
}
