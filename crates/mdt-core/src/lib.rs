//! MDT-Core: host side of a serial debug protocol for microcontrollers.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Command**: logical commands, opcodes and memory selectors
//! - **Protocol**: 18-byte frame codec, CRC16, chunking
//! - **Descriptor**: vendor XML descriptors lowered into one [`DeviceMetadata`]
//! - **Validator**: bounds checks against the metadata
//! - **Transport**: serial link abstraction (serialport, mock) and session
//! - **Events**: observer pattern for UI decoupling
//! - **Debugger**: high-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use mdt_core::{BuildConfig, Debugger, LogicalCommand, MemoryKind, SerialConnector};
//!
//! let config = BuildConfig::load_from_file("board.toml").unwrap();
//! let mut debugger = Debugger::from_config(&config, SerialConnector).unwrap();
//! debugger.open().unwrap();
//!
//! let read = LogicalCommand::read_mem(MemoryKind::Ram, 0x100, 4);
//! let execution = debugger.execute(&read).unwrap();
//! println!("{:02X?}", execution.response_data());
//! ```

pub mod command;
pub mod config;
pub mod debugger;
pub mod descriptor;
pub mod events;
pub mod protocol;
pub mod transport;
pub mod validator;

// Re-exports for convenience
pub use command::{CommandError, CommandId, LogicalCommand, MemoryKind};
pub use config::BuildConfig;
pub use debugger::{Debugger, DebuggerError, Exchange, Execution, startup_probe};
pub use descriptor::{DescriptorError, DeviceMetadata, Platform, build_device_metadata};
pub use events::{LinkState, MdtEvent, MdtObserver, NullObserver, PacketDirection, TracingObserver};
pub use protocol::{Frame, ProtocolError, chunk_command, decode_and_validate, encode};
pub use transport::{
    MockConnector, MockLink, SerialConnector, SyncOutcome, TransportError, TransportSession,
};
pub use validator::{ValidationError, ValidationReport, ValidationTarget, is_valid, validate};
