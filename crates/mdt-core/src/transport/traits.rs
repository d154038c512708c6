//! Serial link abstraction.
//!
//! The session talks to a [`SerialLink`] obtained from a [`Connector`], so the
//! synchronization and echo logic can run against real ports or the mock.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Session is not open")]
    NotOpen,

    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters fixed at connect time. Framing is always 8N1 without flow
/// control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
}

/// Byte-level access to an open serial connection.
pub trait SerialLink: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;

    /// Bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<usize, TransportError>;

    /// Read whatever is available into `buf`, at most `buf.len()` bytes.
    /// Returns 0 when the read timed out with nothing received.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Discard both the input and output buffers.
    fn clear_buffers(&mut self) -> Result<(), TransportError>;
}

/// Opens links. One connector can be asked to connect again after a close.
pub trait Connector {
    type Link: SerialLink;

    fn connect(&self, settings: &LinkSettings) -> Result<Self::Link, TransportError>;
}
