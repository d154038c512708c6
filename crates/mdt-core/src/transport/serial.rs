//! serialport-backed link.

use std::io::{ErrorKind, Read, Write};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument};

use super::traits::{Connector, LinkSettings, SerialLink, TransportError};

/// An open OS serial port.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    #[instrument(level = "info", fields(port = %settings.port, baud = settings.baud_rate))]
    pub fn open(settings: &LinkSettings) -> Result<Self, TransportError> {
        let port = serialport::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: settings.port.clone(),
                message: e.to_string(),
            })?;

        info!("Serial port opened");
        Ok(Self { port })
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.port.flush()?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

/// Connects to real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Link = SerialPortLink;

    fn connect(&self, settings: &LinkSettings) -> Result<Self::Link, TransportError> {
        SerialPortLink::open(settings)
    }
}
