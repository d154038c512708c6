//! Event system for UI decoupling.
//!
//! The transport session and the debugger report what happens on the link
//! through an [`MdtObserver`], so front ends can render it without the core
//! printing anything itself.

use std::fmt;

/// Link state as seen by the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Unsynchronized,
    Synchronized,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Closed => write!(f, "Closed"),
            LinkState::Unsynchronized => write!(f, "Open (unsynchronized)"),
            LinkState::Synchronized => write!(f, "Open (synchronized)"),
        }
    }
}

/// Events emitted by the session and the debugger.
#[derive(Debug, Clone)]
pub enum MdtEvent {
    /// Serial port opened.
    Connected { port: String, baud_rate: u32 },
    /// Serial port released.
    Disconnected { port: String },
    /// Link state changed.
    StateChanged { from: LinkState, to: LinkState },
    /// The startup probe was not echoed cleanly. Advisory only.
    SyncMismatch {
        expected: usize,
        received: usize,
        reason: String,
    },
    /// Frame written or read.
    Packet {
        direction: PacketDirection,
        seq: u8,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Progress through a multi-frame transfer.
    Progress {
        command: String,
        current: usize,
        total: usize,
    },
    /// Non-fatal remark about a command.
    Advisory { message: String },
    /// A response failed to decode or carried the device error flag.
    ResponseError { seq: u8, message: String },
    /// A command finished with every response accepted.
    Complete { command: String },
}

/// Serial frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> MCU
    Rx, // MCU -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving events.
///
/// Implement this in the UI layer to receive updates.
pub trait MdtObserver: Send + Sync {
    fn on_event(&self, event: &MdtEvent);
}

/// Discards all events.
pub struct NullObserver;

impl MdtObserver for NullObserver {
    fn on_event(&self, _event: &MdtEvent) {}
}

/// Logs events using tracing.
pub struct TracingObserver;

impl MdtObserver for TracingObserver {
    fn on_event(&self, event: &MdtEvent) {
        match event {
            MdtEvent::Connected { port, baud_rate } => {
                tracing::info!(port = %port, baud = baud_rate, "Serial port opened");
            }
            MdtEvent::Disconnected { port } => {
                tracing::info!(port = %port, "Serial port closed");
            }
            MdtEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Link state changed");
            }
            MdtEvent::SyncMismatch {
                expected,
                received,
                reason,
            } => {
                tracing::warn!(expected, received, "Startup echo mismatch: {}", reason);
            }
            MdtEvent::Packet {
                direction,
                seq,
                length,
                data,
            } => {
                let hex = data.as_deref().map(crate::command::to_hex).unwrap_or_default();
                tracing::trace!(dir = %direction, seq, len = length, data = %hex, "Frame");
            }
            MdtEvent::Progress {
                command,
                current,
                total,
            } => {
                tracing::debug!(command = %command, progress = %format!("{}/{}", current, total), "Progress");
            }
            MdtEvent::Advisory { message } => {
                tracing::warn!("{}", message);
            }
            MdtEvent::ResponseError { seq, message } => {
                tracing::error!(seq, "Response rejected: {}", message);
            }
            MdtEvent::Complete { command } => {
                tracing::info!(command = %command, "Command complete");
            }
        }
    }
}
