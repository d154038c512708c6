//! Transport session: owns one serial link for its open lifetime.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::traits::{Connector, LinkSettings, SerialLink, TransportError};
use crate::events::{LinkState, MdtEvent, MdtObserver, TracingObserver};
use crate::protocol::decode_and_validate;

/// How long to wait for an echo or response, independent of the per-read
/// timeout.
pub const ECHO_DEADLINE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Everything needed to open and synchronize a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub link: LinkSettings,
    /// Settle time after connecting, for boards that reset on open.
    pub reset_delay: Duration,
    /// Frame written once after connecting and expected back as an echo.
    pub probe: Option<Vec<u8>>,
}

/// Result of the startup handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No probe configured.
    Skipped,
    /// The probe came back and decoded cleanly.
    Echoed,
    /// Short echo or one that failed to decode. The session proceeds anyway.
    Mismatch {
        expected: usize,
        received: usize,
        reason: String,
    },
}

impl SyncOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, SyncOutcome::Mismatch { .. })
    }
}

/// Serial session. One frame is outstanding at a time.
pub struct TransportSession<C: Connector, O: MdtObserver> {
    connector: C,
    settings: SessionSettings,
    observer: Arc<O>,
    link: Option<C::Link>,
    state: LinkState,
    sync: Option<SyncOutcome>,
    echo_deadline: Duration,
}

impl<C: Connector> TransportSession<C, TracingObserver> {
    /// Create a session that logs through tracing.
    pub fn new(connector: C, settings: SessionSettings) -> Self {
        Self::with_observer(connector, settings, Arc::new(TracingObserver))
    }
}

impl<C: Connector, O: MdtObserver> TransportSession<C, O> {
    pub fn with_observer(connector: C, settings: SessionSettings, observer: Arc<O>) -> Self {
        Self {
            connector,
            settings,
            observer,
            link: None,
            state: LinkState::Closed,
            sync: None,
            echo_deadline: ECHO_DEADLINE,
        }
    }

    /// Override the echo deadline.
    pub fn with_echo_deadline(mut self, deadline: Duration) -> Self {
        self.echo_deadline = deadline;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Outcome of the last handshake, if the session was ever opened.
    pub fn sync_outcome(&self) -> Option<&SyncOutcome> {
        self.sync.as_ref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Connect, wait out the reset delay, then synchronize.
    ///
    /// A bad echo is reported, not returned as an error. Calling this on an
    /// open session does nothing.
    #[instrument(skip(self), fields(port = %self.settings.link.port))]
    pub fn open(&mut self) -> Result<SyncOutcome, TransportError> {
        if self.link.is_some() {
            debug!("Session already open");
            return Ok(self.sync.clone().unwrap_or(SyncOutcome::Skipped));
        }

        let mut link = self.connector.connect(&self.settings.link)?;
        self.observer.on_event(&MdtEvent::Connected {
            port: self.settings.link.port.clone(),
            baud_rate: self.settings.link.baud_rate,
        });
        self.set_state(LinkState::Unsynchronized);

        if !self.settings.reset_delay.is_zero() {
            debug!(delay_ms = self.settings.reset_delay.as_millis() as u64, "Waiting for MCU reset");
            thread::sleep(self.settings.reset_delay);
        }

        let probe = self.settings.probe.clone();
        let outcome = match probe.as_deref() {
            Some(probe) => match synchronize(&mut link, probe, self.echo_deadline) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = link.clear_buffers();
                    self.set_state(LinkState::Closed);
                    return Err(e);
                }
            },
            None => SyncOutcome::Skipped,
        };

        if let SyncOutcome::Mismatch {
            expected,
            received,
            reason,
        } = &outcome
        {
            self.observer.on_event(&MdtEvent::SyncMismatch {
                expected: *expected,
                received: *received,
                reason: reason.clone(),
            });
        }

        self.link = Some(link);
        self.sync = Some(outcome.clone());
        self.set_state(LinkState::Synchronized);
        info!(outcome = ?outcome, "Session open");
        Ok(outcome)
    }

    /// Write one frame and collect up to `frame.len()` bytes of reply.
    ///
    /// Returns whatever arrived before the deadline, possibly nothing.
    #[instrument(level = "debug", skip(self, frame), fields(len = frame.len()))]
    pub fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        link.write_all(frame)?;
        link.flush()?;
        let reply = poll_for(link, frame.len(), self.echo_deadline)?;
        if reply.len() < frame.len() {
            warn!(
                expected = frame.len(),
                received = reply.len(),
                "Short reply before deadline"
            );
        }
        Ok(reply)
    }

    /// Release the link. Errors while clearing are ignored; closing a closed
    /// session is a no-op.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.clear_buffers() {
                debug!(error = %e, "Ignoring error while clearing buffers on close");
            }
            drop(link);
            self.observer.on_event(&MdtEvent::Disconnected {
                port: self.settings.link.port.clone(),
            });
            self.set_state(LinkState::Closed);
        }
    }

    fn set_state(&mut self, to: LinkState) {
        if self.state != to {
            self.observer.on_event(&MdtEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }
}

impl<C: Connector, O: MdtObserver> Drop for TransportSession<C, O> {
    fn drop(&mut self) {
        self.close();
    }
}

fn synchronize<L: SerialLink>(
    link: &mut L,
    probe: &[u8],
    deadline: Duration,
) -> Result<SyncOutcome, TransportError> {
    link.clear_buffers()?;
    link.write_all(probe)?;
    link.flush()?;
    let echo = poll_for(link, probe.len(), deadline)?;

    if echo.len() != probe.len() {
        return Ok(SyncOutcome::Mismatch {
            expected: probe.len(),
            received: echo.len(),
            reason: "echo incomplete at deadline".to_string(),
        });
    }
    match decode_and_validate(&echo) {
        Ok(_) => Ok(SyncOutcome::Echoed),
        Err(e) => Ok(SyncOutcome::Mismatch {
            expected: probe.len(),
            received: echo.len(),
            reason: e.to_string(),
        }),
    }
}

/// Collect up to `expected` bytes, giving up at `deadline`.
fn poll_for<L: SerialLink>(
    link: &mut L,
    expected: usize,
    deadline: Duration,
) -> Result<Vec<u8>, TransportError> {
    let started = Instant::now();
    let mut collected = Vec::with_capacity(expected);
    while collected.len() < expected {
        let waiting = link.bytes_to_read()?;
        if waiting > 0 {
            let mut buf = vec![0u8; waiting.min(expected - collected.len())];
            let n = link.read_available(&mut buf)?;
            if n > 0 {
                collected.extend_from_slice(&buf[..n]);
                continue;
            }
        }
        if started.elapsed() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(collected)
}
