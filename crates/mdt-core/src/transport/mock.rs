//! In-memory serial link for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{Connector, LinkSettings, SerialLink, TransportError};

type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Mock link. Clones share state, so a test can keep a handle after the
/// session has taken ownership of the link.
///
/// What a write produces on the input side, in order of precedence: the next
/// queued response, the responder's output, or an echo of the written bytes.
#[derive(Clone)]
pub struct MockLink {
    /// Bytes the "device" has sent that the host has not read yet.
    rx: Arc<Mutex<VecDeque<u8>>>,
    /// Replies released one per write.
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    responder: Arc<Mutex<Option<Responder>>>,
    echo: Arc<Mutex<bool>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    connected: Arc<Mutex<bool>>,
    clears: Arc<Mutex<usize>>,
    /// Report pending input but return nothing from reads.
    stalled: Arc<Mutex<bool>>,
}

impl MockLink {
    /// A link that echoes every write.
    pub fn new() -> Self {
        Self {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            responder: Arc::new(Mutex::new(None)),
            echo: Arc::new(Mutex::new(true)),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            clears: Arc::new(Mutex::new(0)),
            stalled: Arc::new(Mutex::new(false)),
        }
    }

    /// A link that never answers unless told to.
    pub fn silent() -> Self {
        let link = Self::new();
        link.set_echo(false);
        link
    }

    pub fn set_echo(&self, echo: bool) {
        *self.echo.lock().unwrap() = echo;
    }

    /// While set, `bytes_to_read` counts pending input that `read_available`
    /// never hands out.
    pub fn set_stalled(&self, stalled: bool) {
        *self.stalled.lock().unwrap() = stalled;
    }

    /// Queue a reply to be released by the next write.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.responses.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Compute replies from the written bytes.
    pub fn set_responder(&self, f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Arc::new(f));
    }

    /// Put bytes in the input buffer right away.
    pub fn inject(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// How many times the buffers were cleared.
    pub fn clear_count(&self) -> usize {
        *self.clears.lock().unwrap()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink for MockLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.check_connected()?;
        self.write_log.lock().unwrap().push(data.to_vec());

        let queued = self.responses.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => Some(reply),
            None => {
                let responder = self.responder.lock().unwrap().clone();
                match responder {
                    Some(f) => Some(f(data)),
                    None if *self.echo.lock().unwrap() => Some(data.to_vec()),
                    None => None,
                }
            }
        };
        if let Some(reply) = reply {
            self.inject(&reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.check_connected()
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        self.check_connected()?;
        Ok(self.rx.lock().unwrap().len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_connected()?;
        if *self.stalled.lock().unwrap() {
            return Ok(0);
        }
        let mut rx = self.rx.lock().unwrap();
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.check_connected()?;
        self.rx.lock().unwrap().clear();
        *self.clears.lock().unwrap() += 1;
        Ok(())
    }
}

/// Hands out clones of one [`MockLink`].
#[derive(Clone, Default)]
pub struct MockConnector {
    pub link: MockLink,
    /// Settings of every connect attempt.
    pub attempts: Arc<Mutex<Vec<LinkSettings>>>,
    pub fail: bool,
}

impl MockConnector {
    pub fn new(link: MockLink) -> Self {
        Self {
            link,
            attempts: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        }
    }

    /// A connector whose every attempt fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

impl Connector for MockConnector {
    type Link = MockLink;

    fn connect(&self, settings: &LinkSettings) -> Result<MockLink, TransportError> {
        self.attempts.lock().unwrap().push(settings.clone());
        if self.fail {
            return Err(TransportError::OpenFailed {
                port: settings.port.clone(),
                message: "mock connector refused".into(),
            });
        }
        Ok(self.link.clone())
    }
}
