//! Debugger: validates, frames and sends one logical command at a time.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandError, CommandId, LogicalCommand};
use crate::config::BuildConfig;
use crate::descriptor::{DescriptorError, DeviceMetadata, build_device_metadata};
use crate::events::{MdtEvent, MdtObserver, PacketDirection, TracingObserver};
use crate::protocol::{
    EncodeError, FRAME_SIZE, Frame, ProtocolError, chunk_command, decode_and_validate, encode,
};
use crate::transport::{Connector, SyncOutcome, TransportError, TransportSession};
use crate::validator::{ValidationError, ValidationReport, validate};

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("{0} is handled by the host and never sent")]
    HostOnly(CommandId),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The frame written once on open and expected back as an echo.
pub fn startup_probe() -> Result<[u8; FRAME_SIZE], EncodeError> {
    encode(&LogicalCommand::ping(), 0, false, false)
}

/// One frame sent and whatever came back for it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub sequence: u8,
    pub sent: [u8; FRAME_SIZE],
    pub received: Vec<u8>,
    pub response: Result<Frame, ProtocolError>,
}

/// Result of running one command.
#[derive(Debug, Clone)]
pub struct Execution {
    pub command: LogicalCommand,
    /// `None` for commands that bypass validation.
    pub report: Option<ValidationReport>,
    pub exchanges: Vec<Exchange>,
    /// Frames the command was split into; more than were sent if a response
    /// failed part way.
    pub frames_total: usize,
}

impl Execution {
    /// Every frame was sent and every response decoded cleanly.
    pub fn is_success(&self) -> bool {
        self.exchanges.len() == self.frames_total
            && self.exchanges.iter().all(|x| x.response.is_ok())
    }

    /// The first response that failed, if any.
    pub fn failure(&self) -> Option<(u8, &ProtocolError)> {
        self.exchanges
            .iter()
            .find_map(|x| x.response.as_ref().err().map(|e| (x.sequence, e)))
    }

    /// Data bytes of all accepted responses, trimmed to their LENGTH fields.
    pub fn response_data(&self) -> Vec<u8> {
        self.exchanges
            .iter()
            .filter_map(|x| x.response.as_ref().ok())
            .flat_map(|frame| frame.payload().iter().copied())
            .collect()
    }
}

/// Ties metadata, validation, framing and the serial session together.
pub struct Debugger<C: Connector, O: MdtObserver> {
    metadata: Arc<DeviceMetadata>,
    session: TransportSession<C, O>,
    observer: Arc<O>,
}

impl<C: Connector> Debugger<C, TracingObserver> {
    /// Build metadata and a session from a build configuration.
    pub fn from_config(config: &BuildConfig, connector: C) -> Result<Self, DebuggerError> {
        Self::from_config_with_observer(config, connector, Arc::new(TracingObserver))
    }
}

impl<C: Connector, O: MdtObserver> Debugger<C, O> {
    pub fn from_config_with_observer(
        config: &BuildConfig,
        connector: C,
        observer: Arc<O>,
    ) -> Result<Self, DebuggerError> {
        let metadata = build_device_metadata(&config.mcu, config.platform, &config.descriptor_root)?;
        let session =
            TransportSession::with_observer(connector, config.session_settings()?, observer.clone());
        Ok(Self::new(Arc::new(metadata), session, observer))
    }

    pub fn new(
        metadata: Arc<DeviceMetadata>,
        session: TransportSession<C, O>,
        observer: Arc<O>,
    ) -> Self {
        Self {
            metadata,
            session,
            observer,
        }
    }

    pub fn metadata(&self) -> &Arc<DeviceMetadata> {
        &self.metadata
    }

    pub fn session(&self) -> &TransportSession<C, O> {
        &self.session
    }

    pub fn open(&mut self) -> Result<SyncOutcome, DebuggerError> {
        Ok(self.session.open()?)
    }

    pub fn close(&mut self) {
        self.session.close();
    }

    /// Run one command against the device.
    ///
    /// Memory and register commands are validated first and nothing is sent
    /// when that fails. A bad response stops the remaining frames of the
    /// transfer; it is reported in the returned [`Execution`], not as an error.
    #[instrument(skip(self, command), fields(command = %command))]
    pub fn execute(&mut self, command: &LogicalCommand) -> Result<Execution, DebuggerError> {
        let id = command.id();
        if id.is_host_only() {
            return Err(DebuggerError::HostOnly(id));
        }

        let report = match id {
            CommandId::Ping | CommandId::Reset => None,
            _ => Some(validate(command, &self.metadata)?),
        };
        if let Some(report) = &report {
            for advisory in &report.advisories {
                self.observer.on_event(&MdtEvent::Advisory {
                    message: advisory.clone(),
                });
            }
        }

        let chunks = chunk_command(command);
        let frames_total = chunks.len();
        // Encode everything before touching the wire.
        let frames = chunks
            .iter()
            .map(|chunk| chunk.encode().map(|bytes| (chunk.sequence, bytes)))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(frames = frames_total, "Command framed");

        let mut exchanges = Vec::with_capacity(frames_total);
        for (index, (sequence, sent)) in frames.into_iter().enumerate() {
            self.observer.on_event(&MdtEvent::Packet {
                direction: PacketDirection::Tx,
                seq: sequence,
                length: sent.len(),
                data: Some(sent.to_vec()),
            });
            let received = self.session.send(&sent)?;
            self.observer.on_event(&MdtEvent::Packet {
                direction: PacketDirection::Rx,
                seq: sequence,
                length: received.len(),
                data: Some(received.clone()),
            });

            let response = decode_and_validate(&received);
            let failed = response.is_err();
            if let Err(e) = &response {
                warn!(seq = sequence, error = %e, "Response rejected");
                self.observer.on_event(&MdtEvent::ResponseError {
                    seq: sequence,
                    message: e.to_string(),
                });
            }
            exchanges.push(Exchange {
                sequence,
                sent,
                received,
                response,
            });
            if failed {
                break;
            }

            if frames_total > 1 {
                self.observer.on_event(&MdtEvent::Progress {
                    command: command.name.clone(),
                    current: index + 1,
                    total: frames_total,
                });
            }
        }

        let execution = Execution {
            command: command.clone(),
            report,
            exchanges,
            frames_total,
        };
        if execution.is_success() {
            info!(frames = frames_total, "Command acknowledged");
            self.observer.on_event(&MdtEvent::Complete {
                command: command.name.clone(),
            });
        }
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::command::MemoryKind;
    use crate::descriptor::{MemorySegment, Module, Register, RegisterGroup};
    use crate::events::testing::RecordingObserver;
    use crate::protocol::{
        CRC_RANGE, DATA_SIZE, FrameFlags, OFFSET_CRC, OFFSET_DATA, OFFSET_FLAGS, crc16,
    };
    use crate::transport::{LinkSettings, MockConnector, MockLink, SessionSettings};

    fn metadata() -> Arc<DeviceMetadata> {
        let mut meta = DeviceMetadata {
            device_name: "MOCK".into(),
            ..Default::default()
        };
        meta.memories.insert(
            "IRAM".into(),
            MemorySegment {
                start: 0x100,
                size: 0x100,
                kind: MemoryKind::Ram,
                page_size: None,
            },
        );
        let mut group = RegisterGroup {
            offset: 0x40,
            ..Default::default()
        };
        group.registers.insert(
            "CTRL".into(),
            Register {
                size: 1,
                ..Default::default()
            },
        );
        let mut module = Module::default();
        module.register_groups.insert("TIMER0".into(), group);
        meta.modules.insert("TIMER".into(), module);
        Arc::new(meta)
    }

    /// Acknowledge a frame, optionally replacing its data, and reseal the CRC.
    fn ack(frame: &[u8], flags: u8, data: Option<[u8; DATA_SIZE]>) -> Vec<u8> {
        let mut reply = frame.to_vec();
        reply[OFFSET_FLAGS] |= flags;
        if let Some(data) = data {
            reply[OFFSET_DATA..OFFSET_DATA + DATA_SIZE].copy_from_slice(&data);
        }
        let crc = crc16(&reply[CRC_RANGE]);
        reply[OFFSET_CRC..OFFSET_CRC + 2].copy_from_slice(&crc.to_le_bytes());
        reply
    }

    /// A fake MCU with 256 bytes of RAM at 0x100.
    fn mock_mcu() -> (MockLink, Arc<Mutex<HashMap<u32, u8>>>) {
        let link = MockLink::silent();
        let ram = Arc::new(Mutex::new(HashMap::new()));
        let memory = ram.clone();
        link.set_responder(move |frame| {
            let Ok(f) = decode_and_validate(frame) else {
                return Vec::new();
            };
            let mut mem = memory.lock().unwrap();
            match f.cmd_id {
                CommandId::WRITE_MEM => {
                    for (i, b) in f.payload().iter().enumerate() {
                        mem.insert(f.address + i as u32, *b);
                    }
                    ack(frame, FrameFlags::ACK_NACK, None)
                }
                CommandId::READ_MEM => {
                    let mut data = [0u8; DATA_SIZE];
                    for (i, slot) in data.iter_mut().enumerate() {
                        *slot = mem.get(&(f.address + i as u32)).copied().unwrap_or(0);
                    }
                    ack(frame, FrameFlags::ACK_NACK, Some(data))
                }
                _ => ack(frame, FrameFlags::ACK_NACK, None),
            }
        });
        (link, ram)
    }

    fn debugger(link: MockLink) -> Debugger<MockConnector, RecordingObserver> {
        let observer = Arc::new(RecordingObserver::default());
        let settings = SessionSettings {
            link: LinkSettings {
                port: "mock0".into(),
                baud_rate: 19200,
                read_timeout: Duration::from_millis(10),
            },
            reset_delay: Duration::ZERO,
            probe: Some(startup_probe().unwrap().to_vec()),
        };
        let session =
            TransportSession::with_observer(MockConnector::new(link), settings, observer.clone())
                .with_echo_deadline(Duration::from_millis(30));
        Debugger::new(metadata(), session, observer)
    }

    #[test]
    fn test_write_then_read_back() {
        let (link, ram) = mock_mcu();
        let mut dbg = debugger(link.clone());
        assert_eq!(dbg.open().unwrap(), SyncOutcome::Echoed);

        let payload: Vec<u8> = (1..=11).collect();
        let write = LogicalCommand::write_mem(MemoryKind::Ram, 0x100, payload.clone()).unwrap();
        let exec = dbg.execute(&write).unwrap();
        assert!(exec.is_success());
        assert_eq!(exec.exchanges.len(), 3);
        assert_eq!(
            exec.exchanges.iter().map(|x| x.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(ram.lock().unwrap().get(&0x10A), Some(&11));

        let read = LogicalCommand::read_mem(MemoryKind::Ram, 0x104, 4);
        let exec = dbg.execute(&read).unwrap();
        assert!(exec.is_success());
        assert_eq!(exec.response_data(), vec![5, 6, 7, 8]);

        // Probe plus three write frames plus one read frame.
        assert_eq!(link.get_writes().len(), 5);
        assert_eq!(
            dbg.observer
                .count(|e| matches!(e, MdtEvent::Complete { .. })),
            2
        );
    }

    #[test]
    fn test_rejected_command_is_never_sent() {
        let (link, _) = mock_mcu();
        let mut dbg = debugger(link.clone());
        dbg.open().unwrap();
        link.clear_writes();

        let out_of_range = LogicalCommand::read_mem(MemoryKind::Ram, 0x1F0, 0x20);
        assert!(matches!(
            dbg.execute(&out_of_range),
            Err(DebuggerError::Validation(_))
        ));
        let write_reg = LogicalCommand::new(CommandId::WriteReg, 0x40).with_data(vec![1]);
        assert!(matches!(
            dbg.execute(&write_reg),
            Err(DebuggerError::Validation(_))
        ));
        assert!(matches!(
            dbg.execute(&LogicalCommand::new(CommandId::Help, 0)),
            Err(DebuggerError::HostOnly(CommandId::Help))
        ));
        assert!(link.get_writes().is_empty());
    }

    #[test]
    fn test_ping_bypasses_validation() {
        let (link, _) = mock_mcu();
        let mut dbg = debugger(link);
        dbg.open().unwrap();
        let exec = dbg.execute(&LogicalCommand::ping()).unwrap();
        assert!(exec.report.is_none());
        assert!(exec.is_success());
        assert!(exec.exchanges[0].response.as_ref().unwrap().is_ack());
    }

    #[test]
    fn test_device_error_stops_transfer() {
        let link = MockLink::silent();
        let mut dbg = debugger(link.clone());
        link.queue_response(&startup_probe().unwrap());
        dbg.open().unwrap();

        let write = LogicalCommand::write_mem(MemoryKind::Ram, 0x100, vec![0xAB; 12]).unwrap();
        let frames: Vec<_> = chunk_command(&write)
            .iter()
            .map(|c| c.encode().unwrap())
            .collect();
        link.queue_response(&ack(&frames[0], FrameFlags::ACK_NACK, None));
        link.queue_response(&ack(&frames[1], FrameFlags::STATUS_ERROR, None));

        let exec = dbg.execute(&write).unwrap();
        assert!(!exec.is_success());
        assert_eq!(exec.frames_total, 3);
        assert_eq!(exec.exchanges.len(), 2);
        assert!(matches!(
            exec.failure(),
            Some((1, ProtocolError::DeviceStatus { seq: 1, .. }))
        ));
        assert!(dbg.session().is_open());
    }

    #[test]
    fn test_execute_before_open() {
        let (link, _) = mock_mcu();
        let mut dbg = debugger(link);
        assert!(matches!(
            dbg.execute(&LogicalCommand::ping()),
            Err(DebuggerError::Transport(TransportError::NotOpen))
        ));
    }

    #[test]
    fn test_flash_write_emits_advisory() {
        let (link, _) = mock_mcu();
        let mut dbg = debugger(link);
        let mut meta = (*dbg.metadata).clone();
        meta.memories.insert(
            "FLASH".into(),
            MemorySegment {
                start: 0,
                size: 0x8000,
                kind: MemoryKind::Flash,
                page_size: Some(0x80),
            },
        );
        dbg.metadata = Arc::new(meta);
        dbg.open().unwrap();

        let exec = dbg
            .execute(&LogicalCommand::write_mem(MemoryKind::Flash, 0x200, vec![1, 2]).unwrap())
            .unwrap();
        assert_eq!(exec.report.unwrap().advisories.len(), 1);
        assert_eq!(
            dbg.observer
                .count(|e| matches!(e, MdtEvent::Advisory { .. })),
            1
        );
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mock1.atdf"),
            r#"<avr-tools-device-file><devices><device name="MOCK1">
                 <address-spaces><address-space name="data">
                   <memory-segment name="IRAM" type="ram" start="0x100" size="0x100"/>
                 </address-space></address-spaces>
               </device></devices></avr-tools-device-file>"#,
        )
        .unwrap();
        let config = BuildConfig {
            port: "mock0".into(),
            mcu: "mock1".into(),
            descriptor_root: dir.path().to_path_buf(),
            reset_delay_ms: 0,
            ..Default::default()
        };
        let dbg = Debugger::from_config(&config, MockConnector::new(MockLink::new())).unwrap();
        assert_eq!(dbg.metadata().device_name, "MOCK1");
        assert!(dbg.session().settings().probe.is_some());

        let missing = BuildConfig {
            mcu: "nope".into(),
            ..config
        };
        assert!(matches!(
            Debugger::from_config(&missing, MockConnector::default()),
            Err(DebuggerError::Descriptor(DescriptorError::NotFound { .. }))
        ));
    }
}
