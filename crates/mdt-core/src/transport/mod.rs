//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod session;
pub mod traits;

pub use mock::{MockConnector, MockLink};
pub use serial::{SerialConnector, SerialPortLink};
pub use session::{ECHO_DEADLINE, SessionSettings, SyncOutcome, TransportSession};
pub use traits::{Connector, LinkSettings, SerialLink, TransportError};
