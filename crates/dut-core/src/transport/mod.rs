//! Transport layer module.

pub mod control;
pub mod forward;
pub mod jtag;
pub mod mock;
pub mod process;
pub mod serial;
pub mod traits;

pub use control::ControlConnection;
pub use jtag::{JtagConfig, JtagStack};
pub use mock::MockTransport;
pub use process::ManagedProcess;
pub use serial::{ConnectionTarget, SerialTransport};
pub use traits::{Transport, TransportError};

/// The transports a session can own.
pub enum DutTransport {
    Serial(SerialTransport),
    Jtag(JtagStack),
}

impl DutTransport {
    /// The JTAG stack, for `send`.
    pub fn as_jtag(&self) -> Option<&JtagStack> {
        match self {
            DutTransport::Jtag(stack) => Some(stack),
            DutTransport::Serial(_) => None,
        }
    }
}

impl Transport for DutTransport {
    fn kind(&self) -> &'static str {
        match self {
            DutTransport::Serial(t) => t.kind(),
            DutTransport::Jtag(t) => t.kind(),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        match self {
            DutTransport::Serial(t) => t.write(data),
            DutTransport::Jtag(t) => t.write(data),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        match self {
            DutTransport::Serial(t) => t.close(),
            DutTransport::Jtag(t) => t.close(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            DutTransport::Serial(t) => t.is_open(),
            DutTransport::Jtag(t) => t.is_open(),
        }
    }
}
