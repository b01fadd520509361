//! Transport abstraction.
//!
//! Defines the `Transport` trait shared by the serial link and the JTAG
//! stack, allowing the session to drive either (or a mock) uniformly.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Transport is closed")]
    Closed,

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("Teardown failed:\n{}", .0.join("\n"))]
    Teardown(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A live connection to the device under test.
///
/// Implementations forward everything they receive into the session's
/// [`LogMultiplexer`](crate::logmux::LogMultiplexer) from their own
/// threads, so the trait only covers the outbound direction and teardown.
pub trait Transport: Send + Sync {
    /// Short name used in logs, e.g. `serial` or `jtag`.
    fn kind(&self) -> &'static str;

    /// Write raw bytes to the device.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Release every OS resource. Calling it again is a no-op.
    fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
