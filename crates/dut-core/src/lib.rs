//! DUT-Core: device-under-test plumbing for ESP-IDF build artifacts.
//!
//! This crate ties a firmware build directory to a live board so that a test
//! harness can write to the device and match on everything the device and its
//! debug tooling print.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Artifact**: Build directory discovery, `flasher_args.json`, `sdkconfig`
//!   and partition table decoding
//! - **LogMux**: Source-tagged merge of every output stream, readable and
//!   searchable while it grows
//! - **Transport**: Serial port / TCP socket, and the JTAG stack (debug
//!   server, debugger client, control connection)
//! - **Events**: Observer pattern for harness decoupling
//! - **Session**: Owns one artifact and one transport, with ordered teardown
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use dut_core::session::{DutConfig, DutSession};
//!
//! let config = DutConfig {
//!     app_path: Some("hello_world".into()),
//!     port: Some("/dev/ttyUSB0".to_string()),
//!     ..Default::default()
//! };
//!
//! let session = DutSession::open(&config).expect("open failed");
//! session.write(b"\n").expect("write failed");
//! let result = session.expect("Hello world!", Duration::from_secs(10));
//! session.finish(result).expect("test failed");
//! ```

pub mod artifact;
pub mod events;
pub mod logmux;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use artifact::{
    ArtifactError, ArtifactOptions, BuildArtifact, DecodeError, FlashSegment, PartitionEntry,
    PartitionTable,
};
pub use events::{DutEvent, DutObserver, NullObserver, SessionPhase, TracingObserver};
pub use logmux::{LogMultiplexer, LogReader, LogRecord};
pub use session::{DutConfig, DutSession, TeardownError};
pub use transport::{
    ConnectionTarget, DutTransport, JtagConfig, JtagStack, MockTransport, SerialTransport,
    Transport, TransportError,
};
