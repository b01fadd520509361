//! Mock transport for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::traits::{Transport, TransportError};
use crate::logmux::{LogMultiplexer, SOURCE_SERIAL};

/// Mock transport for unit testing session logic.
///
/// Writes are captured and, when a multiplexer is attached, echoed back
/// into it tagged `serial`, like a loopback device.
pub struct MockTransport {
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Echo target.
    mux: Option<Arc<LogMultiplexer>>,
    /// Number of `close` calls that did work.
    close_count: AtomicUsize,
    /// Whether `close` should fail.
    fail_close: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            write_log: Mutex::new(Vec::new()),
            mux: None,
            close_count: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Mock that echoes writes into `mux`.
    pub fn echoing(mux: Arc<LogMultiplexer>) -> Self {
        Self {
            mux: Some(mux),
            ..Self::new()
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Make the next `close` fail.
    pub fn fail_on_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(mux) = &self.mux {
            mux.write(SOURCE_SERIAL, data);
        }
        Ok(data.len())
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Teardown(vec!["mock close failure".into()]));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_echo() {
        let mux = LogMultiplexer::new();
        let mock = MockTransport::echoing(Arc::clone(&mux));
        mock.write(b"ping").unwrap();
        assert_eq!(mux.text_from(SOURCE_SERIAL), "ping");
    }

    #[test]
    fn test_mock_close() {
        let mock = MockTransport::new();
        assert!(mock.is_open());

        mock.close().unwrap();
        mock.close().unwrap();
        assert!(!mock.is_open());
        assert_eq!(mock.close_count(), 1);
        assert!(mock.write(b"test").is_err());
    }
}
