//! Forwarding threads: copy one I/O source into the log multiplexer.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::logmux::LogMultiplexer;

const BUF_SIZE: usize = 4096;

/// Spawn a thread that copies `reader` into `mux` tagged with `source`.
///
/// The thread ends on end-of-stream, on a hard read error, or once `closed`
/// is set. Timeouts are treated as "no data yet" so that sources with a
/// read timeout (serial ports) notice `closed` promptly.
pub fn spawn_forwarder<R>(
    source: &'static str,
    mut reader: R,
    mux: Arc<LogMultiplexer>,
    closed: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("forward-{source}"))
        .spawn(move || {
            let mut buf = [0u8; BUF_SIZE];
            loop {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(source, "End of stream");
                        break;
                    }
                    Ok(n) => mux.write(source, &buf[..n]),
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        if !closed.load(Ordering::Acquire) {
                            warn!(source, error = %e, "Read failed, stopping forwarder");
                        }
                        break;
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_forwards_until_eof() {
        let mux = LogMultiplexer::new();
        let closed = Arc::new(AtomicBool::new(false));
        let handle = spawn_forwarder(
            "serial",
            Cursor::new(b"rst:0x1 (POWERON_RESET)\n".to_vec()),
            Arc::clone(&mux),
            closed,
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(mux.text_from("serial"), "rst:0x1 (POWERON_RESET)\n");
    }

    #[test]
    fn test_closed_flag_stops_before_reading() {
        let mux = LogMultiplexer::new();
        let closed = Arc::new(AtomicBool::new(true));
        let handle =
            spawn_forwarder("serial", Cursor::new(b"late".to_vec()), Arc::clone(&mux), closed)
                .unwrap();
        handle.join().unwrap();
        assert!(mux.records().is_empty());
    }
}
