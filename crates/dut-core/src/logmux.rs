//! Log multiplexer: the merge point for every I/O source of a session.
//!
//! Transports push bytes in from their forwarding threads; consumers read
//! the merged stream through [`LogReader`] while it is still growing. Each
//! `write` is appended atomically under one lock. Sources are not ordered
//! against each other beyond arrival order.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

/// Source tag for serial/socket output.
pub const SOURCE_SERIAL: &str = "serial";
/// Source tag for debug server output.
pub const SOURCE_DEBUG_SERVER: &str = "openocd";
/// Source tag for debugger client output.
pub const SOURCE_DEBUGGER: &str = "gdb";
/// Source tag for unsolicited control connection output.
pub const SOURCE_CONTROL: &str = "telnet";

/// One discrete write into the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: String,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    stream: Vec<u8>,
    records: Vec<LogRecord>,
    log_file: Option<File>,
    finished: bool,
}

/// Shared, append-only sink for all transports of one session.
#[derive(Default)]
pub struct LogMultiplexer {
    inner: Mutex<Inner>,
    appended: Condvar,
}

impl LogMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Multiplexer that also appends every write to `path`.
    pub fn with_log_file(path: &Path) -> io::Result<Arc<Self>> {
        let file = File::options().create(true).append(true).open(path)?;
        let mux = Self::default();
        mux.lock().log_file = Some(file);
        Ok(Arc::new(mux))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // buffers are never left half-updated, poison is harmless
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `data` tagged with `source`.
    pub fn write(&self, source: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.finished {
            trace!(source, len = data.len(), "Dropping write after finish");
            return;
        }
        inner.stream.extend_from_slice(data);
        inner.records.push(LogRecord {
            source: source.to_string(),
            data: data.to_vec(),
        });
        if let Some(file) = inner.log_file.as_mut()
            && let Err(e) = file.write_all(data)
        {
            warn!(error = %e, "Failed to write log file, disabling it");
            inner.log_file = None;
        }
        drop(inner);
        trace!(source, len = data.len(), "Log write");
        self.appended.notify_all();
    }

    /// Stop accepting writes, flush the log file and release blocked readers.
    pub fn finish(&self) -> io::Result<()> {
        let mut inner = self.lock();
        inner.finished = true;
        let result = match inner.log_file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        };
        drop(inner);
        self.appended.notify_all();
        result
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Reader over the merged stream, starting at its beginning.
    pub fn reader(self: &Arc<Self>) -> LogReader {
        LogReader {
            mux: Arc::clone(self),
            pos: 0,
        }
    }

    /// Snapshot of the merged byte stream.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().stream.clone()
    }

    /// Snapshot of the tagged records.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().records.clone()
    }

    /// Concatenated output of one source, lossily decoded.
    pub fn text_from(&self, source: &str) -> String {
        source_text(&self.lock().records, source)
    }

    /// Whether `needle` appears in the output of `source`, or anywhere in
    /// the merged stream when `source` is `None`.
    pub fn contains(&self, source: Option<&str>, needle: &str) -> bool {
        match source {
            Some(source) => self.text_from(source).contains(needle),
            None => String::from_utf8_lossy(&self.lock().stream).contains(needle),
        }
    }

    /// Block until [`contains`](Self::contains) holds or `timeout` passes.
    pub fn wait_for(&self, source: Option<&str>, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let found = match source {
                Some(source) => source_text(&inner.records, source).contains(needle),
                None => String::from_utf8_lossy(&inner.stream).contains(needle),
            };
            if found {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || inner.finished {
                return false;
            }
            inner = self
                .appended
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

fn source_text(records: &[LogRecord], source: &str) -> String {
    let bytes: Vec<u8> = records
        .iter()
        .filter(|r| r.source == source)
        .flat_map(|r| r.data.iter().copied())
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Blocking reader over a [`LogMultiplexer`]'s merged stream.
///
/// `read` waits for new bytes and returns `Ok(0)` only once the multiplexer
/// is finished and everything has been consumed.
pub struct LogReader {
    mux: Arc<LogMultiplexer>,
    pos: usize,
}

impl LogReader {
    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.mux.lock();
        while inner.stream.len() == self.pos && !inner.finished {
            inner = self
                .mux
                .appended
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        let available = &inner.stream[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_records_keep_source_tags() {
        let mux = LogMultiplexer::new();
        mux.write(SOURCE_SERIAL, b"boot: ");
        mux.write(SOURCE_DEBUGGER, b"(gdb) ");
        mux.write(SOURCE_SERIAL, b"ok\n");
        mux.write(SOURCE_SERIAL, b"");

        assert_eq!(mux.contents(), b"boot: (gdb) ok\n");
        assert_eq!(mux.records().len(), 3);
        assert_eq!(mux.text_from(SOURCE_SERIAL), "boot: ok\n");
        assert!(mux.contains(Some(SOURCE_DEBUGGER), "(gdb)"));
        assert!(!mux.contains(Some(SOURCE_SERIAL), "(gdb)"));
        assert!(mux.contains(None, "(gdb) ok"));
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let mux = LogMultiplexer::new();
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|source| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    let chunk = source.repeat(64);
                    for _ in 0..100 {
                        mux.write(source, chunk.as_bytes());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stream = mux.contents();
        assert_eq!(stream.len(), 4 * 100 * 64);
        for chunk in stream.chunks(64) {
            assert!(chunk.iter().all(|&b| b == chunk[0]));
        }
    }

    #[test]
    fn test_reader_follows_live_stream() {
        let mux = LogMultiplexer::new();
        let mut reader = mux.reader();
        let writer = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || {
                mux.write(SOURCE_SERIAL, b"hello ");
                thread::sleep(Duration::from_millis(20));
                mux.write(SOURCE_SERIAL, b"world");
                mux.finish().unwrap();
            })
        };

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        writer.join().unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(reader.position(), 11);
    }

    #[test]
    fn test_wait_for() {
        let mux = LogMultiplexer::new();
        let writer = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mux.write(SOURCE_DEBUG_SERVER, b"Listening on port 4444 for telnet connections\n");
            })
        };
        assert!(mux.wait_for(Some(SOURCE_DEBUG_SERVER), "port 4444", Duration::from_secs(5)));
        assert!(!mux.wait_for(Some(SOURCE_SERIAL), "port 4444", Duration::from_millis(10)));
        writer.join().unwrap();
    }

    #[test]
    fn test_finish_drops_late_writes_and_flushes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dut.log");
        let mux = LogMultiplexer::with_log_file(&path).unwrap();
        mux.write(SOURCE_SERIAL, b"before\n");
        mux.finish().unwrap();
        mux.finish().unwrap();
        mux.write(SOURCE_SERIAL, b"after\n");

        assert!(mux.is_finished());
        assert_eq!(mux.contents(), b"before\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before\n");
    }
}
