//! Line-oriented control connection to the debug server (its telnet port).

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::forward::spawn_forwarder;
use super::traits::TransportError;
use crate::logmux::{LogMultiplexer, SOURCE_CONTROL};

/// Append the line terminator expected by the debug server.
pub fn to_command_line(command: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(command.len() + 1);
    line.extend_from_slice(command);
    line.push(b'\n');
    line
}

pub struct ControlConnection {
    addr: SocketAddr,
    stream: Mutex<TcpStream>,
    closed: Arc<AtomicBool>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ControlConnection {
    /// Connect to `host:port`, trying each resolved address within `timeout`.
    ///
    /// With `mux` set, anything the server sends unprompted is forwarded
    /// tagged `telnet`.
    #[instrument(level = "info", skip(mux))]
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        mux: Option<Arc<LogMultiplexer>>,
    ) -> Result<Self, TransportError> {
        let target = format!("{host}:{port}");
        let connection_err = |message: String| TransportError::Connection {
            target: target.clone(),
            message,
        };

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| connection_err(e.to_string()))?;
        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    connected = Some((addr, stream));
                    break;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let (addr, stream) = connected.ok_or_else(|| {
            connection_err(last_err.map_or_else(
                || "no address resolved".to_string(),
                |e| e.to_string(),
            ))
        })?;

        let closed = Arc::new(AtomicBool::new(false));
        let forwarder = match mux {
            Some(mux) => Some(spawn_forwarder(
                SOURCE_CONTROL,
                stream.try_clone()?,
                mux,
                Arc::clone(&closed),
            )?),
            None => None,
        };

        info!(%addr, "Control connection established");
        Ok(Self {
            addr,
            stream: Mutex::new(stream),
            closed,
            forwarder: Mutex::new(forwarder),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one command, newline-terminated.
    pub fn send(&self, command: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let line = to_command_line(command);
        let mut stream = self.stream.lock().unwrap();
        stream
            .write_all(&line)
            .and_then(|_| stream.flush())
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(command = %String::from_utf8_lossy(command), "Control command sent");
        Ok(())
    }

    /// Shut the socket down and wait for the forwarder. Idempotent.
    pub fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shutdown = self.stream.lock().unwrap().shutdown(Shutdown::Both);
        if let Some(handle) = self.forwarder.lock().unwrap().take() {
            let _ = handle.join();
        }
        match shutdown {
            Ok(()) => Ok(()),
            // peer already went away
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
