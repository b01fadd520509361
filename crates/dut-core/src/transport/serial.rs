//! Serial transport: a serial device or a raw TCP socket.

use std::fmt;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument};

use super::forward::spawn_forwarder;
use super::traits::{Transport, TransportError};
use crate::logmux::{LogMultiplexer, SOURCE_SERIAL};

/// Default baud rate for serial devices.
pub const DEFAULT_BAUD: u32 = 115200;

/// URL scheme selecting a TCP socket instead of a serial device.
pub const SOCKET_SCHEME: &str = "socket://";

/// Serial read timeout; bounds how long `close` waits for the reader.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Where the serial transport connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// `socket://host:port`
    Socket { host: String, port: u16 },
    /// A serial device such as `/dev/ttyUSB0`.
    Port { path: String, baud: u32 },
}

impl ConnectionTarget {
    /// Interpret a `--port` style string.
    pub fn from_port(port: &str, baud: u32) -> Result<Self, TransportError> {
        let Some(addr) = port.strip_prefix(SOCKET_SCHEME) else {
            return Ok(Self::Port {
                path: port.to_string(),
                baud,
            });
        };
        let bad = |message: &str| TransportError::Connection {
            target: port.to_string(),
            message: message.to_string(),
        };
        let (host, port_num) = addr.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
        let port_num = port_num.parse().map_err(|_| bad("invalid port number"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(bad("missing host"));
        }
        Ok(Self::Socket {
            host: host.to_string(),
            port: port_num,
        })
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Socket { host, port } if host.contains(':') => {
                write!(f, "{SOCKET_SCHEME}[{host}]:{port}")
            }
            ConnectionTarget::Socket { host, port } => write!(f, "{SOCKET_SCHEME}{host}:{port}"),
            ConnectionTarget::Port { path, baud } => write!(f, "{path}@{baud}"),
        }
    }
}

enum Link {
    Socket(TcpStream),
    Port(Box<dyn SerialPort>),
}

impl Link {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Link::Socket(s) => {
                s.write_all(data)?;
                s.flush()
            }
            Link::Port(p) => {
                p.write_all(data)?;
                p.flush()
            }
        }
    }
}

/// Serial/socket connection whose inbound bytes go to the log multiplexer
/// tagged `serial`.
pub struct SerialTransport {
    target: ConnectionTarget,
    writer: Mutex<Option<Link>>,
    closed: Arc<AtomicBool>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    /// Open the connection and start forwarding its output.
    #[instrument(level = "info", skip(mux), fields(conn = %target))]
    pub fn open(
        target: &ConnectionTarget,
        mux: Arc<LogMultiplexer>,
    ) -> Result<Self, TransportError> {
        let connection_err = |e: &dyn fmt::Display| TransportError::Connection {
            target: target.to_string(),
            message: e.to_string(),
        };
        let closed = Arc::new(AtomicBool::new(false));

        let (writer, forwarder) = match target {
            ConnectionTarget::Socket { host, port } => {
                let stream =
                    TcpStream::connect((host.as_str(), *port)).map_err(|e| connection_err(&e))?;
                stream.set_nodelay(true)?;
                let reader = stream.try_clone()?;
                let forwarder =
                    spawn_forwarder(SOURCE_SERIAL, reader, mux, Arc::clone(&closed))?;
                (Link::Socket(stream), forwarder)
            }
            ConnectionTarget::Port { path, baud } => {
                let port = serialport::new(path, *baud)
                    .timeout(PORT_READ_TIMEOUT)
                    .open()
                    .map_err(|e| connection_err(&e))?;
                let reader = port.try_clone()?;
                let forwarder =
                    spawn_forwarder(SOURCE_SERIAL, reader, mux, Arc::clone(&closed))?;
                (Link::Port(port), forwarder)
            }
        };

        info!("Serial transport opened");
        Ok(Self {
            target: target.clone(),
            writer: Mutex::new(Some(writer)),
            closed,
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().unwrap();
        let link = writer.as_mut().ok_or(TransportError::Closed)?;
        link.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(Link::Socket(stream)) = self.writer.lock().unwrap().take() {
            // unblocks the forwarder's pending read
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.forwarder.lock().unwrap().take()
            && handle.join().is_err()
        {
            return Err(TransportError::Teardown(vec![
                "serial forwarder panicked".to_string(),
            ]));
        }
        info!(conn = %self.target, "Serial transport closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// TCP server that echoes everything back, like `socat ... EXEC:cat`.
    fn echo_server() -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (port, handle)
    }

    #[test]
    fn test_target_from_port() {
        assert_eq!(
            ConnectionTarget::from_port("socket://localhost:9876", DEFAULT_BAUD).unwrap(),
            ConnectionTarget::Socket {
                host: "localhost".into(),
                port: 9876
            }
        );
        assert_eq!(
            ConnectionTarget::from_port("/dev/ttyUSB0", 921600).unwrap(),
            ConnectionTarget::Port {
                path: "/dev/ttyUSB0".into(),
                baud: 921600
            }
        );
        assert!(ConnectionTarget::from_port("socket://localhost", DEFAULT_BAUD).is_err());
        assert!(ConnectionTarget::from_port("socket://:80", DEFAULT_BAUD).is_err());
        assert!(ConnectionTarget::from_port("socket://host:http", DEFAULT_BAUD).is_err());
        assert!(ConnectionTarget::from_port("socket://[]:80", DEFAULT_BAUD).is_err());
    }

    #[test]
    fn test_target_ipv6_socket() {
        let target = ConnectionTarget::from_port("socket://[::1]:4000", DEFAULT_BAUD).unwrap();
        assert_eq!(
            target,
            ConnectionTarget::Socket {
                host: "::1".into(),
                port: 4000
            }
        );
        assert_eq!(target.to_string(), "socket://[::1]:4000");
    }

    #[test]
    fn test_echo_roundtrip_is_forwarded() {
        let (port, server) = echo_server();
        let mux = LogMultiplexer::new();
        let target = ConnectionTarget::from_port(&format!("socket://127.0.0.1:{port}"), 0).unwrap();
        let serial = SerialTransport::open(&target, Arc::clone(&mux)).unwrap();

        assert_eq!(serial.write(b"hello world").unwrap(), 11);
        assert!(mux.wait_for(Some(SOURCE_SERIAL), "hello world", Duration::from_secs(5)));

        serial.close().unwrap();
        assert!(!serial.is_open());
        assert!(matches!(serial.write(b"x"), Err(TransportError::Closed)));
        serial.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ConnectionTarget::Socket {
            host: "127.0.0.1".into(),
            port,
        };
        let err = SerialTransport::open(&target, LogMultiplexer::new());
        assert!(matches!(err, Err(TransportError::Connection { .. })));
    }

    #[test]
    fn test_missing_serial_device() {
        let target = ConnectionTarget::Port {
            path: "/dev/does-not-exist-dut".into(),
            baud: DEFAULT_BAUD,
        };
        let err = SerialTransport::open(&target, LogMultiplexer::new());
        assert!(matches!(err, Err(TransportError::Connection { .. })));
    }
}
