//! JTAG transport stack: debug server + debugger client + control connection.
//!
//! ```text
//!   openocd  ──stdout/stderr──┐
//!   gdb      ──stdout/stderr──┼──> LogMultiplexer
//!   telnet   ──unsolicited────┘
//! ```
//!
//! The debug server is started first; after a fixed settle delay the control
//! connection is opened to its telnet port, then the debugger client is
//! started against the same target. The settle delay is not a readiness
//! check, so a slow debug server can still make the connect fail.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::control::ControlConnection;
use super::process::ManagedProcess;
use super::serial::SerialTransport;
use super::traits::{Transport, TransportError};
use crate::artifact::BuildArtifact;
use crate::logmux::{LogMultiplexer, SOURCE_DEBUG_SERVER, SOURCE_DEBUGGER};

/// Configuration of the JTAG stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JtagConfig {
    /// Debug server executable.
    pub openocd_bin: String,
    /// Debug server arguments, typically board config files.
    pub openocd_args: Vec<String>,
    /// Host of the debug server's control (telnet) port.
    pub telnet_host: String,
    pub telnet_port: u16,
    /// Debugger client executable. Derived from the target chip when unset.
    pub gdb_bin: Option<String>,
    /// Debugger client arguments. The ELF path is appended when known.
    pub gdb_args: Vec<String>,
    /// Wait between starting the debug server and connecting to it.
    pub settle_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Forward unsolicited control connection output.
    pub forward_control_output: bool,
}

impl Default for JtagConfig {
    fn default() -> Self {
        Self {
            openocd_bin: "openocd".to_string(),
            openocd_args: vec!["-f".into(), "board/esp32-wrover-kit-3.3v.cfg".into()],
            telnet_host: "localhost".to_string(),
            telnet_port: 4444,
            gdb_bin: None,
            gdb_args: vec![
                "--nx".into(),
                "--quiet".into(),
                "-ex".into(),
                "target extended-remote :3333".into(),
            ],
            settle_delay_ms: 1000,
            connect_timeout_ms: 5000,
            forward_control_output: true,
        }
    }
}

impl JtagConfig {
    /// Debugger client to run for `target`.
    pub fn gdb_program(&self, target: &str) -> String {
        if let Some(bin) = &self.gdb_bin {
            return bin.clone();
        }
        match target {
            "esp32" | "esp32s2" | "esp32s3" => format!("xtensa-{target}-elf-gdb"),
            _ => "riscv32-esp-elf-gdb".to_string(),
        }
    }
}

/// Running JTAG stack. Exclusively owned by one session.
pub struct JtagStack {
    openocd: ManagedProcess,
    gdb: ManagedProcess,
    telnet: ControlConnection,
    console: Option<SerialTransport>,
}

impl JtagStack {
    /// Launch the debug server, connect to it and launch the debugger.
    ///
    /// `console` is an optional serial link to the same board; writes to the
    /// stack go there.
    #[instrument(level = "info", skip_all, fields(openocd = %config.openocd_bin))]
    pub fn open(
        config: &JtagConfig,
        artifact: Option<&BuildArtifact>,
        console: Option<SerialTransport>,
        mux: Arc<LogMultiplexer>,
    ) -> Result<Self, TransportError> {
        let openocd = ManagedProcess::spawn(
            SOURCE_DEBUG_SERVER,
            &config.openocd_bin,
            &config.openocd_args,
            Arc::clone(&mux),
        )?;

        thread::sleep(Duration::from_millis(config.settle_delay_ms));

        // on failure the already started processes are dropped, which kills them
        let telnet = ControlConnection::connect(
            &config.telnet_host,
            config.telnet_port,
            Duration::from_millis(config.connect_timeout_ms),
            config.forward_control_output.then(|| Arc::clone(&mux)),
        )?;

        let target = artifact.map_or(crate::artifact::DEFAULT_TARGET, BuildArtifact::target);
        let mut gdb_args = config.gdb_args.clone();
        if let Some(elf) = artifact.and_then(BuildArtifact::elf_file) {
            gdb_args.push(elf.display().to_string());
        }
        let gdb = ManagedProcess::spawn(
            SOURCE_DEBUGGER,
            &config.gdb_program(target),
            &gdb_args,
            Arc::clone(&mux),
        )?;

        info!(
            openocd_pid = openocd.pid(),
            gdb_pid = gdb.pid(),
            telnet = %telnet.addr(),
            "JTAG stack ready"
        );
        Ok(Self {
            openocd,
            gdb,
            telnet,
            console,
        })
    }

    /// Send a debug server command over the control connection.
    pub fn send(&self, command: impl AsRef<[u8]>) -> Result<(), TransportError> {
        self.telnet.send(command.as_ref())
    }

    pub fn debug_server(&self) -> &ManagedProcess {
        &self.openocd
    }

    pub fn debugger(&self) -> &ManagedProcess {
        &self.gdb
    }

    pub fn console(&self) -> Option<&SerialTransport> {
        self.console.as_ref()
    }
}

impl Transport for JtagStack {
    fn kind(&self) -> &'static str {
        "jtag"
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        match &self.console {
            Some(console) => console.write(data),
            None => Err(TransportError::Unsupported("write without a serial console")),
        }
    }

    /// Close the console, the debugger, the debug server and the control
    /// connection, in that order. Every step runs even if an earlier one
    /// failed.
    fn close(&self) -> Result<(), TransportError> {
        let steps: [TeardownStep<'_>; 4] = [
            ("serial console", &|| self.console.as_ref().map_or(Ok(()), |c| c.close())),
            ("debugger", &|| self.gdb.terminate()),
            ("debug server", &|| self.openocd.terminate()),
            ("control connection", &|| self.telnet.close()),
        ];
        run_teardown(&steps)
    }

    fn is_open(&self) -> bool {
        self.openocd.is_running()
    }
}

type TeardownStep<'a> = (&'static str, &'a dyn Fn() -> Result<(), TransportError>);

/// Run every step in order, collecting `label: error` for each failure.
fn run_teardown(steps: &[TeardownStep<'_>]) -> Result<(), TransportError> {
    let mut failures = Vec::new();
    for (label, step) in steps {
        if let Err(e) = step() {
            warn!(step = *label, error = %e, "JTAG teardown step failed");
            failures.push(format!("{label}: {e}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TransportError::Teardown(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdb_program() {
        let config = JtagConfig::default();
        assert_eq!(config.gdb_program("esp32"), "xtensa-esp32-elf-gdb");
        assert_eq!(config.gdb_program("esp32s3"), "xtensa-esp32s3-elf-gdb");
        assert_eq!(config.gdb_program("esp32c3"), "riscv32-esp-elf-gdb");

        let config = JtagConfig {
            gdb_bin: Some("gdb-multiarch".into()),
            ..Default::default()
        };
        assert_eq!(config.gdb_program("esp32"), "gdb-multiarch");
    }

    #[test]
    fn test_teardown_continues_after_failure() {
        use std::cell::RefCell;

        let order = RefCell::new(Vec::new());
        let step = |label: &'static str, fail: bool| {
            let order = &order;
            move || {
                order.borrow_mut().push(label);
                if fail {
                    Err(TransportError::WriteFailed("kill refused".into()))
                } else {
                    Ok(())
                }
            }
        };
        let console = step("serial console", false);
        let debugger = step("debugger", true);
        let server = step("debug server", false);
        let control = step("control connection", true);

        let steps: [TeardownStep<'_>; 4] = [
            ("serial console", &console),
            ("debugger", &debugger),
            ("debug server", &server),
            ("control connection", &control),
        ];
        let err = run_teardown(&steps).unwrap_err();

        assert_eq!(
            *order.borrow(),
            vec!["serial console", "debugger", "debug server", "control connection"]
        );
        let failures = match err {
            TransportError::Teardown(failures) => failures,
            other => panic!("expected a teardown error, got {other:?}"),
        };
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("debugger: "));
        assert!(failures[0].contains("kill refused"));
        assert!(failures[1].starts_with("control connection: "));
    }

    #[test]
    fn test_teardown_all_ok() {
        let ok = || -> Result<(), TransportError> { Ok(()) };
        let steps: [TeardownStep<'_>; 2] = [("debugger", &ok), ("debug server", &ok)];
        assert!(run_teardown(&steps).is_ok());
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: JtagConfig = toml::from_str("telnet_port = 5555\nsettle_delay_ms = 0\n").unwrap();
        assert_eq!(config.telnet_port, 5555);
        assert_eq!(config.settle_delay_ms, 0);
        assert_eq!(config.openocd_bin, "openocd");
    }

    #[cfg(unix)]
    mod stack {
        use super::*;
        use std::io::{BufRead, BufReader, Write};
        use std::net::TcpListener;
        use std::sync::mpsc;

        /// Stand-in for the debug server's telnet port: greets, then reports
        /// every received line on a channel.
        fn fake_telnet() -> (u16, mpsc::Receiver<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                stream.write_all(b"Open On-Chip Debugger\r\n").unwrap();
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            (port, rx)
        }

        fn fake_config(telnet_port: u16) -> JtagConfig {
            JtagConfig {
                openocd_bin: "sh".into(),
                openocd_args: vec![
                    "-c".into(),
                    "echo 'Info : Listening on port 4444 for telnet connections'; exec sleep 30".into(),
                ],
                telnet_host: "127.0.0.1".into(),
                telnet_port,
                gdb_bin: Some("sh".into()),
                gdb_args: vec!["-c".into(), "echo 'GNU gdb (esp-gdb) 12.1'; exec sleep 30".into()],
                settle_delay_ms: 0,
                connect_timeout_ms: 2000,
                forward_control_output: true,
            }
        }

        #[test]
        fn test_stack_forwards_all_sources() {
            let (port, commands) = fake_telnet();
            let mux = LogMultiplexer::new();
            let stack = JtagStack::open(&fake_config(port), None, None, Arc::clone(&mux)).unwrap();

            let timeout = Duration::from_secs(5);
            assert!(mux.wait_for(Some(SOURCE_DEBUG_SERVER), "Listening on port 4444", timeout));
            assert!(mux.wait_for(Some(SOURCE_DEBUGGER), "GNU gdb", timeout));
            assert!(mux.wait_for(Some(crate::logmux::SOURCE_CONTROL), "Open On-Chip", timeout));

            stack.send("reset halt").unwrap();
            stack.send(b"resume".as_slice()).unwrap();
            assert_eq!(commands.recv_timeout(timeout).unwrap(), "reset halt");
            assert_eq!(commands.recv_timeout(timeout).unwrap(), "resume");

            assert!(matches!(stack.write(b"x"), Err(TransportError::Unsupported(_))));

            assert!(stack.is_open());
            stack.close().unwrap();
            assert!(!stack.is_open());
            assert!(!stack.debugger().is_running());
            assert!(matches!(
                commands.recv_timeout(timeout),
                Err(mpsc::RecvTimeoutError::Disconnected)
            ));
            stack.close().unwrap();
        }

        #[test]
        fn test_debug_server_never_accepts() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let err = JtagStack::open(&fake_config(port), None, None, LogMultiplexer::new());
            assert!(matches!(err, Err(TransportError::Connection { .. })));
        }

        #[test]
        fn test_missing_debug_server_binary() {
            let config = JtagConfig {
                openocd_bin: "/nonexistent/openocd".into(),
                ..fake_config(1)
            };
            let err = JtagStack::open(&config, None, None, LogMultiplexer::new());
            assert!(matches!(err, Err(TransportError::Launch { .. })));
        }
    }
}
