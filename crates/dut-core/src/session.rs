//! DUT session - composes a build artifact with one transport.
//!
//! The session owns the log multiplexer, the transport and an ordered list
//! of close actions. Actions run in the order they were registered, not in
//! reverse, because later resources may need earlier ones to stay open
//! while they shut down.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::artifact::{ArtifactOptions, BuildArtifact, PartitionTable};
use crate::events::{DutEvent, DutObserver, SessionPhase, TracingObserver};
use crate::logmux::{LogMultiplexer, LogReader};
use crate::transport::serial::DEFAULT_BAUD;
use crate::transport::{
    ConnectionTarget, DutTransport, JtagConfig, JtagStack, SerialTransport, Transport,
    TransportError,
};

/// Configuration for a DUT session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutConfig {
    /// Application directory containing `build/`.
    pub app_path: Option<PathBuf>,
    /// Partition tool override.
    pub part_tool: Option<PathBuf>,
    /// Interpreter for `.py` partition tools.
    pub python: String,
    /// Serial device or `socket://host:port`.
    pub port: Option<String>,
    pub baud: u32,
    /// Copy of the merged log.
    pub log_file: Option<PathBuf>,
    /// Use the JTAG stack (with `port` as its serial console, if set).
    pub jtag: Option<JtagConfig>,
}

impl Default for DutConfig {
    fn default() -> Self {
        Self {
            app_path: None,
            part_tool: None,
            python: "python3".to_string(),
            port: None,
            baud: DEFAULT_BAUD,
            log_file: None,
            jtag: None,
        }
    }
}

impl DutConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DutConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Artifact options from this config, with `IDF_PATH` from the environment.
    pub fn artifact_options(&self) -> ArtifactOptions {
        ArtifactOptions {
            part_tool: self.part_tool.clone(),
            python: self.python.clone(),
            ..ArtifactOptions::from_env()
        }
    }
}

type CloseAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Every close action that failed during teardown.
#[derive(Debug)]
pub struct TeardownError {
    pub failures: Vec<(String, String)>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} close action(s) failed", self.failures.len())?;
        for (label, message) in &self.failures {
            write!(f, "\n  {label}: {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

/// DUT session - one artifact, one transport, one log stream.
pub struct DutSession<T: Transport + 'static, O: DutObserver = TracingObserver> {
    artifact: Option<BuildArtifact>,
    transport: Arc<T>,
    mux: Arc<LogMultiplexer>,
    observer: Arc<O>,
    close_actions: Vec<(String, CloseAction)>,
    closed: bool,
}

impl<T: Transport + 'static> DutSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(artifact: Option<BuildArtifact>, transport: T, mux: Arc<LogMultiplexer>) -> Self {
        Self::with_observer(artifact, transport, mux, Arc::new(TracingObserver))
    }
}

impl DutSession<DutTransport, TracingObserver> {
    /// Resolve the artifact and open the transport described by `config`.
    #[instrument(skip_all)]
    pub fn open(config: &DutConfig) -> Result<Self> {
        let artifact = config
            .app_path
            .as_ref()
            .map(|p| BuildArtifact::resolve_with(p, &config.artifact_options()))
            .transpose()?;

        let mux = match &config.log_file {
            Some(path) => LogMultiplexer::with_log_file(path)
                .with_context(|| format!("opening log file {}", path.display()))?,
            None => LogMultiplexer::new(),
        };

        let serial = config
            .port
            .as_deref()
            .map(|port| {
                let target = ConnectionTarget::from_port(port, config.baud)?;
                SerialTransport::open(&target, Arc::clone(&mux))
            })
            .transpose()?;

        let transport = match (&config.jtag, serial) {
            (Some(jtag), console) => DutTransport::Jtag(JtagStack::open(
                jtag,
                artifact.as_ref(),
                console,
                Arc::clone(&mux),
            )?),
            (None, Some(serial)) => DutTransport::Serial(serial),
            (None, None) => bail!("No transport configured: set `port` or `jtag`"),
        };

        Ok(Self::new(artifact, transport, mux))
    }
}

impl<O: DutObserver + 'static> DutSession<DutTransport, O> {
    /// Send a debug server command. Only available on a JTAG session.
    pub fn send(&self, command: impl AsRef<[u8]>) -> Result<(), TransportError> {
        let stack = self
            .transport
            .as_jtag()
            .ok_or(TransportError::Unsupported("send on a serial session"))?;
        stack.send(command.as_ref())?;
        self.observer.on_event(&DutEvent::CommandSent {
            command: String::from_utf8_lossy(command.as_ref()).into_owned(),
        });
        Ok(())
    }
}

impl<T: Transport + 'static, O: DutObserver + 'static> DutSession<T, O> {
    /// Create a new session with a custom observer.
    ///
    /// Registers the transport close and the log flush as the first close
    /// actions.
    pub fn with_observer(
        artifact: Option<BuildArtifact>,
        transport: T,
        mux: Arc<LogMultiplexer>,
        observer: Arc<O>,
    ) -> Self {
        if let Some(a) = &artifact {
            observer.on_event(&DutEvent::ArtifactResolved {
                target: a.target().to_string(),
                segments: a.flash_files().map_or(0, <[_]>::len),
                partitions: a.partition_table().map_or(0, PartitionTable::len),
            });
        }
        observer.on_event(&DutEvent::TransportOpened {
            kind: transport.kind(),
        });

        let mut session = Self {
            artifact,
            transport: Arc::new(transport),
            mux,
            observer,
            close_actions: Vec::new(),
            closed: false,
        };

        let transport = Arc::clone(&session.transport);
        session.register_close("transport", move || Ok(transport.close()?));
        let mux = Arc::clone(&session.mux);
        session.register_close("log", move || Ok(mux.finish()?));

        session.observer.on_event(&DutEvent::PhaseChanged {
            from: SessionPhase::Connecting,
            to: SessionPhase::Running,
        });
        session
    }

    /// Append a close action. Actions run once, in registration order.
    ///
    /// Registering on an already closed session runs the action right away.
    pub fn register_close<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        if self.closed {
            warn!(label = %label, "Session already closed, running close action now");
            if let Err(e) = action() {
                error!(label = %label, error = %e, "Close action failed");
            }
            return;
        }
        self.close_actions.push((label, Box::new(action)));
    }

    /// Write raw bytes to the device.
    pub fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let n = self.transport.write(data)?;
        self.observer.on_event(&DutEvent::Written { length: n });
        Ok(n)
    }

    pub fn artifact(&self) -> Option<&BuildArtifact> {
        self.artifact.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The session's log multiplexer.
    pub fn log(&self) -> &Arc<LogMultiplexer> {
        &self.mux
    }

    /// Blocking reader over the merged log, for pattern matchers.
    pub fn reader(&self) -> LogReader {
        self.mux.reader()
    }

    /// Wait until `needle` shows up anywhere in the merged log.
    pub fn expect(&self, needle: &str, timeout: Duration) -> Result<()> {
        if self.mux.wait_for(None, needle, timeout) {
            Ok(())
        } else {
            Err(anyhow!(
                "Timed out after {}ms waiting for {:?}",
                timeout.as_millis(),
                needle
            ))
        }
    }

    /// Like [`expect`](Self::expect), restricted to one source.
    pub fn expect_from(&self, source: &str, needle: &str, timeout: Duration) -> Result<()> {
        if self.mux.wait_for(Some(source), needle, timeout) {
            Ok(())
        } else {
            Err(anyhow!(
                "Timed out after {}ms waiting for {:?} from {}",
                timeout.as_millis(),
                needle,
                source
            ))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run every close action once, in registration order.
    ///
    /// A failing action does not stop the ones after it. Calling `close`
    /// again does nothing and succeeds.
    pub fn close(&mut self) -> Result<(), TeardownError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.observer.on_event(&DutEvent::PhaseChanged {
            from: SessionPhase::Running,
            to: SessionPhase::TearingDown,
        });

        let mut failures = Vec::new();
        for (label, action) in std::mem::take(&mut self.close_actions) {
            let result = action();
            self.observer.on_event(&DutEvent::TeardownStep {
                label: label.clone(),
                ok: result.is_ok(),
            });
            if let Err(e) = result {
                failures.push((label, format!("{e:#}")));
            }
        }

        self.observer.on_event(&DutEvent::SessionClosed {
            failures: failures.len(),
        });
        self.observer.on_event(&DutEvent::PhaseChanged {
            from: SessionPhase::TearingDown,
            to: SessionPhase::Closed,
        });

        if failures.is_empty() {
            info!("Session closed");
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Close the session after a test body ran.
    ///
    /// A failed `result` wins over teardown failures, which are then only
    /// logged.
    pub fn finish<R>(mut self, result: Result<R>) -> Result<R> {
        let teardown = self.close();
        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(teardown)) => Err(teardown.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                error!(%teardown, "Teardown failed after test failure");
                Err(e)
            }
        }
    }
}

impl<T: Transport + 'static, O: DutObserver> Drop for DutSession<T, O> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (label, action) in std::mem::take(&mut self.close_actions) {
            if let Err(e) = action() {
                error!(label = %label, error = %e, "Close action failed during drop");
            }
        }
    }
}
