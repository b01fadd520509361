//! Supervised external processes (debug server, debugger client).

use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::forward::spawn_forwarder;
use super::traits::TransportError;
use crate::logmux::LogMultiplexer;

/// A child process whose stdout and stderr are forwarded into the log
/// multiplexer under one source tag.
pub struct ManagedProcess {
    name: &'static str,
    program: String,
    pid: u32,
    child: Mutex<Option<Child>>,
    // held open so interactive tools do not see EOF on stdin and exit
    stdin: Mutex<Option<ChildStdin>>,
}

impl ManagedProcess {
    /// Spawn `program args...` and start forwarding its output tagged `name`.
    ///
    /// The output forwarders are detached: they finish on their own once
    /// the process (and anything it spawned) closes the pipes.
    pub fn spawn(
        name: &'static str,
        program: &str,
        args: &[String],
        mux: Arc<LogMultiplexer>,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Launch {
                program: program.to_string(),
                message: e.to_string(),
            })?;
        let pid = child.id();
        info!(name, program, ?args, pid, "Process started");

        // readers never stop early on their own flag, only on EOF
        let never = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let started = stdout
            .map(|out| spawn_forwarder(name, out, Arc::clone(&mux), Arc::clone(&never)))
            .transpose()
            .and_then(|_| {
                stderr
                    .map(|err| spawn_forwarder(name, err, Arc::clone(&mux), Arc::clone(&never)))
                    .transpose()
            });
        if let Err(e) = started {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Launch {
                program: program.to_string(),
                message: format!("failed to start output forwarding: {e}"),
            });
        }

        Ok(Self {
            name,
            program: program.to_string(),
            pid,
            stdin: Mutex::new(child.stdin.take()),
            child: Mutex::new(Some(child)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        match self.child.lock().unwrap().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill and reap the process. Only the first call does anything.
    pub fn terminate(&self) -> Result<(), TransportError> {
        let Some(mut child) = self.child.lock().unwrap().take() else {
            return Ok(());
        };
        drop(self.stdin.lock().unwrap().take());

        // a failed status query still gets a kill attempt
        let exited = child.try_wait().unwrap_or_else(|e| {
            warn!(name = self.name, error = %e, "Status query failed");
            None
        });
        match exited {
            Some(status) => {
                debug!(name = self.name, %status, "Process already exited");
            }
            None => {
                if let Err(e) = child.kill() {
                    warn!(name = self.name, error = %e, "Kill failed");
                    return Err(TransportError::Teardown(vec![format!(
                        "{} ({}): {e}",
                        self.name, self.program
                    )]));
                }
                let status = child.wait()?;
                info!(name = self.name, pid = self.pid, %status, "Process terminated");
            }
        }
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}
