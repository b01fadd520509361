//! Event system for UI decoupling.
//!
//! Allows CLI/test harnesses to subscribe to session lifecycle events
//! without tight coupling to the core logic.

use std::fmt;

/// Session lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Opening the transport.
    Connecting,
    /// Transport open, I/O flowing.
    Running,
    /// Running close actions.
    TearingDown,
    /// All close actions done.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Connecting => write!(f, "Connecting"),
            SessionPhase::Running => write!(f, "Running"),
            SessionPhase::TearingDown => write!(f, "Tearing Down"),
            SessionPhase::Closed => write!(f, "Closed"),
        }
    }
}

/// Events emitted by a DUT session.
#[derive(Debug, Clone)]
pub enum DutEvent {
    /// Phase changed.
    PhaseChanged { from: SessionPhase, to: SessionPhase },
    /// Build artifact resolved.
    ArtifactResolved {
        target: String,
        segments: usize,
        partitions: usize,
    },
    /// Transport opened.
    TransportOpened { kind: &'static str },
    /// Bytes written to the device.
    Written { length: usize },
    /// Command sent over the debug server's control connection.
    CommandSent { command: String },
    /// One close action ran.
    TeardownStep { label: String, ok: bool },
    /// Teardown finished.
    SessionClosed { failures: usize },
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DutObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DutEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DutObserver for NullObserver {
    fn on_event(&self, _event: &DutEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DutObserver for TracingObserver {
    fn on_event(&self, event: &DutEvent) {
        match event {
            DutEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            DutEvent::ArtifactResolved {
                target,
                segments,
                partitions,
            } => {
                tracing::info!(target_chip = %target, segments, partitions, "Artifact resolved");
            }
            DutEvent::TransportOpened { kind } => {
                tracing::info!(kind, "Transport opened");
            }
            DutEvent::Written { length } => {
                tracing::trace!(len = length, "Written");
            }
            DutEvent::CommandSent { command } => {
                tracing::debug!(command = %command, "Command sent");
            }
            DutEvent::TeardownStep { label, ok } => {
                if *ok {
                    tracing::debug!(step = %label, "Teardown step done");
                } else {
                    tracing::warn!(step = %label, "Teardown step failed");
                }
            }
            DutEvent::SessionClosed { failures } => {
                tracing::info!(failures, "Session closed");
            }
        }
    }
}
