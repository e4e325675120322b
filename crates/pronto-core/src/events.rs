//! Event system for UI decoupling.
//!
//! The CLI (or any other front end) subscribes to console events
//! without the core knowing how they are displayed.

use std::fmt;

use crate::error::Operation;
use crate::session::SessionKind;

/// Events emitted by the console core.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    /// Printer answered and is ready for commands.
    Online,
    /// Transport lost the printer.
    Offline,
    /// A session moved between states.
    SessionState {
        kind: SessionKind,
        target: Option<String>,
        from: String,
        to: String,
    },
    /// Progress update for a transfer or print.
    Progress {
        operation: Operation,
        current: u64,
        total: u64,
    },
    /// Printer line worth showing to the operator verbatim.
    PrinterMessage { line: String },
    /// A listener returned an error or panicked during dispatch.
    ListenerFailed { listener: String, message: String },
}

impl fmt::Display for ConsoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleEvent::Online => write!(f, "Printer is now online"),
            ConsoleEvent::Offline => write!(f, "Printer went offline"),
            ConsoleEvent::SessionState {
                kind,
                target,
                from,
                to,
            } => match target {
                Some(t) => write!(f, "{} '{}': {} -> {}", kind, t, from, to),
                None => write!(f, "{}: {} -> {}", kind, from, to),
            },
            ConsoleEvent::Progress {
                operation,
                current,
                total,
            } => write!(f, "{}: {}/{}", operation, current, total),
            ConsoleEvent::PrinterMessage { line } => write!(f, "{}", line),
            ConsoleEvent::ListenerFailed { listener, message } => {
                write!(f, "listener '{}' failed: {}", listener, message)
            }
        }
    }
}

/// Observer trait for receiving console events.
///
/// Called from the line reader thread, so implementations must not block.
pub trait ConsoleObserver: Send + Sync {
    fn on_event(&self, event: &ConsoleEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ConsoleObserver for NullObserver {
    fn on_event(&self, _event: &ConsoleEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ConsoleObserver for TracingObserver {
    fn on_event(&self, event: &ConsoleEvent) {
        match event {
            ConsoleEvent::Online => tracing::info!("Printer online"),
            ConsoleEvent::Offline => tracing::warn!("Printer offline"),
            ConsoleEvent::SessionState {
                kind,
                target,
                from,
                to,
            } => {
                tracing::info!(kind = %kind, file = ?target, from = %from, to = %to, "Session state changed");
            }
            ConsoleEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            ConsoleEvent::PrinterMessage { line } => tracing::info!(line = %line, "Printer"),
            ConsoleEvent::ListenerFailed { listener, message } => {
                tracing::error!(listener = %listener, "Listener failed: {}", message);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that keeps every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<ConsoleEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<ConsoleEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ConsoleObserver for RecordingObserver {
        fn on_event(&self, event: &ConsoleEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
