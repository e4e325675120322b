//! Console event output for the operator.

use std::io::Write;

use pronto_core::{ConsoleEvent, ConsoleObserver, TracingObserver};

/// Prints what the operator should see on stdout and leaves the rest to
/// tracing.
pub struct OperatorObserver;

impl ConsoleObserver for OperatorObserver {
    fn on_event(&self, event: &ConsoleEvent) {
        match event {
            ConsoleEvent::Online => say("Printer is now online."),
            ConsoleEvent::Offline => say("Printer went offline."),
            ConsoleEvent::PrinterMessage { line } => say(line),
            _ => TracingObserver.on_event(event),
        }
    }
}

fn say(message: &str) {
    let mut out = std::io::stdout().lock();
    // The prompt may be waiting on this line; a lost message is not an error.
    let _ = writeln!(out, "{}", message);
    let _ = out.flush();
}
