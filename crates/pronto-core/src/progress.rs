//! Print progress and pause/resume tracking.
//!
//! A print either streams from the host (the transport's queue cursor is
//! the progress) or runs from the card (progress comes from the last
//! "SD printing byte N/M" sample). [`PrintController`] exposes one progress
//! view for both and owns the Idle/Printing/Paused mode.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument};

use crate::error::{ConsoleError, Operation, Result};
use crate::protocol::{self, markers};
use crate::transport::PrinterTransport;

/// Print mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintMode {
    #[default]
    Idle,
    Printing,
    Paused,
}

impl fmt::Display for PrintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrintMode::Idle => write!(f, "idle"),
            PrintMode::Printing => write!(f, "printing"),
            PrintMode::Paused => write!(f, "paused"),
        }
    }
}

/// Where the running print reads its commands from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintOrigin {
    /// Streamed line by line from this console.
    Host,
    /// Read by the printer from its card.
    Card,
}

/// Progress state shared between sessions and the operator layer.
#[derive(Debug, Clone, Default)]
pub struct PrintProgress {
    pub mode: PrintMode,
    pub origin: Option<PrintOrigin>,
    pub host_numerator: usize,
    pub host_denominator: usize,
    pub card_percent: Option<f64>,
}

impl PrintProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Printing` for a new print.
    pub fn start(&mut self, origin: PrintOrigin) {
        self.mode = PrintMode::Printing;
        self.origin = Some(origin);
        match origin {
            PrintOrigin::Host => {
                self.host_numerator = 0;
                self.host_denominator = 0;
            }
            PrintOrigin::Card => self.card_percent = None,
        }
    }

    /// Back to `Idle`; the last progress values stay readable.
    pub fn finish(&mut self) {
        self.mode = PrintMode::Idle;
    }

    /// Mirror the transport's queue cursor.
    pub fn sync_host(&mut self, cursor: usize, length: usize) {
        self.host_numerator = cursor;
        self.host_denominator = length;
    }

    /// Update `card_percent` from a progress line.
    ///
    /// A malformed line leaves the previous value in place.
    pub fn record_card_sample(&mut self, line: &str) -> Result<f64> {
        let sample =
            markers::parse_card_progress(line).ok_or_else(|| ConsoleError::MalformedProgressLine {
                line: line.to_string(),
            })?;
        let pct = sample.percent();
        self.card_percent = Some(pct);
        Ok(pct)
    }

    /// Completion percentage for the current (or last) print.
    pub fn percent(&self) -> Option<f64> {
        match self.origin? {
            PrintOrigin::Host if self.host_denominator > 0 => {
                Some(100.0 * self.host_numerator as f64 / self.host_denominator as f64)
            }
            PrintOrigin::Host => None,
            PrintOrigin::Card => self.card_percent,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            mode: self.mode,
            origin: self.origin,
            percent: self.percent(),
            host: (self.host_numerator, self.host_denominator),
            card_percent: self.card_percent,
        }
    }
}

/// Point-in-time progress read.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub mode: PrintMode,
    pub origin: Option<PrintOrigin>,
    pub percent: Option<f64>,
    pub host: (usize, usize),
    pub card_percent: Option<f64>,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.origin, self.percent) {
            (Some(PrintOrigin::Host), Some(pct)) => {
                write!(f, "{}: print progress {:.1}%", self.mode, pct)
            }
            (Some(PrintOrigin::Card), Some(pct)) => {
                write!(f, "{}: SD print progress {:.1}%", self.mode, pct)
            }
            _ => write!(f, "{}", self.mode),
        }
    }
}

/// Cloneable handle to the shared [`PrintProgress`].
#[derive(Debug, Clone, Default)]
pub struct SharedProgress(Arc<Mutex<PrintProgress>>);

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, PrintProgress> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> PrintMode {
        self.lock().mode
    }
}

/// Owns print mode transitions for both print origins.
pub struct PrintController {
    transport: Arc<dyn PrinterTransport>,
    progress: SharedProgress,
}

impl PrintController {
    pub fn new(transport: Arc<dyn PrinterTransport>, progress: SharedProgress) -> Self {
        Self {
            transport,
            progress,
        }
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    /// Stream `lines` from the host.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub fn start_host_print(&self, lines: Vec<String>) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(ConsoleError::NotConnected {
                operation: Operation::HostPrint,
            });
        }
        self.refresh();
        let mode = self.progress.mode();
        if mode != PrintMode::Idle {
            return Err(ConsoleError::InvalidStateTransition {
                operation: Operation::HostPrint,
                mode,
            });
        }
        let total = lines.len();
        self.transport.start_print(lines)?;
        let mut progress = self.progress.lock();
        progress.start(PrintOrigin::Host);
        progress.sync_host(0, total);
        info!(total, "Host print started");
        Ok(())
    }

    /// Pause the running print.
    #[instrument(skip(self))]
    pub fn pause(&self) -> Result<()> {
        self.transition(Operation::Pause, PrintMode::Printing, PrintMode::Paused)
    }

    /// Resume a paused print.
    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<()> {
        self.transition(Operation::Resume, PrintMode::Paused, PrintMode::Printing)
    }

    /// Current progress, with the host cursor freshly read.
    pub fn current_progress(&self) -> ProgressSnapshot {
        self.refresh();
        self.progress.lock().snapshot()
    }

    /// Pull the host queue cursor and notice a finished host print.
    fn refresh(&self) {
        let mut progress = self.progress.lock();
        if progress.origin != Some(PrintOrigin::Host) {
            return;
        }
        let cursor = self.transport.queue_cursor();
        let length = self.transport.queue_length();
        progress.sync_host(cursor, length);
        if progress.mode == PrintMode::Printing && !self.transport.is_printing() {
            debug!(cursor, length, "Host print queue exhausted");
            progress.finish();
        }
    }

    fn transition(&self, operation: Operation, from: PrintMode, to: PrintMode) -> Result<()> {
        self.refresh();
        // The transport call below may dispatch lines into listeners that
        // take the progress lock, so it runs with the lock released.
        let origin = {
            let mut progress = self.progress.lock();
            if progress.mode != from {
                return Err(ConsoleError::InvalidStateTransition {
                    operation,
                    mode: progress.mode,
                });
            }
            progress.mode = to;
            progress.origin
        };

        let sent = match (origin, to) {
            (Some(PrintOrigin::Card), PrintMode::Paused) => {
                self.transport.send_now(protocol::PAUSE_CARD_PRINT)
            }
            (Some(PrintOrigin::Card), _) => self.transport.send_now(protocol::START_CARD_PRINT),
            (_, PrintMode::Paused) => {
                self.transport.pause();
                Ok(())
            }
            _ => {
                self.transport.resume();
                Ok(())
            }
        };

        if let Err(e) = sent {
            self.progress.lock().mode = from;
            return Err(e.into());
        }
        info!(from = %from, to = %to, origin = ?origin, "Print mode changed");
        Ok(())
    }
}
