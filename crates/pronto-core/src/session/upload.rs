//! Upload of a local G-code file to the card (M28 ... M29).
//!
//! The file is streamed through the transport's print queue on a worker
//! thread. Whatever happens after M28 (completion, cancellation, the card
//! refusing the file) the worker sends M29 before reporting, so the card
//! never keeps an open write handle. Losing the link is the exception:
//! the upload then fails with [`TransportError::Disconnected`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use super::{Completion, SessionContext, SessionKind, start_listing};
use crate::bus::{Disposition, LineListener};
use crate::error::{ConsoleError, Operation, Result};
use crate::events::ConsoleEvent;
use crate::gcode;
use crate::protocol::{self, markers};
use crate::transport::TransportError;

/// Upload session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Opening,
    Streaming,
    Closing,
    Confirming,
    Done,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Opening => write!(f, "opening"),
            UploadState::Streaming => write!(f, "streaming"),
            UploadState::Closing => write!(f, "closing"),
            UploadState::Confirming => write!(f, "confirming"),
            UploadState::Done => write!(f, "done"),
            UploadState::Failed => write!(f, "failed"),
        }
    }
}

/// Successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub target: String,
    pub lines: usize,
}

/// Upload tuning, usually taken from the console config.
#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    /// How often the queue cursor is sampled.
    pub poll_interval: Duration,
    /// Bound on the confirming listing.
    pub listing_timeout: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            listing_timeout: Duration::from_secs(2),
        }
    }
}

/// Lines sent so far; never decreases.
#[derive(Debug, Default)]
struct Progress {
    sent: AtomicUsize,
    total: AtomicUsize,
}

impl Progress {
    fn advance(&self, cursor: usize) {
        self.sent.fetch_max(cursor, Ordering::AcqRel);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.sent.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire),
        )
    }
}

/// Handle to a running upload.
pub struct UploadHandle {
    target: String,
    progress: Arc<Progress>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<UploadState>>,
    receiver: Receiver<Result<UploadReport>>,
}

impl UploadHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// `(lines_sent, total_lines)`.
    pub fn progress(&self) -> (usize, usize) {
        self.progress.get()
    }

    pub fn state(&self) -> UploadState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the worker to stop streaming. It still closes the card file.
    pub fn cancel(&self) {
        if !self.cancel.swap(true, Ordering::AcqRel) {
            info!(file = %self.target, "Upload cancellation requested");
        }
    }

    /// Block until the upload resolves.
    ///
    /// If `timeout` passes first the upload is cancelled and the result of
    /// the close-and-report sequence is returned.
    pub fn wait(&self, timeout: Duration) -> Result<UploadReport> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(file = %self.target, "Upload timed out, cancelling");
                self.cancel();
                self.receiver.recv().unwrap_or(Err(ConsoleError::SessionAbandoned {
                    operation: Operation::Upload,
                }))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ConsoleError::SessionAbandoned {
                operation: Operation::Upload,
            }),
        }
    }

    /// Non-blocking check for a result.
    pub fn try_result(&self) -> Option<Result<UploadReport>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ConsoleError::SessionAbandoned {
                operation: Operation::Upload,
            })),
        }
    }
}

/// Watches for the card refusing the file while it streams.
struct OpenFailedWatch {
    seen: Arc<AtomicBool>,
}

impl LineListener for OpenFailedWatch {
    fn on_line(&self, line: &str) -> anyhow::Result<Disposition> {
        if line.contains(markers::OPEN_FAILED) {
            self.seen.store(true, Ordering::Release);
            return Ok(Disposition::Done);
        }
        Ok(Disposition::Keep)
    }

    fn name(&self) -> &str {
        "upload open watch"
    }
}

/// Check preconditions, then stream `local_path` to the card as `target`.
#[instrument(skip_all, fields(local = %local_path.as_ref().display(), file = %target))]
pub fn start_upload(
    ctx: &SessionContext,
    local_path: impl AsRef<Path>,
    target: &str,
    settings: UploadSettings,
) -> Result<UploadHandle> {
    ctx.require_connection(Operation::Upload)?;
    let target = target.trim();
    if target.is_empty() {
        return Err(ConsoleError::InvalidArgument(
            "upload needs a target name in 8.3 format".into(),
        ));
    }
    let lines = gcode::load_lines(local_path.as_ref())?;
    let target = target.to_string();

    let progress = Arc::new(Progress::default());
    progress.total.store(lines.len(), Ordering::Release);
    let cancel = Arc::new(AtomicBool::new(false));
    let state = Arc::new(Mutex::new(UploadState::Opening));
    let (completion, receiver) = Completion::new();

    let worker = UploadWorker {
        ctx: ctx.clone(),
        target: target.clone(),
        source: local_path.as_ref().to_path_buf(),
        progress: progress.clone(),
        cancel: cancel.clone(),
        state: state.clone(),
        settings,
    };
    thread::Builder::new()
        .name(format!("upload-{}", target))
        .spawn(move || {
            let result = worker.run(lines);
            worker.finish(&result);
            completion.complete(result);
        })?;

    Ok(UploadHandle {
        target,
        progress,
        cancel,
        state,
        receiver,
    })
}

enum StreamEnd {
    Drained,
    Cancelled,
    OpenFailed,
}

struct UploadWorker {
    ctx: SessionContext,
    target: String,
    source: PathBuf,
    progress: Arc<Progress>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<UploadState>>,
    settings: UploadSettings,
}

impl UploadWorker {
    fn run(&self, lines: Vec<String>) -> Result<UploadReport> {
        let total = lines.len();
        info!(source = %self.source.display(), file = %self.target, total, "Uploading");

        let open_failed = Arc::new(AtomicBool::new(false));
        let watch_id = self.ctx.bus.register(Arc::new(OpenFailedWatch {
            seen: open_failed.clone(),
        }));

        let result = self.stream(lines, &open_failed);
        self.ctx.bus.deregister(watch_id);
        let end = result?;

        self.goto(UploadState::Closing);
        let closed = self
            .ctx
            .transport
            .send_now(&protocol::close_card_file(&self.target));

        let (sent, total) = self.progress.get();
        match end {
            StreamEnd::Cancelled => {
                if let Err(e) = closed {
                    error!(file = %self.target, error = %e, "Could not close card file after cancel");
                }
                Err(ConsoleError::UploadInterrupted {
                    target: self.target.clone(),
                    sent,
                    total,
                })
            }
            StreamEnd::OpenFailed => {
                if let Err(e) = closed {
                    error!(file = %self.target, error = %e, "Could not close card file after open failure");
                }
                Err(ConsoleError::CardOpenFailed {
                    operation: Operation::Upload,
                    target: self.target.clone(),
                })
            }
            StreamEnd::Drained => {
                closed?;
                self.confirm(total)
            }
        }
    }

    /// M28, queue the lines, and poll the cursor until the queue ends.
    fn stream(&self, lines: Vec<String>, open_failed: &AtomicBool) -> Result<StreamEnd> {
        let transport = &self.ctx.transport;
        transport.send_now(&protocol::open_card_file(&self.target))?;

        self.goto(UploadState::Streaming);
        if let Err(e) = transport.start_print(lines) {
            // The card file is open; close it before reporting.
            if let Err(close) = transport.send_now(&protocol::close_card_file(&self.target)) {
                error!(file = %self.target, error = %close, "Could not close card file after queue failure");
            }
            return Err(e.into());
        }

        loop {
            self.sample();
            if self.cancel.load(Ordering::Acquire) {
                transport.stop_print();
                self.sample();
                return Ok(StreamEnd::Cancelled);
            }
            if open_failed.load(Ordering::Acquire) {
                transport.stop_print();
                return Ok(StreamEnd::OpenFailed);
            }
            if !transport.is_connected() {
                transport.stop_print();
                let (sent, total) = self.progress.get();
                warn!(file = %self.target, sent, total, "Printer went offline during upload");
                return Err(TransportError::Disconnected.into());
            }
            if !transport.is_printing() {
                self.sample();
                return Ok(StreamEnd::Drained);
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn sample(&self) {
        let cursor = self.ctx.transport.queue_cursor();
        self.progress.advance(cursor);
        let (sent, total) = self.progress.get();
        self.ctx.emit(ConsoleEvent::Progress {
            operation: Operation::Upload,
            current: sent as u64,
            total: total as u64,
        });
    }

    /// Re-list the card and check the new file is there.
    fn confirm(&self, lines: usize) -> Result<UploadReport> {
        self.goto(UploadState::Confirming);
        let files = start_listing(&self.ctx)?.wait(self.settings.listing_timeout)?;
        if files.contains(&self.target.to_lowercase()) {
            info!(file = %self.target, lines, "Upload confirmed on card");
            Ok(UploadReport {
                target: self.target.clone(),
                lines,
            })
        } else {
            Err(ConsoleError::UploadUnconfirmed {
                target: self.target.clone(),
            })
        }
    }

    fn finish(&self, result: &Result<UploadReport>) {
        match result {
            Ok(_) => self.goto(UploadState::Done),
            Err(e) => {
                warn!(file = %self.target, error = %e, "Upload failed");
                self.goto(UploadState::Failed);
            }
        }
    }

    fn goto(&self, to: UploadState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return;
        }
        self.ctx.emit(ConsoleEvent::SessionState {
            kind: SessionKind::Upload,
            target: Some(self.target.clone()),
            from: state.to_string(),
            to: to.to_string(),
        });
        *state = to;
    }
}
