//! Card-resident print (M23 + M24).
//!
//! The listener stays on the bus for the whole print, which can run for
//! hours next to temperature polling and other listeners.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{Completion, SessionContext, SessionHandle, SessionKind, start_listing};
use crate::bus::{Disposition, LineListener};
use crate::error::{ConsoleError, Operation, Result};
use crate::events::ConsoleEvent;
use crate::progress::{PrintOrigin, SharedProgress};
use crate::protocol::{self, markers};
use crate::transport::TransportError;

/// Card print session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPrintState {
    /// M23 sent.
    Requested,
    Opened,
    Selected,
    /// M24 sent.
    Printing,
    Done,
    Failed,
}

impl CardPrintState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CardPrintState::Done | CardPrintState::Failed)
    }
}

impl fmt::Display for CardPrintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardPrintState::Requested => write!(f, "requested"),
            CardPrintState::Opened => write!(f, "opened"),
            CardPrintState::Selected => write!(f, "selected"),
            CardPrintState::Printing => write!(f, "printing"),
            CardPrintState::Done => write!(f, "done"),
            CardPrintState::Failed => write!(f, "failed"),
        }
    }
}

/// Finished card print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPrintReport {
    pub target: String,
    /// The firmware's "Done printing file" line.
    pub message: String,
}

/// Listener driving one card print.
pub struct CardPrintListener {
    target: String,
    state: Mutex<CardPrintState>,
    progress: SharedProgress,
    started: Completion<()>,
    finished: Completion<CardPrintReport>,
    ctx: SessionContext,
}

impl CardPrintListener {
    pub fn state(&self) -> CardPrintState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn goto(&self, state: &mut CardPrintState, to: CardPrintState) {
        debug!(file = %self.target, from = %state, to = %to, "Card print state");
        self.ctx.emit(ConsoleEvent::SessionState {
            kind: SessionKind::CardPrint,
            target: Some(self.target.clone()),
            from: state.to_string(),
            to: to.to_string(),
        });
        *state = to;
    }

    /// Enter `Failed` and resolve both milestones with `error()`.
    fn fail(&self, state: &mut CardPrintState, error: impl Fn() -> ConsoleError) {
        self.goto(state, CardPrintState::Failed);
        let first = error();
        warn!(file = %self.target, error = %first, "Card print failed");
        self.ctx.emit(ConsoleEvent::PrinterMessage {
            line: first.to_string(),
        });
        self.started.complete(Err(first));
        self.finished.complete(Err(error()));
    }
}

impl LineListener for CardPrintListener {
    fn on_line(&self, line: &str) -> anyhow::Result<Disposition> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return Ok(Disposition::Done);
        }

        if line.contains(markers::OPEN_FAILED) {
            self.fail(&mut state, || ConsoleError::CardOpenFailed {
                operation: Operation::CardPrint,
                target: self.target.clone(),
            });
            return Ok(Disposition::Done);
        }

        if line.contains(markers::FILE_OPENED) {
            self.goto(&mut state, CardPrintState::Opened);
            self.ctx.emit(ConsoleEvent::PrinterMessage {
                line: line.to_string(),
            });
        } else if line.contains(markers::FILE_SELECTED) {
            self.goto(&mut state, CardPrintState::Selected);
            // Mark the print as running before M24 goes out so that early
            // progress lines land on a card print.
            self.progress.lock().start(PrintOrigin::Card);
            // The transport may answer M24 on this thread.
            drop(state);
            let sent = self.ctx.transport.send_now(protocol::START_CARD_PRINT);

            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = sent {
                self.progress.lock().finish();
                let message = e.to_string();
                self.fail(&mut state, || {
                    ConsoleError::Transport(TransportError::WriteFailed(message.clone()))
                });
                return Ok(Disposition::Done);
            }
            if *state == CardPrintState::Selected {
                self.goto(&mut state, CardPrintState::Printing);
            }
            info!(file = %self.target, "Card print started");
            self.started.complete(Ok(()));
            if state.is_terminal() {
                return Ok(Disposition::Done);
            }
        } else if line.contains(markers::DONE_PRINTING) {
            self.goto(&mut state, CardPrintState::Done);
            self.progress.lock().finish();
            info!(file = %self.target, "Card print finished");
            self.ctx.emit(ConsoleEvent::PrinterMessage {
                line: line.to_string(),
            });
            self.finished.complete(Ok(CardPrintReport {
                target: self.target.clone(),
                message: line.to_string(),
            }));
            return Ok(Disposition::Done);
        } else if line.contains(markers::CARD_PROGRESS) {
            match self.progress.lock().record_card_sample(line) {
                Ok(pct) => {
                    self.ctx.emit(ConsoleEvent::Progress {
                        operation: Operation::CardPrint,
                        current: (pct * 10.0) as u64,
                        total: 1000,
                    });
                }
                Err(e) => debug!(error = %e, "Ignoring progress line"),
            }
        }
        Ok(Disposition::Keep)
    }

    fn name(&self) -> &str {
        "card print"
    }
}

/// Handles for the two milestones of a card print.
pub struct CardPrintHandle {
    /// Resolves once M24 has been sent, or on failure.
    pub started: SessionHandle<()>,
    /// Resolves when the firmware reports the print done, or on failure.
    pub finished: SessionHandle<CardPrintReport>,
    listener: Arc<CardPrintListener>,
}

impl CardPrintHandle {
    pub fn target(&self) -> &str {
        self.finished.target()
    }

    pub fn state(&self) -> CardPrintState {
        self.listener.state()
    }
}

/// List the card, check `target` is on it, then select it with M23.
///
/// Fails with [`ConsoleError::FileNotOnCard`] before anything besides the
/// listing is sent if the name is missing.
#[instrument(skip_all, fields(file = %target))]
pub fn start_card_print(
    ctx: &SessionContext,
    progress: &SharedProgress,
    target: &str,
    listing_timeout: Duration,
) -> Result<CardPrintHandle> {
    ctx.require_connection(Operation::CardPrint)?;
    let target = target.trim().to_lowercase();

    let files = start_listing(ctx)?.wait(listing_timeout)?;
    if !files.contains(&target) {
        return Err(ConsoleError::FileNotOnCard { target });
    }

    let (started, started_rx) = Completion::new();
    let (finished, finished_rx) = Completion::new();
    let listener = Arc::new(CardPrintListener {
        target: target.clone(),
        state: Mutex::new(CardPrintState::Requested),
        progress: progress.clone(),
        started,
        finished,
        ctx: ctx.clone(),
    });
    let id = ctx.bus.register(listener.clone());

    let handle = CardPrintHandle {
        started: SessionHandle::new(
            Operation::CardPrint,
            target.clone(),
            started_rx,
            ctx.bus.clone(),
            vec![id],
        ),
        finished: SessionHandle::new(
            Operation::CardPrint,
            target.clone(),
            finished_rx,
            ctx.bus.clone(),
            vec![id],
        ),
        listener,
    };

    info!(file = %target, "Requesting card print");
    if let Err(e) = ctx.transport.send_now(&protocol::select_card_file(&target)) {
        handle.finished.abandon();
        return Err(e.into());
    }
    Ok(handle)
}
