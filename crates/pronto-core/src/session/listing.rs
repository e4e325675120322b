//! Card directory listing (M20).

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use super::{Completion, SessionContext, SessionHandle, SessionKind};
use crate::bus::{Disposition, LineListener};
use crate::error::{Operation, Result};
use crate::events::ConsoleEvent;
use crate::protocol::{self, markers};

/// Lowercased file names reported by one listing.
pub type CardListing = HashSet<String>;

/// Listing session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingState {
    /// Waiting for "Begin file list".
    Idle,
    /// Between the begin and end markers.
    Collecting,
    Done,
}

impl fmt::Display for ListingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingState::Idle => write!(f, "idle"),
            ListingState::Collecting => write!(f, "collecting"),
            ListingState::Done => write!(f, "done"),
        }
    }
}

struct Inner {
    state: ListingState,
    files: CardListing,
}

/// Listener collecting entries between the listing markers.
pub struct ListingListener {
    inner: Mutex<Inner>,
    completion: Completion<CardListing>,
    ctx: SessionContext,
}

impl ListingListener {
    fn new(ctx: SessionContext, completion: Completion<CardListing>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ListingState::Idle,
                files: CardListing::new(),
            }),
            completion,
            ctx,
        }
    }

    pub fn state(&self) -> ListingState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn goto(&self, inner: &mut Inner, to: ListingState) {
        debug!(from = %inner.state, to = %to, "Listing state");
        self.ctx.emit(ConsoleEvent::SessionState {
            kind: SessionKind::Listing,
            target: None,
            from: inner.state.to_string(),
            to: to.to_string(),
        });
        inner.state = to;
    }
}

impl LineListener for ListingListener {
    fn on_line(&self, line: &str) -> anyhow::Result<Disposition> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            ListingState::Done => return Ok(Disposition::Done),
            ListingState::Idle => {
                if line.contains(markers::BEGIN_FILE_LIST) {
                    inner.files.clear();
                    self.goto(&mut inner, ListingState::Collecting);
                }
            }
            ListingState::Collecting => {
                if line.contains(markers::END_FILE_LIST) {
                    self.goto(&mut inner, ListingState::Done);
                    let files = std::mem::take(&mut inner.files);
                    info!(count = files.len(), "Card listing complete");
                    self.completion.complete(Ok(files));
                    return Ok(Disposition::Done);
                }
                if let Some(name) = markers::normalize_file_entry(line) {
                    inner.files.insert(name);
                }
            }
        }
        Ok(Disposition::Keep)
    }

    fn name(&self) -> &str {
        "listing"
    }
}

/// Register a listing listener and send M20.
#[instrument(skip(ctx))]
pub fn start_listing(ctx: &SessionContext) -> Result<SessionHandle<CardListing>> {
    ctx.require_connection(Operation::Listing)?;

    let (completion, rx) = Completion::new();
    let listener = Arc::new(ListingListener::new(ctx.clone(), completion));
    let id = ctx.bus.register(listener);
    let handle = SessionHandle::new(Operation::Listing, "card", rx, ctx.bus.clone(), vec![id]);

    if let Err(e) = ctx.transport.send_now(protocol::LIST_CARD) {
        handle.abandon();
        return Err(e.into());
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LineBus;
    use crate::events::testing::RecordingObserver;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn context() -> (Arc<MockTransport>, Arc<RecordingObserver>, SessionContext) {
        let mock = Arc::new(MockTransport::new());
        let observer = Arc::new(RecordingObserver::default());
        let ctx = SessionContext {
            bus: Arc::new(LineBus::new()),
            transport: mock.clone(),
            observer: observer.clone(),
        };
        mock.attach(&ctx.bus);
        (mock, observer, ctx)
    }

    fn done_transitions(observer: &RecordingObserver) -> usize {
        observer
            .events()
            .iter()
            .filter(|e| matches!(e, ConsoleEvent::SessionState { to, .. } if to == "done"))
            .count()
    }

    #[test]
    fn test_listing_collects_between_markers() {
        let (mock, observer, ctx) = context();
        let handle = start_listing(&ctx).unwrap();
        assert_eq!(mock.get_commands(), vec!["M20"]);

        for line in ["Begin file list", "a.g", "b.g", "End file list"] {
            ctx.bus.dispatch(line);
        }
        let files = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(files, CardListing::from(["a.g".to_string(), "b.g".to_string()]));
        assert_eq!(done_transitions(&observer), 1);
        assert!(ctx.bus.is_empty());

        ctx.bus.dispatch("End file list");
        assert_eq!(done_transitions(&observer), 1);
    }

    #[test]
    fn test_listing_discards_lines_outside_window() {
        let (_mock, _observer, ctx) = context();
        let handle = start_listing(&ctx).unwrap();
        for line in ["stray.g", "Begin file list", "PART.G\r", "ok", "End file list"] {
            ctx.bus.dispatch(line);
        }
        let files = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(files, CardListing::from(["part.g".to_string()]));
    }

    #[test]
    fn test_listing_without_end_marker_times_out() {
        let (_mock, _observer, ctx) = context();
        let handle = start_listing(&ctx).unwrap();
        ctx.bus.dispatch("Begin file list");
        ctx.bus.dispatch("a.g");
        assert!(handle.wait(Duration::from_millis(20)).is_err());
        assert!(ctx.bus.is_empty());
    }

    #[test]
    fn test_listing_requires_connection() {
        let (mock, _observer, ctx) = context();
        mock.set_connected(false);
        assert!(start_listing(&ctx).is_err());
        assert!(ctx.bus.is_empty());
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn test_listing_with_scripted_reply() {
        let (mock, _observer, ctx) = context();
        mock.reply_to("M20", &["Begin file list", "CUBE.G 1024", "End file list"]);
        let files = start_listing(&ctx)
            .unwrap()
            .wait(Duration::from_millis(100))
            .unwrap();
        assert!(files.contains("cube.g"));
    }
}
