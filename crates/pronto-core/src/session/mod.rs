//! Transfer sessions - multi-step protocol runs built on the line bus.
//!
//! Each session registers one or more listeners, sends its opening
//! command, and resolves exactly once through a completion channel.
//! Callers wait on a [`SessionHandle`] with their own timeout.

pub mod card_print;
pub mod listing;
pub mod upload;

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::bus::{LineBus, ListenerId};
use crate::error::{ConsoleError, Operation, Result};
use crate::events::{ConsoleEvent, ConsoleObserver};
use crate::transport::PrinterTransport;

pub use card_print::{CardPrintHandle, CardPrintReport, CardPrintState, start_card_print};
pub use listing::{CardListing, ListingState, start_listing};
pub use upload::{UploadHandle, UploadReport, UploadState, start_upload};

/// Session kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Listing,
    Upload,
    CardPrint,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Listing => write!(f, "listing"),
            SessionKind::Upload => write!(f, "upload"),
            SessionKind::CardPrint => write!(f, "card print"),
        }
    }
}

/// Everything a session needs from the console.
#[derive(Clone)]
pub struct SessionContext {
    pub bus: Arc<LineBus>,
    pub transport: Arc<dyn PrinterTransport>,
    pub observer: Arc<dyn ConsoleObserver>,
}

impl SessionContext {
    pub(crate) fn emit(&self, event: ConsoleEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn require_connection(&self, operation: Operation) -> Result<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(ConsoleError::NotConnected { operation })
        }
    }
}

/// Single-shot result sender. The first result wins.
pub struct Completion<T> {
    sender: Mutex<Option<Sender<Result<T>>>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, Receiver<Result<T>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `result`. Returns `false` if a result was already sent.
    pub fn complete(&self, result: Result<T>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone; the result is still final.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

/// Awaitable outcome of a line-driven session.
pub struct SessionHandle<T> {
    operation: Operation,
    target: String,
    receiver: Receiver<Result<T>>,
    bus: Arc<LineBus>,
    listeners: Vec<ListenerId>,
}

impl<T> SessionHandle<T> {
    pub(crate) fn new(
        operation: Operation,
        target: impl Into<String>,
        receiver: Receiver<Result<T>>,
        bus: Arc<LineBus>,
        listeners: Vec<ListenerId>,
    ) -> Self {
        Self {
            operation,
            target: target.into(),
            receiver,
            bus,
            listeners,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Block until the session resolves or `timeout` passes.
    ///
    /// On timeout the session's listeners are removed, so a session whose
    /// terminal line never arrives cannot linger on the bus.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(operation = %self.operation, file = %self.target, "Session timed out");
                self.abandon();
                Err(ConsoleError::Timeout {
                    operation: self.operation,
                    target: self.target.clone(),
                    timeout_ms: millis(timeout),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ConsoleError::SessionAbandoned {
                operation: self.operation,
            }),
        }
    }

    /// Non-blocking check for a result.
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ConsoleError::SessionAbandoned {
                operation: self.operation,
            })),
        }
    }

    /// Remove the session's listeners without waiting for a result.
    pub fn abandon(&self) {
        for id in &self.listeners {
            self.bus.deregister(*id);
        }
    }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_completion_fires_once() {
        let (completion, rx) = Completion::<u32>::new();
        assert!(completion.complete(Ok(1)));
        assert!(!completion.complete(Ok(2)));
        assert!(completion.is_complete());
        assert_eq!(rx.recv().unwrap().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wait_timeout_deregisters() {
        let bus = Arc::new(LineBus::new());
        let id = bus.register(Arc::new(|_: &str| -> anyhow::Result<crate::bus::Disposition> {
            Ok(crate::bus::Disposition::Keep)
        }));
        let (_completion, rx) = Completion::<()>::new();
        let handle = SessionHandle::new(Operation::Listing, "card", rx, bus.clone(), vec![id]);

        let err = handle.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            ConsoleError::Timeout {
                operation: Operation::Listing,
                ..
            }
        ));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_dropped_completion_is_abandoned() {
        let bus = Arc::new(LineBus::new());
        let (completion, rx) = Completion::<()>::new();
        let handle = SessionHandle::new(Operation::CardPrint, "a.g", rx, bus, Vec::new());
        drop(completion);
        assert!(matches!(
            handle.try_result(),
            Some(Err(ConsoleError::SessionAbandoned { .. }))
        ));
    }
}
