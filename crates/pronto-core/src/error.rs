//! Error types for console operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::progress::PrintMode;
use crate::transport::TransportError;

/// Operator-level operation, used to name failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Listing,
    Upload,
    CardPrint,
    HostPrint,
    Pause,
    Resume,
    Temperature,
    Move,
    Command,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Listing => write!(f, "card listing"),
            Operation::Upload => write!(f, "upload"),
            Operation::CardPrint => write!(f, "card print"),
            Operation::HostPrint => write!(f, "print"),
            Operation::Pause => write!(f, "pause"),
            Operation::Resume => write!(f, "resume"),
            Operation::Temperature => write!(f, "temperature query"),
            Operation::Move => write!(f, "move"),
            Operation::Command => write!(f, "command"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("{operation} failed: printer is not connected")]
    NotConnected { operation: Operation },

    #[error("local file not found: {}", path.display())]
    LocalFileNotFound { path: PathBuf },

    #[error("card print failed: '{target}' is not on the card, upload it first")]
    FileNotOnCard { target: String },

    #[error("{operation} failed: printer could not open '{target}' on the card")]
    CardOpenFailed { operation: Operation, target: String },

    #[error(
        "upload interrupted after {sent}/{total} lines: a partial file named '{target}' may have been written to the card"
    )]
    UploadInterrupted {
        target: String,
        sent: usize,
        total: usize,
    },

    #[error("upload finished but '{target}' is missing from the card listing")]
    UploadUnconfirmed { target: String },

    #[error("malformed progress line: {line:?}")]
    MalformedProgressLine { line: String },

    #[error("cannot {operation} while {mode}")]
    InvalidStateTransition { operation: Operation, mode: PrintMode },

    #[error("{operation} of '{target}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: Operation,
        target: String,
        timeout_ms: u64,
    },

    #[error("{operation} session ended without a result")]
    SessionAbandoned { operation: Operation },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
