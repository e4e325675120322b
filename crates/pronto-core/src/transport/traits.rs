//! Printer transport abstraction.
//!
//! The transport owns the serial link: writing commands, queueing the
//! lines of a host-streamed print, and feeding every inbound line into a
//! [`LineBus`](crate::bus::LineBus). Sessions only talk to it through
//! [`PrinterTransport`], so tests can swap in a mock.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Printer not connected")]
    NotConnected,

    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Printer disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract printer transport interface.
pub trait PrinterTransport: Send + Sync {
    /// Whether the printer has answered and accepts commands.
    fn is_connected(&self) -> bool;

    /// Send one command ahead of any queued print lines.
    fn send_now(&self, command: &str) -> Result<(), TransportError>;

    /// Replace the print queue with `lines` and start streaming them.
    fn start_print(&self, lines: Vec<String>) -> Result<(), TransportError>;

    /// Stop consuming the print queue, keeping the cursor.
    fn pause(&self);

    /// Continue consuming the print queue from the cursor.
    fn resume(&self);

    /// Halt streaming and discard what is left of the queue.
    fn stop_print(&self);

    /// Whether queued lines are still being streamed.
    fn is_printing(&self) -> bool;

    /// Number of queued lines already sent.
    fn queue_cursor(&self) -> usize;

    /// Number of lines in the current queue.
    fn queue_length(&self) -> usize;

    /// Close the link.
    fn disconnect(&self);
}
