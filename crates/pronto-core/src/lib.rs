//! Pronto-Core: console sessions for RepRap-style 3D printers.
//!
//! The printer speaks a line protocol: the host writes G-code commands and
//! the firmware answers with free-form lines. This crate turns that stream
//! into operator-level operations: card listings, uploads, card prints,
//! host-streamed prints with pause/resume, and temperature queries.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: G-code commands and the firmware's reply markers
//! - **Transport**: the serial link abstraction (line stream, mock)
//! - **Bus**: fan-out of inbound lines to registered listeners
//! - **Session**: listing, upload and card print protocol runs
//! - **Progress**: print mode and progress for host and card prints
//! - **Events**: observer pattern for UI decoupling
//! - **Console**: the facade tying a link to the operations above
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pronto_core::{ConsoleConfig, PrinterConsole, TracingObserver};
//!
//! let config = ConsoleConfig {
//!     port: Some("/dev/ttyUSB0".to_string()),
//!     ..Default::default()
//! };
//!
//! let console = PrinterConsole::open(config, Arc::new(TracingObserver)).expect("open failed");
//! for name in console.list_files().expect("listing failed") {
//!     println!("{}", name);
//! }
//! ```

pub mod bus;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod gcode;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use bus::{Disposition, LineBus, LineListener, ListenerId};
pub use config::{ConsoleConfig, Heater};
pub use console::PrinterConsole;
pub use error::{ConsoleError, Operation, Result};
pub use events::{ConsoleEvent, ConsoleObserver, NullObserver, TracingObserver};
pub use progress::{
    PrintController, PrintMode, PrintOrigin, PrintProgress, ProgressSnapshot, SharedProgress,
};
pub use protocol::Axis;
pub use session::{
    CardListing, CardPrintHandle, CardPrintReport, CardPrintState, SessionHandle, SessionKind,
    UploadHandle, UploadReport, UploadState,
};
pub use transport::{MockTransport, PrinterTransport, StreamTransport, TransportError};
