//! Transport layer module.

pub mod mock;
pub mod stream;
pub mod traits;

pub use mock::MockTransport;
pub use stream::StreamTransport;
pub use traits::{PrinterTransport, TransportError};
