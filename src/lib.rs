//! Device communication core of the braille tutor.
//!
//! Turns braille requests into a serialized stream of one-byte commands for
//! a tactile display over Bluetooth LE:
//!
//! - [`domain::braille`] encodes symbols to dot patterns and wire bytes.
//! - [`infrastructure::device`] manages the connection and the write queue.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::braille::DotPattern;
pub use domain::models::ConnectionState;
pub use error::{ConnectError, SendError};
pub use infrastructure::device::DeviceService;
