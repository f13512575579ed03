//! Device Module
//!
//! Reliable single-byte command stream to the tactile braille display.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceService                        │
//! │   (cloneable handle - connect / disconnect / send)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ commands (mpsc)
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   device worker task                     │
//! │  ┌───────────────────┐        ┌───────────────────────┐  │
//! │  │ ConnectionManager │◄───────│      Dispatcher       │  │
//! │  │ - handshake       │ link?  │ - FIFO of jobs        │  │
//! │  │ - state + link    │        │ - one write in flight │  │
//! │  └─────────▲─────────┘        └───────────┬───────────┘  │
//! └────────────┼──────────────────────────────┼──────────────┘
//!              │ link dropped (mpsc)          │ one byte
//!        ┌─────┴──────────────────────────────▼─────┐
//!        │        Transport / Link (platform)        │
//!        └───────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device name, GATT identifiers, settle delay
//! - [`transport`] - Platform traits and write-error classification
//! - [`connection`] - Handshake and connection state
//! - [`dispatcher`] - Serialized write queue
//! - [`service`] - Worker task and public handle

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod service;
pub mod transport;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod mock;

pub use service::DeviceService;
pub use transport::{Link, Transport};
