//! Platform Transport Boundary
//!
//! The core talks to the wireless stack only through these traits. A
//! [`Transport`] performs the handshake steps; the [`Link`] it yields is the
//! single writable characteristic of the connected device.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A handshake step failed at the platform level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of a single characteristic write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("device detached")]
    Detached,
    #[error("characteristic handle is no longer valid")]
    InvalidHandle,
    #[error("write timed out")]
    TimedOut,
    #[error("{0}")]
    Failed(String),
}

impl WriteError {
    /// Fatal errors mean the link itself is gone; the rest of the queue is
    /// doomed. Anything else only fails the current write.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Detached | Self::InvalidHandle)
    }
}

/// Platform notification that the link of session `generation` dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkDropped {
    pub generation: u64,
}

/// Handed to the transport at subscribe time; the platform callback fires
/// it when the device detaches. Safe to call from any thread.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    generation: u64,
    sender: mpsc::UnboundedSender<LinkDropped>,
}

impl DisconnectNotifier {
    pub(crate) fn new(generation: u64, sender: mpsc::UnboundedSender<LinkDropped>) -> Self {
        Self { generation, sender }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self) {
        // The worker may already be gone during shutdown.
        let _ = self.sender.send(LinkDropped {
            generation: self.generation,
        });
    }
}

/// Writable characteristic of one connected device.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Whether the platform still reports the device as attached.
    fn is_attached(&self) -> bool;

    async fn write(&self, bytes: &[u8]) -> Result<(), WriteError>;
}

/// Discovery and GATT handshake over the platform's Bluetooth stack.
#[async_trait]
pub trait Transport: Send + 'static {
    type Device: Send + Sync + 'static;
    type Service: Send + Sync + 'static;
    type Link: Link;

    /// Find a device advertising `name_filter`.
    async fn discover(&mut self, name_filter: &str) -> Result<Self::Device, TransportError>;

    /// Establish the transport-level connection.
    async fn connect_transport(&mut self, device: &Self::Device) -> Result<(), TransportError>;

    /// Register for asynchronous disconnect notifications.
    fn subscribe_disconnect(
        &mut self,
        device: &Self::Device,
        notifier: DisconnectNotifier,
    ) -> Result<(), TransportError>;

    async fn get_service(
        &mut self,
        device: &Self::Device,
        id: u128,
    ) -> Result<Self::Service, TransportError>;

    async fn get_characteristic(
        &mut self,
        service: &Self::Service,
        id: u128,
    ) -> Result<Self::Link, TransportError>;

    /// Drop the subscription and release the device. Must tolerate a device
    /// that already detached.
    async fn close(&mut self, device: Self::Device);
}
