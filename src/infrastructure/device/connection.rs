//! Connection Manager
//!
//! Owns the pairing handshake, the single current link and the connection
//! state. State changes are published on a watch channel and as
//! [`DeviceEvent`]s.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake ok──► Connected
//!      ▲                          │                            │
//!      └──── handshake failed ────┘                            │
//!      └──────── platform drop / disconnect() / fatal write ───┘
//! ```

use super::protocol::{self, CELL_CHAR_UUID, DEVICE_NAME, SERVICE_UUID};
use super::transport::{DisconnectNotifier, Link, LinkDropped, Transport};
use crate::domain::models::{ConnectionState, DeviceEvent, MessageSeverity, StatusMessage};
use crate::error::ConnectError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

struct Session<T: Transport> {
    device: T::Device,
    link: T::Link,
    generation: u64,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    state: ConnectionState,
    session: Option<Session<T>>,
    generation: u64,
    drops: mpsc::UnboundedSender<LinkDropped>,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        drops: mpsc::UnboundedSender<LinkDropped>,
        state_tx: watch::Sender<ConnectionState>,
        event_sender: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            session: None,
            generation: 0,
            drops,
            state_tx,
            event_sender,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected and the platform still reports the device attached.
    /// Re-check before every write: detach is asynchronous.
    pub fn is_link_valid(&self) -> bool {
        self.state == ConnectionState::Connected
            && self
                .session
                .as_ref()
                .is_some_and(|session| session.link.is_attached())
    }

    /// The current link, only while it is valid.
    pub fn link(&self) -> Option<&T::Link> {
        if !self.is_link_valid() {
            return None;
        }
        self.session.as_ref().map(|session| &session.link)
    }

    /// Run the handshake. Any existing session is torn down first so two
    /// handshakes never overlap.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.state != ConnectionState::Disconnected {
            info!(state = %self.state, "Tearing down existing link before reconnecting");
            self.teardown().await;
        }

        self.set_state(ConnectionState::Connecting);
        self.generation += 1;
        info!(generation = self.generation, "Connecting to '{}'", DEVICE_NAME);
        self.send_log("Searching for braille device...", MessageSeverity::Info);

        match self.handshake().await {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(ConnectionState::Connected);
                self.send_log("Braille device connected", MessageSeverity::Success);
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.send_log(&format!("Could not connect: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<Session<T>, ConnectError> {
        // Step 1: discovery by advertised name
        let device = self
            .transport
            .discover(DEVICE_NAME)
            .await
            .map_err(|e| ConnectError::DiscoveryFailed {
                name: DEVICE_NAME.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Device discovered");

        // Step 2: transport connect
        if let Err(e) = self.transport.connect_transport(&device).await {
            self.transport.close(device).await;
            return Err(ConnectError::TransportConnectFailed(e.to_string()));
        }
        debug!("Transport connected");

        // Subscribe before anything else can go wrong so an early drop is
        // never missed.
        let notifier = DisconnectNotifier::new(self.generation, self.drops.clone());
        if let Err(e) = self.transport.subscribe_disconnect(&device, notifier) {
            self.transport.close(device).await;
            return Err(ConnectError::SubscribeFailed(e.to_string()));
        }

        // Step 3: service lookup
        let service = match self.transport.get_service(&device, SERVICE_UUID).await {
            Ok(service) => service,
            Err(e) => {
                self.transport.close(device).await;
                return Err(ConnectError::ServiceNotFound(format!(
                    "{}: {}",
                    protocol::format_uuid(SERVICE_UUID),
                    e
                )));
            }
        };
        debug!("Found braille service");

        // Step 4: characteristic lookup
        let link = match self
            .transport
            .get_characteristic(&service, CELL_CHAR_UUID)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.transport.close(device).await;
                return Err(ConnectError::CharacteristicNotFound(format!(
                    "{}: {}",
                    protocol::format_uuid(CELL_CHAR_UUID),
                    e
                )));
            }
        };
        info!("Found cell characteristic, handshake complete");

        Ok(Session {
            device,
            link,
            generation: self.generation,
        })
    }

    /// Drop the link and publish `Disconnected` without waiting on the
    /// platform. Returns the device still to be released with
    /// [`release`](Self::release).
    pub fn invalidate(&mut self) -> Option<T::Device> {
        let session = self.session.take();
        self.set_state(ConnectionState::Disconnected);
        session.map(|session| session.device)
    }

    pub async fn release(&mut self, device: T::Device) {
        self.transport.close(device).await;
        debug!("Device released");
    }

    /// Idempotent. Returns whether a live link was torn down.
    pub async fn teardown(&mut self) -> bool {
        match self.invalidate() {
            Some(device) => {
                self.release(device).await;
                info!("Disconnected from device");
                true
            }
            None => false,
        }
    }

    /// Whether a platform drop notification refers to the current session.
    /// Notifications from earlier sessions are stale.
    pub fn is_current(&self, dropped: LinkDropped) -> bool {
        match &self.session {
            Some(session) if session.generation == dropped.generation => true,
            _ => {
                debug!(
                    generation = dropped.generation,
                    current = self.generation,
                    "Ignoring stale disconnect notification"
                );
                false
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Connection state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.event_sender.send(DeviceEvent::StateChanged(state));
    }

    pub(crate) fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(DeviceEvent::Status(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
