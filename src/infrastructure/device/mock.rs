//! Scripted in-memory transport for tests.

use super::transport::{DisconnectNotifier, Link, Transport, TransportError, WriteError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Handshake step a [`MockTransport`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discover,
    Connect,
    Subscribe,
    Service,
    Characteristic,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub written: Vec<u8>,
    pub script: VecDeque<Result<(), WriteError>>,
    pub write_calls: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub attached: bool,
    pub notifier: Option<DisconnectNotifier>,
    pub fail_step: Option<Step>,
    pub connects: usize,
    pub closes: usize,
    pub service_id: Option<u128>,
    pub characteristic_id: Option<u128>,
}

/// Shared view of the mock, kept by the test after the transport moves
/// into the worker.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Queue outcomes for the next writes; unscripted writes succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), WriteError>>) {
        self.state().script.extend(outcomes);
    }

    pub fn fail_at(&self, step: Step) {
        self.state().fail_step = Some(step);
    }

    pub fn notifier(&self) -> Option<DisconnectNotifier> {
        self.state().notifier.clone()
    }

    /// Simulate the platform losing the device and firing its event.
    pub fn drop_link(&self) {
        let notifier = {
            let mut state = self.state();
            state.attached = false;
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Detach silently, without a platform event.
    pub fn detach_silently(&self) {
        self.state().attached = false;
    }
}

pub struct MockTransport {
    handle: MockHandle,
    write_latency: Duration,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(write_latency: Duration) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
                write_latency,
            },
            handle,
        )
    }

    fn check(&self, step: Step) -> Result<(), TransportError> {
        if self.handle.state().fail_step == Some(step) {
            return Err(TransportError::new(format!("mock failure at {:?}", step)));
        }
        Ok(())
    }
}

pub struct MockDevice;

pub struct MockService;

pub struct MockLink {
    handle: MockHandle,
    latency: Duration,
}

#[async_trait]
impl Link for MockLink {
    fn is_attached(&self) -> bool {
        self.handle.state().attached
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        {
            let mut state = self.handle.state();
            state.write_calls += 1;
            if !state.attached {
                return Err(WriteError::Detached);
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.handle.state();
        state.in_flight -= 1;
        let outcome = state.script.pop_front().unwrap_or(Ok(()));
        match &outcome {
            Ok(()) => state.written.extend_from_slice(bytes),
            Err(e) if e.is_connection_fatal() => state.attached = false,
            Err(_) => {}
        }
        outcome
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Device = MockDevice;
    type Service = MockService;
    type Link = MockLink;

    async fn discover(&mut self, _name_filter: &str) -> Result<MockDevice, TransportError> {
        self.check(Step::Discover)?;
        Ok(MockDevice)
    }

    async fn connect_transport(&mut self, _device: &MockDevice) -> Result<(), TransportError> {
        self.check(Step::Connect)?;
        let mut state = self.handle.state();
        state.connects += 1;
        state.attached = true;
        Ok(())
    }

    fn subscribe_disconnect(
        &mut self,
        _device: &MockDevice,
        notifier: DisconnectNotifier,
    ) -> Result<(), TransportError> {
        self.check(Step::Subscribe)?;
        self.handle.state().notifier = Some(notifier);
        Ok(())
    }

    async fn get_service(
        &mut self,
        _device: &MockDevice,
        id: u128,
    ) -> Result<MockService, TransportError> {
        self.check(Step::Service)?;
        self.handle.state().service_id = Some(id);
        Ok(MockService)
    }

    async fn get_characteristic(
        &mut self,
        _service: &MockService,
        id: u128,
    ) -> Result<MockLink, TransportError> {
        self.check(Step::Characteristic)?;
        self.handle.state().characteristic_id = Some(id);
        Ok(MockLink {
            handle: self.handle.clone(),
            latency: self.write_latency,
        })
    }

    async fn close(&mut self, _device: MockDevice) {
        let mut state = self.handle.state();
        state.closes += 1;
        state.attached = false;
        state.notifier = None;
    }
}

/// A link that is connected from the start, for driving the dispatcher
/// without a connection manager.
pub fn attached_link(latency: Duration) -> (MockLink, MockHandle) {
    let handle = MockHandle::default();
    handle.state().attached = true;
    (
        MockLink {
            handle: handle.clone(),
            latency,
        },
        handle,
    )
}
