//! Device Service
//!
//! Public entry point of the core. [`DeviceService`] is a cheap, cloneable
//! handle; all state lives in one worker task that owns the connection
//! manager and the write queue, so a disconnect notification and a write
//! can never race.

use super::connection::ConnectionManager;
use super::dispatcher::{Dispatcher, DrainOutcome, Job};
use super::protocol::SETTLE_DELAY;
use super::transport::{LinkDropped, Transport};
use crate::domain::braille::{self, DotPattern};
use crate::domain::models::{ConnectionState, DeviceEvent, MessageSeverity};
use crate::error::{ConnectError, SendError};
use std::future::Future;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectError>>),
    Disconnect(oneshot::Sender<()>),
    Send(Job),
}

/// Handle to the device worker.
#[derive(Clone)]
pub struct DeviceService {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl DeviceService {
    /// Start the worker on the current tokio runtime. The receiver yields
    /// state changes and status lines for display.
    pub fn spawn<T: Transport>(transport: T) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = DeviceWorker {
            manager: ConnectionManager::new(transport, drops_tx, state_tx, event_tx),
            dispatcher: Dispatcher::new(SETTLE_DELAY),
            commands: command_rx,
            drops: drops_rx,
            closed_with: None,
        };
        tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    /// Pair with the device. Failures are returned as-is and never retried.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply))
            .map_err(|_| ConnectError::WorkerStopped)?;
        response.await.map_err(|_| ConnectError::WorkerStopped)?
    }

    /// Tear down the link and fail every pending job. Safe to call at any
    /// time, any number of times.
    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Disconnect(reply)).is_ok() {
            let _ = response.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue `pattern` for the device. The job is submitted before this
    /// returns; the returned future only waits for its completion, so
    /// submission order is call order.
    pub fn enqueue(
        &self,
        pattern: DotPattern,
    ) -> impl Future<Output = Result<(), SendError>> + Send + 'static {
        let submitted = self.submit(pattern);
        async move {
            match submitted {
                Ok(done) => done.await.unwrap_or(Err(SendError::Disconnected)),
                Err(e) => Err(e),
            }
        }
    }

    pub async fn send_pattern(&self, pattern: DotPattern) -> Result<(), SendError> {
        self.enqueue(pattern).await
    }

    /// Look up a character or contraction and send it. Unknown symbols send
    /// the flat cell.
    pub async fn send_symbol(&self, symbol: &str) -> Result<(), SendError> {
        self.enqueue(braille::pattern_for(symbol)).await
    }

    fn submit(
        &self,
        pattern: DotPattern,
    ) -> Result<oneshot::Receiver<Result<(), SendError>>, SendError> {
        if !self.is_connected() {
            debug!(%pattern, "Rejecting send, not connected");
            return Err(SendError::NotConnected);
        }
        let (job, done) = Job::new(pattern);
        self.commands
            .send(Command::Send(job))
            .map_err(|_| SendError::NotConnected)?;
        Ok(done)
    }
}

struct DeviceWorker<T: Transport> {
    manager: ConnectionManager<T>,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    drops: mpsc::UnboundedReceiver<LinkDropped>,
    /// Why the last live link was closed. Sends accepted while it was up
    /// but still in the channel share the fate of the queue they joined.
    closed_with: Option<SendError>,
}

impl<T: Transport> DeviceWorker<T> {
    async fn run(mut self) {
        debug!("Device worker started");
        loop {
            let pending = self.dispatcher.has_pending();
            let write_at = self.dispatcher.next_write_at();

            tokio::select! {
                biased;

                Some(dropped) = self.drops.recv() => self.on_link_dropped(dropped).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(write_at), if pending => self.drain_once().await,
            }
        }

        // Every handle is gone.
        self.dispatcher.abort_all(SendError::ManuallyDisconnected);
        self.manager.teardown().await;
        debug!("Device worker stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                if self.manager.state() != ConnectionState::Disconnected {
                    self.close_link(SendError::ManuallyDisconnected).await;
                }
                self.closed_with = None;
                let _ = reply.send(self.manager.connect().await);
            }
            Command::Disconnect(reply) => {
                if self.close_link(SendError::ManuallyDisconnected).await {
                    self.manager
                        .send_log("Disconnected from device", MessageSeverity::Info);
                }
                let _ = reply.send(());
            }
            Command::Send(job) => {
                if self.manager.is_link_valid() {
                    self.dispatcher.enqueue(job);
                    return;
                }
                if self.manager.state() == ConnectionState::Connected {
                    warn!("Device detached without a disconnect notification");
                    self.close_link(SendError::NotConnected).await;
                }
                let error = self.closed_with.clone().unwrap_or(SendError::NotConnected);
                debug!(pattern = %job.pattern, %error, "Rejecting job, link not valid");
                job.resolve(Err(error));
            }
        }
    }

    async fn on_link_dropped(&mut self, dropped: LinkDropped) {
        if !self.manager.is_current(dropped) {
            return;
        }
        warn!(generation = dropped.generation, "Device reported disconnect");
        self.close_link(SendError::Disconnected).await;
        self.manager
            .send_log("Braille device disconnected", MessageSeverity::Warning);
    }

    async fn drain_once(&mut self) {
        let outcome = self.dispatcher.drain_once(self.manager.link()).await;
        match outcome {
            DrainOutcome::Idle | DrainOutcome::Written | DrainOutcome::WriteFailed => {}
            DrainOutcome::NoLink => {
                warn!("Link no longer valid, aborting queue");
                self.close_link(SendError::NotConnected).await;
            }
            DrainOutcome::ConnectionLost => {
                self.close_link(SendError::Disconnected).await;
                self.manager
                    .send_log("Disconnected during operation", MessageSeverity::Error);
            }
        }
    }

    /// Flip state to `Disconnected`, fail the queue with `error`, then
    /// release the device. State changes before any job resolves so
    /// callers never see a failure while the device still reads connected.
    /// Returns whether a live link was closed.
    async fn close_link(&mut self, error: SendError) -> bool {
        if self.manager.state() != ConnectionState::Disconnected {
            self.closed_with = Some(error.clone());
        }
        let device = self.manager.invalidate();
        let aborted = self.dispatcher.abort_all(error);
        if aborted > 0 {
            info!(aborted, "Pending jobs failed");
        }
        match device {
            Some(device) => {
                self.manager.release(device).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::device::mock::{MockTransport, Step};
    use crate::infrastructure::device::transport::WriteError;
    use std::time::Duration;

    fn dots(list: &[u8]) -> DotPattern {
        DotPattern::new(list).unwrap()
    }

    /// Await every future, recording the order in which they complete.
    async fn completion_order(
        futures: Vec<(char, impl Future<Output = Result<(), SendError>> + Send + 'static)>,
    ) -> Vec<(char, Result<(), SendError>)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (label, future) in futures {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send((label, future.await));
            });
        }
        drop(tx);
        let mut order = Vec::new();
        while let Some(entry) = rx.recv().await {
            order.push(entry);
        }
        order
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_single_cell() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);

        service.connect().await.unwrap();
        assert!(service.is_connected());

        service.send_pattern(dots(&[1, 2, 4])).await.unwrap();
        assert_eq!(mock.written(), vec![0b0000_1011]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_completion_order() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(5));
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let order = completion_order(vec![
            ('A', service.enqueue(dots(&[1]))),
            ('B', service.enqueue(dots(&[2]))),
            ('C', service.enqueue(dots(&[3]))),
        ])
        .await;

        assert_eq!(
            order,
            vec![('A', Ok(())), ('B', Ok(())), ('C', Ok(()))]
        );
        assert_eq!(mock.written(), vec![0b001, 0b010, 0b100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_write_in_flight() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(20));
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        let (a, b) = tokio::join!(a, b);

        assert_eq!((a, b), (Ok(()), Ok(())));
        assert_eq!(mock.state().max_in_flight, 1);
        assert_eq!(mock.state().write_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_spaced_by_settle_delay() {
        let (transport, _mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let start = tokio::time::Instant::now();
        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        let c = service.enqueue(dots(&[3]));
        let _ = tokio::join!(a, b, c);

        assert!(start.elapsed() >= SETTLE_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_fail_when_disconnected() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);

        assert_eq!(
            service.send_pattern(dots(&[1])).await,
            Err(SendError::NotConnected)
        );
        assert_eq!(mock.state().write_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_cascades() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(5));
        mock.script([Ok(()), Err(WriteError::Detached)]);
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        let c = service.enqueue(dots(&[3]));

        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Err(SendError::Disconnected));
        assert_eq!(c.await, Err(SendError::Disconnected));
        assert!(!service.is_connected());
        assert_eq!(mock.state().write_calls, 2);
        assert_eq!(mock.state().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_isolated() {
        let (transport, mock) = MockTransport::new();
        mock.script([Err(WriteError::Failed("gatt busy".into()))]);
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));

        assert_eq!(a.await, Err(SendError::WriteFailed("gatt busy".into())));
        assert_eq!(b.await, Ok(()));
        assert!(service.is_connected());
        assert_eq!(mock.written(), vec![0b010]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);

        service.disconnect().await;
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        service.disconnect().await;
        service.disconnect().await;

        assert_eq!(a.await, Err(SendError::ManuallyDisconnected));
        assert_eq!(b.await, Err(SendError::ManuallyDisconnected));
        assert!(!service.is_connected());
        assert_eq!(mock.state().closes, 1);
        assert!(mock.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_drop_aborts_queue() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(50));
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        let c = service.enqueue(dots(&[3]));
        // Let the first write start, then lose the device mid-write.
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.drop_link();

        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Err(SendError::Disconnected));
        assert_eq!(c.await, Err(SendError::Disconnected));
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert_eq!(mock.state().write_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_sent_mid_write_joins_fatal_cascade() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(50));
        mock.script([Err(WriteError::Detached)]);
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.is_connected());
        let b = service.enqueue(dots(&[2]));

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Err(SendError::Disconnected));
        assert_eq!(b, Err(SendError::Disconnected));
        assert!(!service.is_connected());
        assert_eq!(mock.state().write_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_sent_mid_write_joins_platform_drop() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(50));
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = service.enqueue(dots(&[2]));
        mock.drop_link();

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok(()));
        assert_eq!(b, Err(SendError::Disconnected));
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert_eq!(mock.state().write_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_between_writes_fails_queue() {
        let (transport, mock) = MockTransport::with_latency(Duration::from_millis(50));
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        let b = service.enqueue(dots(&[2]));
        let c = service.enqueue(dots(&[3]));
        // The write in flight completes; the next one finds the link gone.
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.detach_silently();

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a, Ok(()));
        assert_eq!(b, Err(SendError::NotConnected));
        assert_eq!(c, Err(SendError::NotConnected));
        assert!(!service.is_connected());
        assert_eq!(mock.state().write_calls, 1);
        assert_eq!(mock.state().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_detach_rejects_and_disconnects() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();
        mock.detach_silently();

        assert_eq!(
            service.send_pattern(dots(&[1])).await,
            Err(SendError::NotConnected)
        );
        assert!(!service.is_connected());
        assert_eq!(mock.state().write_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_drop_after_reconnect_is_ignored() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();
        let old = mock.notifier().unwrap();

        service.connect().await.unwrap();
        old.notify();

        service.send_pattern(dots(&[6])).await.unwrap();
        assert!(service.is_connected());
        assert_eq!(mock.written(), vec![0b0010_0000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_fails_pending_jobs() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        let a = service.enqueue(dots(&[1]));
        service.connect().await.unwrap();

        assert_eq!(a.await, Err(SendError::ManuallyDisconnected));
        assert!(service.is_connected());
        assert_eq!(mock.state().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_reported() {
        let (transport, mock) = MockTransport::new();
        mock.fail_at(Step::Characteristic);
        let (service, _events) = DeviceService::spawn(transport);

        let err = service.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::CharacteristicNotFound(_)));
        assert!(!service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_symbol_uses_encoder() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();

        service.send_symbol("AND").await.unwrap();
        service.send_symbol("?!").await.unwrap();
        assert_eq!(mock.written(), vec![0b0010_1111, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_state_follows_connection() {
        let (transport, mock) = MockTransport::new();
        let (service, _events) = DeviceService::spawn(transport);
        let mut state = service.watch_state();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

        service.connect().await.unwrap();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

        mock.drop_link();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_report_state_changes() {
        let (transport, _mock) = MockTransport::new();
        let (service, mut events) = DeviceService::spawn(transport);
        service.connect().await.unwrap();
        service.disconnect().await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DeviceEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }
}
