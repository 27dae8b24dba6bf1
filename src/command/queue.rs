//! Per-device command queue.
//!
//! Each [`CommandQueue`] owns a worker task that executes submitted batches
//! one at a time, connecting on demand and disconnecting after an idle grace
//! period. The worker is the only code that changes the device's connection
//! state.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::RadioAdapter;
use crate::command::operation::{GattOperation, GattValue, OperationKind};
use crate::config::CommandConfig;
use crate::device::{ConnectionState, FinderDevice};
use crate::error::{Error, Result};
use crate::events::{EventBus, FinderEvent};

type Reply = oneshot::Sender<Result<Vec<GattValue>>>;

/// A submitted batch of operations.
struct Job {
    operations: Vec<GattOperation>,
    reply: Reply,
}

/// Out-of-band requests to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Caller asked to drop the link.
    Disconnect,
    /// The radio reported the link down.
    LinkLost,
    /// Close the link and stop the worker.
    Shutdown,
}

impl Control {
    fn error(&self) -> Error {
        match self {
            Self::LinkLost => link_lost(),
            Self::Disconnect | Self::Shutdown => Error::Cancelled,
        }
    }
}

fn link_lost() -> Error {
    Error::ConnectionError {
        reason: "link lost".to_string(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Why [`QueueWorker::connect`] gave up.
enum Failure {
    Error(Error),
    Interrupted(Control),
}

/// Handle to one device's command queue.
///
/// Dropping the handle stops the worker without closing the link; use
/// [`close`](Self::close) for an orderly shutdown.
pub struct CommandQueue {
    device: Arc<FinderDevice>,
    radio: Arc<dyn RadioAdapter>,
    jobs_tx: mpsc::UnboundedSender<Job>,
    control_tx: mpsc::UnboundedSender<Control>,
    runtime: Handle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Start a queue for `device`.
    ///
    /// `permits` is shared by every queue of one engine and bounds the number
    /// of simultaneous links.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when called outside a tokio runtime.
    pub fn spawn(
        device: Arc<FinderDevice>,
        radio: Arc<dyn RadioAdapter>,
        bus: EventBus,
        permits: Arc<Semaphore>,
        config: CommandConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("command queue needs a runtime: {}", e)))?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = QueueWorker {
            device: device.clone(),
            radio: radio.clone(),
            bus,
            permits,
            config,
            jobs_rx,
            control_rx,
            pending: VecDeque::new(),
            link: None,
            link_lost: false,
            echoes: 0,
        };
        let handle = runtime.spawn(worker.run());

        Ok(Self {
            device,
            radio,
            jobs_tx,
            control_tx,
            runtime,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// The device this queue commands.
    pub fn device(&self) -> &Arc<FinderDevice> {
        &self.device
    }

    /// Run `operations` in order and wait for the result.
    ///
    /// An empty batch just opens the link.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`Error::NotPoweredOn`] if the radio is off.
    /// Otherwise returns the first error hit by the batch; operations after
    /// the failing one are not attempted, and batches already queued behind
    /// it fail with the same error.
    pub async fn submit(&self, operations: Vec<GattOperation>) -> Result<Vec<GattValue>> {
        let reply = self.enqueue(operations)?;
        reply.await.map_err(|_| Error::Cancelled)?
    }

    /// Callback form of [`submit`](Self::submit).
    ///
    /// Exactly one of the callbacks is invoked. `on_error` runs inline if the
    /// batch cannot be queued.
    pub fn submit_with<C, E>(&self, operations: Vec<GattOperation>, on_complete: C, on_error: E)
    where
        C: FnOnce(Vec<GattValue>) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        match self.enqueue(operations) {
            Ok(reply) => {
                self.runtime.spawn(async move {
                    match reply.await {
                        Ok(Ok(values)) => on_complete(values),
                        Ok(Err(e)) => on_error(e),
                        Err(_) => on_error(Error::Cancelled),
                    }
                });
            }
            Err(e) => on_error(e),
        }
    }

    /// Drop the link. Queued operations fail with [`Error::Cancelled`].
    pub fn disconnect(&self) {
        let _ = self.control_tx.send(Control::Disconnect);
    }

    /// Report that the radio dropped the link.
    pub(crate) fn link_lost(&self) {
        let _ = self.control_tx.send(Control::LinkLost);
    }

    /// Cancel queued operations, close the link and wait for the worker to
    /// finish.
    pub async fn close(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn enqueue(
        &self,
        operations: Vec<GattOperation>,
    ) -> Result<oneshot::Receiver<Result<Vec<GattValue>>>> {
        if !self.radio.power_state().is_powered_on() {
            debug!("Rejecting commands for {}: radio off", self.device.id());
            return Err(Error::NotPoweredOn);
        }

        let (reply, rx) = oneshot::channel();
        self.jobs_tx
            .send(Job { operations, reply })
            .map_err(|_| Error::Cancelled)?;
        Ok(rx)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("device", &self.device.id())
            .finish()
    }
}

/// A live link. Holding it holds one connection permit.
struct Link {
    address: String,
    _permit: OwnedSemaphorePermit,
}

struct QueueWorker {
    device: Arc<FinderDevice>,
    radio: Arc<dyn RadioAdapter>,
    bus: EventBus,
    permits: Arc<Semaphore>,
    config: CommandConfig,
    jobs_rx: mpsc::UnboundedReceiver<Job>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Jobs pulled off the channel, oldest first.
    pending: VecDeque<Job>,
    link: Option<Link>,
    /// The previous link dropped without being asked to.
    link_lost: bool,
    /// Requested disconnects the radio has yet to report back.
    echoes: u32,
}

impl QueueWorker {
    async fn run(mut self) {
        debug!("Command queue for {} started", self.device.id());

        loop {
            if let Some(job) = self.pending.pop_front() {
                if self.execute(job).await == Flow::Exit {
                    break;
                }
                continue;
            }

            let idle = self.link.is_some();
            let grace = self.config.idle_disconnect;

            tokio::select! {
                biased;
                control = self.control_rx.recv() => {
                    let control = control.unwrap_or(Control::Shutdown);
                    if self.handle_control(control).await == Flow::Exit {
                        break;
                    }
                }
                job = self.jobs_rx.recv() => match job {
                    Some(job) => self.pending.push_back(job),
                    None => break,
                },
                _ = tokio::time::sleep(grace), if idle => {
                    debug!("Idle grace expired for {}", self.device.id());
                    self.close_link("idle").await;
                }
            }
        }

        self.fail_queued(&Error::Cancelled);
        self.close_link("shutdown").await;
        debug!("Command queue for {} ended", self.device.id());
    }

    async fn handle_control(&mut self, control: Control) -> Flow {
        match control {
            Control::LinkLost => {
                if self.echoes > 0 {
                    self.echoes -= 1;
                    trace!("Link loss for {} was requested", self.device.id());
                    return Flow::Continue;
                }
                if self.link.is_some() {
                    self.fail_queued(&link_lost());
                }
                self.drop_link();
                Flow::Continue
            }
            Control::Disconnect => {
                self.fail_queued(&Error::Cancelled);
                self.close_link("requested").await;
                Flow::Continue
            }
            Control::Shutdown => Flow::Exit,
        }
    }

    async fn execute(&mut self, job: Job) -> Flow {
        let Job { operations, reply } = job;

        let address = match self.connect().await {
            Ok(address) => address,
            Err(Failure::Error(error)) => {
                let _ = reply.send(Err(error.clone()));
                self.fail_queued(&error);
                return Flow::Continue;
            }
            Err(Failure::Interrupted(control)) => {
                let _ = reply.send(Err(control.error()));
                return self.handle_control(control).await;
            }
        };

        if operations.is_empty() {
            let _ = reply.send(Ok(Vec::new()));
            self.settle();
            return Flow::Continue;
        }

        self.device
            .set_connection_state(ConnectionState::Communicating);

        let mut values = Vec::with_capacity(operations.len());
        for operation in operations {
            trace!("{}: {}", self.device.id(), operation);

            let radio = self.radio.clone();
            let target = address.clone();
            let op = operation.clone();
            let limit = self.config.operation_timeout;
            let attempt = async move { timeout(limit, perform(radio.as_ref(), &target, &op)).await };

            match guarded(&mut self.control_rx, &mut self.echoes, attempt, true).await {
                Ok(Ok(Ok(value))) => {
                    values.push(value);
                    self.publish_updated();
                }
                Ok(Ok(Err(error))) => {
                    warn!("{} failed on {}: {}", operation, self.device.id(), error);
                    self.bus.publish(FinderEvent::ConnectionError {
                        device: self.device.clone(),
                        error: error.clone(),
                    });
                    let _ = reply.send(Err(error.clone()));
                    self.fail_queued(&error);
                    if error.is_connection_class() {
                        self.close_link("operation failed").await;
                    } else {
                        self.settle();
                    }
                    return Flow::Continue;
                }
                Ok(Err(_elapsed)) => {
                    warn!("{} timed out on {}", operation, self.device.id());
                    self.bus.publish(FinderEvent::TimedOut {
                        device: self.device.clone(),
                        kind: operation.timeout_kind(),
                    });
                    let _ = reply.send(Err(Error::OperationTimeout));
                    self.fail_queued(&Error::OperationTimeout);
                    self.close_link("operation timeout").await;
                    return Flow::Continue;
                }
                Err(control) => {
                    let _ = reply.send(Err(control.error()));
                    return self.handle_control(control).await;
                }
            }
        }

        let _ = reply.send(Ok(values));
        self.settle();
        Flow::Continue
    }

    /// Make sure a link is up, returning its address.
    async fn connect(&mut self) -> std::result::Result<String, Failure> {
        if let Some(link) = &self.link {
            let address = link.address.clone();
            if self.device.connection_state() == ConnectionState::Connected {
                self.bus.publish(FinderEvent::AlreadyConnected {
                    device: self.device.clone(),
                });
            }
            return Ok(address);
        }

        let address = match self.device.require_address() {
            Ok(address) => address,
            Err(error) => {
                debug!("{} has never been sighted", self.device.id());
                self.publish_connection_error(error.clone());
                return Err(Failure::Error(error));
            }
        };

        self.device.set_connection_state(ConnectionState::Connecting);
        debug!("Connecting to {} at {}", self.device.id(), address);

        let permits = self.permits.clone();
        let radio = self.radio.clone();
        let target = address.clone();
        let limit = self.config.connection_timeout;
        let attempt = async move {
            // Waiting for a permit does not count against the timeout
            let permit = permits.acquire_owned().await.map_err(|_| Error::Cancelled)?;
            match timeout(limit, radio.connect(&target)).await {
                Ok(Ok(())) => Ok(permit),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::ConnectionTimeout),
            }
        };

        match guarded(&mut self.control_rx, &mut self.echoes, attempt, false).await {
            Ok(Ok(permit)) => {
                self.link = Some(Link {
                    address: address.clone(),
                    _permit: permit,
                });
                self.device.set_connection_state(ConnectionState::Connected);

                let device = self.device.clone();
                if std::mem::take(&mut self.link_lost) {
                    info!("Reconnected to {}", device.id());
                    self.bus.publish(FinderEvent::Reconnected { device });
                } else {
                    info!("Connected to {}", device.id());
                    self.bus.publish(FinderEvent::Connected { device });
                }
                Ok(address)
            }
            Ok(Err(error)) => {
                warn!("Failed to connect to {}: {}", self.device.id(), error);
                if matches!(error, Error::ConnectionTimeout) {
                    // Abandon the pending attempt
                    self.disconnect_radio(&address).await;
                }
                self.device
                    .set_connection_state(ConnectionState::Disconnected);
                self.publish_connection_error(error.clone());

                Err(Failure::Error(match error {
                    Error::ConnectionTimeout | Error::Cancelled => error,
                    _ => Error::NotConnected,
                }))
            }
            Err(control) => Err(Failure::Interrupted(control)),
        }
    }

    /// Pull anything already submitted into `pending`, then settle the
    /// connection state.
    fn settle(&mut self) {
        while let Ok(job) = self.jobs_rx.try_recv() {
            self.pending.push_back(job);
        }
        if self.pending.is_empty() && self.link.is_some() {
            self.device.set_connection_state(ConnectionState::Connected);
        }
    }

    /// Resolve every queued job with `error`.
    fn fail_queued(&mut self, error: &Error) {
        while let Ok(job) = self.jobs_rx.try_recv() {
            self.pending.push_back(job);
        }
        if self.pending.is_empty() {
            return;
        }

        debug!(
            "Draining {} queued batches for {}: {}",
            self.pending.len(),
            self.device.id(),
            error
        );
        for job in self.pending.drain(..) {
            let _ = job.reply.send(Err(error.clone()));
        }
    }

    /// Close the link ourselves.
    async fn close_link(&mut self, reason: &str) {
        if self.device.connection_state() == ConnectionState::Disconnected {
            self.link = None;
            return;
        }

        match self.link.as_ref().map(|link| link.address.clone()) {
            Some(address) => {
                // The radio reports the drop back like any other
                if self.disconnect_radio(&address).await {
                    self.echoes += 1;
                }
            }
            None => {
                if let Some(address) = self.device.address() {
                    self.disconnect_radio(&address).await;
                }
            }
        }

        self.link = None;
        self.link_lost = false;
        self.device
            .set_connection_state(ConnectionState::Disconnected);
        info!("Disconnected from {} ({})", self.device.id(), reason);
        self.bus.publish(FinderEvent::Disconnected {
            device: self.device.clone(),
        });
    }

    /// The radio closed the link without being asked to.
    fn drop_link(&mut self) {
        self.link = None;
        if self.device.connection_state() == ConnectionState::Disconnected {
            trace!("Ignoring link loss for {}: not connected", self.device.id());
            return;
        }

        warn!("Lost link to {}", self.device.id());
        self.link_lost = true;
        self.device
            .set_connection_state(ConnectionState::Disconnected);
        self.publish_connection_error(link_lost());
    }

    async fn disconnect_radio(&self, address: &str) -> bool {
        match timeout(self.config.connection_timeout, self.radio.disconnect(address)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Error disconnecting {}: {}", self.device.id(), e);
                false
            }
            Err(_) => {
                warn!("Timed out disconnecting {}", self.device.id());
                false
            }
        }
    }

    fn publish_connection_error(&self, error: Error) {
        self.bus.publish(FinderEvent::ConnectionError {
            device: self.device.clone(),
            error,
        });
    }

    fn publish_updated(&self) {
        self.bus.publish(FinderEvent::Updated {
            device: self.device.clone(),
        });
    }
}

/// Run `fut` unless a control request arrives first.
///
/// Link losses that echo a requested disconnect are consumed from `echoes`.
/// The rest are ignored while `link_up` is false; they refer to a link that
/// is already gone.
async fn guarded<F: Future>(
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
    echoes: &mut u32,
    fut: F,
    link_up: bool,
) -> std::result::Result<F::Output, Control> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                Some(Control::LinkLost) if *echoes > 0 => {
                    *echoes -= 1;
                    trace!("Ignoring echo of a requested disconnect");
                }
                Some(Control::LinkLost) if !link_up => {
                    trace!("Ignoring stale link loss");
                }
                Some(control) => return Err(control),
                None => return Err(Control::Shutdown),
            },
            output = &mut fut => return Ok(output),
        }
    }
}

async fn perform(
    radio: &dyn RadioAdapter,
    address: &str,
    operation: &GattOperation,
) -> Result<GattValue> {
    let characteristic = operation.characteristic;
    match &operation.kind {
        OperationKind::Read => {
            let data = radio.read(address, &characteristic).await?;
            Ok(GattValue {
                characteristic,
                data,
            })
        }
        OperationKind::Write(value) => {
            radio.write(address, &characteristic, value).await?;
            Ok(GattValue {
                characteristic,
                data: value.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{MockRadioAdapter, PowerState};
    use crate::ble::advertising::IBeacon;
    use crate::ble::uuids::{CONTROL_VERSION, XY3_FAMILY_UUID};
    use crate::events::EventKind;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Duration;

    fn sighted_device() -> Arc<FinderDevice> {
        let beacon = IBeacon::new(XY3_FAMILY_UUID, 7, 0x0104);
        let device = Arc::new(FinderDevice::from_beacon(beacon).unwrap());
        device.record_sighting("AA:BB", beacon, -60, Vec::new());
        device
    }

    fn queue(
        radio: MockRadioAdapter,
        device: Arc<FinderDevice>,
    ) -> (CommandQueue, tokio::sync::broadcast::Receiver<FinderEvent>) {
        let bus = EventBus::new();
        let events = bus.stream();
        let queue = CommandQueue::spawn(
            device,
            Arc::new(radio),
            bus,
            Arc::new(Semaphore::new(1)),
            CommandConfig::default(),
        )
        .unwrap();
        (queue, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_connects_and_idles_out() {
        let mut radio = MockRadioAdapter::new();
        let mut seq = Sequence::new();
        radio
            .expect_power_state()
            .return_const(PowerState::PoweredOn);
        radio
            .expect_connect()
            .with(eq("AA:BB"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        radio
            .expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Bytes::from_static(b"3.0")));
        radio
            .expect_disconnect()
            .with(eq("AA:BB"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let device = sighted_device();
        let (queue, mut events) = queue(radio, device.clone());

        let values = queue
            .submit(vec![GattOperation::read(CONTROL_VERSION)])
            .await
            .unwrap();
        assert_eq!(values[0].as_string().unwrap(), "3.0");
        assert_eq!(device.connection_state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);

        let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Connected,
                EventKind::Updated,
                EventKind::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_when_powered_off() {
        let mut radio = MockRadioAdapter::new();
        radio
            .expect_power_state()
            .return_const(PowerState::PoweredOff);
        radio.expect_connect().never();

        let (queue, _events) = queue(radio, sighted_device());
        let result = queue.submit(vec![GattOperation::read(CONTROL_VERSION)]).await;
        assert!(matches!(result, Err(Error::NotPoweredOn)));

        let (tx, rx) = oneshot::channel();
        queue.submit_with(
            vec![GattOperation::read(CONTROL_VERSION)],
            |_| panic!("should not complete"),
            move |e| {
                let _ = tx.send(e);
            },
        );
        assert!(matches!(rx.await.unwrap(), Error::NotPoweredOn));
    }

    #[tokio::test]
    async fn test_unsighted_device_is_not_connected() {
        let mut radio = MockRadioAdapter::new();
        radio
            .expect_power_state()
            .return_const(PowerState::PoweredOn);
        radio.expect_connect().never();

        let device = Arc::new(
            FinderDevice::from_id("xy:ibeacon:08885dd0-111b-11e4-9191-0800200c9a66.7.260")
                .unwrap(),
        );
        let (queue, _events) = queue(radio, device);
        let result = queue.submit(vec![GattOperation::read(CONTROL_VERSION)]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
