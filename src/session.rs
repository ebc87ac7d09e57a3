//! Oximeter session.
//!
//! A [`Session`] ties the connection state machine, the reconnection
//! supervisor and the registered reading consumers together for one
//! peripheral.

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::link::{BleLink, FrameSink};
use crate::config::SessionConfig;
use crate::data::Reading;
use crate::error::{Error, Result};
use crate::protocol;
use crate::supervisor::{ReconnectSupervisor, RecoveryEvent};

/// A sink for decoded readings.
///
/// Consumers are called synchronously on the transport's delivery path and
/// should return quickly. Errors and panics are contained per consumer.
pub trait ReadingConsumer: Send + Sync {
    /// Handle one reading.
    fn consume(&self, reading: &Reading) -> Result<()>;

    /// Release any resources. Called once when the session shuts down.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A [`ReadingConsumer`] backed by a closure.
pub struct FnConsumer<F> {
    name: &'static str,
    f: F,
}

impl<F> FnConsumer<F>
where
    F: Fn(&Reading) -> Result<()> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> ReadingConsumer for FnConsumer<F>
where
    F: Fn(&Reading) -> Result<()> + Send + Sync,
{
    fn consume(&self, reading: &Reading) -> Result<()> {
        (self.f)(reading)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Identifies a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// Outcome of delivering one reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Consumers that accepted the reading.
    pub delivered: usize,
    /// Consumers that returned an error or panicked.
    pub failed: usize,
}

/// Counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames decoded into readings.
    pub frames_accepted: u64,
    /// Frames that were not summary frames.
    pub frames_rejected: u64,
    /// Consumer calls that failed.
    pub consumer_failures: u64,
}

/// Ordered consumer registry. Deliveries are serialized.
#[derive(Default)]
struct Dispatcher {
    consumers: RwLock<Vec<(ConsumerId, Arc<dyn ReadingConsumer>)>>,
    dispatch_lock: Mutex<()>,
    next_id: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    consumer_failures: AtomicU64,
}

impl Dispatcher {
    fn register(&self, consumer: Arc<dyn ReadingConsumer>) -> ConsumerId {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!("Registering consumer {} as {:?}", consumer.name(), id);
        self.consumers.write().push((id, consumer));
        id
    }

    fn unregister(&self, id: ConsumerId) -> Option<Arc<dyn ReadingConsumer>> {
        let mut consumers = self.consumers.write();
        let index = consumers.iter().position(|(cid, _)| *cid == id)?;
        Some(consumers.remove(index).1)
    }

    fn snapshot(&self) -> Vec<Arc<dyn ReadingConsumer>> {
        self.consumers.read().iter().map(|(_, c)| c.clone()).collect()
    }

    fn deliver(&self, reading: &Reading) -> DispatchReport {
        let _serial = self.dispatch_lock.lock();
        let mut report = DispatchReport::default();

        for consumer in self.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| consumer.consume(reading))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!("Consumer {} failed: {}", consumer.name(), e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!("Consumer {} panicked", consumer.name());
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            self.consumer_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    fn handle_frame(&self, data: &[u8]) -> Option<DispatchReport> {
        match protocol::decode(data) {
            Ok(reading) => {
                self.frames_accepted.fetch_add(1, Ordering::Relaxed);
                Some(self.deliver(&reading))
            }
            Err(_) => {
                self.frames_rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn close_all(&self) {
        for consumer in self.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| consumer.close())) {
                Ok(Ok(())) => debug!("Closed consumer {}", consumer.name()),
                Ok(Err(e)) => warn!("Failed to close consumer {}: {}", consumer.name(), e),
                Err(_) => error!("Consumer {} panicked while closing", consumer.name()),
            }
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            consumer_failures: self.consumer_failures.load(Ordering::Relaxed),
        }
    }
}

/// A data session with one oximeter.
pub struct Session<L: BleLink> {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    connection: Arc<ConnectionManager<L>>,
    supervisor: Arc<ReconnectSupervisor<L>>,
    closed: AtomicBool,
    /// Runtime the session was created on; cleanup on drop is spawned here.
    runtime: tokio::runtime::Handle,
}

impl<L: BleLink> Session<L> {
    /// Create a session over `link`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration or when called outside a
    /// tokio runtime.
    pub fn new(config: SessionConfig, link: Arc<L>) -> Result<Self> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::default());
        let frames = dispatcher.clone();
        let frame_sink: FrameSink = Arc::new(move |data: &[u8]| {
            frames.handle_frame(data);
        });

        let connection = Arc::new(ConnectionManager::new(
            link,
            config.address.clone(),
            config.characteristic,
            frame_sink,
        ));
        let supervisor = ReconnectSupervisor::new(connection.clone(), config.reconnect)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;

        if config.auto_reconnect {
            connection.set_link_loss_listener(supervisor.link_loss_listener());
        }

        Ok(Self {
            config,
            dispatcher,
            connection,
            supervisor,
            closed: AtomicBool::new(false),
            runtime,
        })
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Whether a reconnection loop is running.
    pub fn is_recovering(&self) -> bool {
        self.supervisor.is_recovering()
    }

    /// Whether [`Session::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frame and consumer counters.
    pub fn stats(&self) -> SessionStats {
        self.dispatcher.stats()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Subscribe to reconnection progress.
    pub fn subscribe_recovery_events(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.supervisor.subscribe()
    }

    // === Consumers ===

    /// Add a consumer. Consumers are called in registration order.
    pub fn register_consumer(&self, consumer: Arc<dyn ReadingConsumer>) -> ConsumerId {
        self.dispatcher.register(consumer)
    }

    /// Add a closure as a consumer.
    pub fn register_fn<F>(&self, name: &'static str, f: F) -> ConsumerId
    where
        F: Fn(&Reading) -> Result<()> + Send + Sync + 'static,
    {
        self.register_consumer(Arc::new(FnConsumer::new(name, f)))
    }

    /// Remove a consumer. Returns false if it was not registered.
    ///
    /// The consumer is not closed; the caller owns it again.
    pub fn unregister_consumer(&self, id: ConsumerId) -> bool {
        self.dispatcher.unregister(id).is_some()
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.dispatcher.consumers.read().len()
    }

    /// Hand a reading to every consumer in registration order.
    ///
    /// Must not be called from inside a consumer.
    pub fn deliver(&self, reading: &Reading) -> DispatchReport {
        self.dispatcher.deliver(reading)
    }

    /// Decode a notification frame and deliver it if accepted.
    ///
    /// Returns `None` for rejected frames.
    pub fn handle_frame(&self, data: &[u8]) -> Option<DispatchReport> {
        self.dispatcher.handle_frame(data)
    }

    // === Lifecycle ===

    /// Connect to the oximeter.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.connection.connect().await
    }

    /// Connect, handing a transient failure to the supervisor when
    /// auto-reconnect is enabled.
    pub async fn start(&self) -> Result<()> {
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) if self.config.auto_reconnect && e.is_transient() => {
                warn!("Initial connection failed: {}, retrying in background", e);
                self.supervisor.on_link_lost(Some(e.to_string()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the session until `signal` completes, then shut down.
    ///
    /// `signal` is the external quit trigger (console, API call, timer).
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.start().await {
            if let Err(close_err) = self.shutdown().await {
                debug!("Shutdown after failed start: {}", close_err);
            }
            return Err(e);
        }

        signal.await;
        info!("Quit requested, ending session");

        self.shutdown().await
    }

    /// Tear the session down.
    ///
    /// Cancels any reconnection loop, disconnects, then closes every
    /// consumer. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        self.supervisor.cancel().await;
        let disconnected = self.connection.disconnect().await;

        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Session with {} closed", self.config.address);
            self.dispatcher.close_all();
        }

        disconnected
    }
}

impl<L: BleLink> Drop for Session<L> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("Session with {} dropped without shutdown", self.config.address);
        self.supervisor.abort();

        // Drop cannot await; release and close on the runtime instead.
        let connection = self.connection.clone();
        let dispatcher = self.dispatcher.clone();
        self.runtime.spawn(async move {
            if let Err(e) = connection.disconnect().await {
                warn!("Failed to disconnect dropped session: {}", e);
            }
            dispatcher.close_all();
        });
    }
}
