//! BLE connection management.
//!
//! Owns the link handle for the oximeter and drives the
//! `Disconnected` / `Connected` state machine.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::link::{BleLink, FrameSink, LinkLossSink};
use crate::error::{Error, Result};

/// Connection state for the oximeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No live link.
    #[default]
    Disconnected,
    /// Link is live and subscribed for notifications.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Address of the peripheral.
    pub address: String,
    /// The new connection state.
    pub state: ConnectionState,
    /// Why the link went down, for unsolicited losses.
    pub reason: Option<String>,
}

/// A release running in the background.
type PendingRelease = tokio::task::JoinHandle<Result<()>>;

struct LinkSlot<H> {
    state: ConnectionState,
    handle: Option<Arc<H>>,
    /// Bumped on every connect and disconnect so stale loss reports are ignored.
    generation: u64,
    /// A loss was reported for the current generation before the connect committed.
    lost_during_setup: bool,
    /// Releases of earlier links; `connect()` waits for them first.
    pending_releases: Vec<PendingRelease>,
}

/// State shared with the link-loss observers handed to the transport.
struct Shared<L: BleLink> {
    link: Arc<L>,
    address: String,
    slot: Mutex<LinkSlot<L::Handle>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    link_loss_listener: RwLock<Option<LinkLossSink>>,
}

impl<L: BleLink> Shared<L> {
    fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    fn publish(&self, state: ConnectionState, reason: Option<String>) {
        debug!("Connection state for {} is now {}", self.address, state);

        let _ = self.event_tx.send(ConnectionEvent {
            address: self.address.clone(),
            state,
            reason,
        });
    }

    /// Release `handle` on the current runtime and track the task.
    ///
    /// Must not be called with the slot lock held.
    fn release_in_background(&self, handle: Arc<L::Handle>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(teardown(self.link.clone(), handle, None));
                let mut slot = self.slot.lock();
                slot.pending_releases.retain(|task| !task.is_finished());
                slot.pending_releases.push(task);
            }
            Err(_) => error!("No runtime available to release link to {}", self.address),
        }
    }

    fn track_release(&self, task: PendingRelease) {
        self.slot.lock().pending_releases.push(task);
    }

    fn handle_link_loss(&self, generation: u64, reason: Option<String>) {
        let dead_handle = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                debug!(
                    "Ignoring link loss from stale generation {} (current {})",
                    generation, slot.generation
                );
                return;
            }
            if !slot.state.is_connected() {
                slot.lost_during_setup = true;
                return;
            }
            slot.state = ConnectionState::Disconnected;
            slot.handle.take()
        };

        warn!(
            "Link to {} lost: {}",
            self.address,
            reason.as_deref().unwrap_or("unknown reason")
        );
        if let Some(handle) = dead_handle {
            self.release_in_background(handle);
        }
        self.publish(ConnectionState::Disconnected, reason.clone());

        let listener = self.link_loss_listener.read().clone();
        if let Some(listener) = listener {
            listener(reason);
        }
    }
}

/// Stop notifications (when `characteristic` is given) and release the link.
///
/// Release always runs; an unsubscribe failure is returned after it.
async fn teardown<L: BleLink>(
    link: Arc<L>,
    handle: Arc<L::Handle>,
    characteristic: Option<Uuid>,
) -> Result<()> {
    let unsubscribed = match characteristic {
        Some(characteristic) => link.unsubscribe(&handle, &characteristic).await,
        None => Ok(()),
    };
    if let Err(e) = &unsubscribed {
        warn!("Failed to stop notifications: {}", e);
    }

    let released = link.disconnect(&handle).await;
    if let Err(e) = &released {
        error!("Failed to release link: {}", e);
    }

    unsubscribed?;
    released
}

/// Releases a partially acquired link unless disarmed.
///
/// Dropping an armed guard (for example when a `connect()` future is
/// cancelled) schedules the release on the current runtime.
struct ReleaseGuard<L: BleLink> {
    shared: Arc<Shared<L>>,
    handle: Option<Arc<L::Handle>>,
}

impl<L: BleLink> ReleaseGuard<L> {
    fn new(shared: Arc<Shared<L>>, handle: Arc<L::Handle>) -> Self {
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }

    async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = teardown(self.shared.link.clone(), handle, None).await {
                warn!("Failed to release partially connected link: {}", e);
            }
        }
    }
}

impl<L: BleLink> Drop for ReleaseGuard<L> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Connect abandoned, releasing link in background");
            self.shared.release_in_background(handle);
        }
    }
}

/// Keeps a running teardown tracked if `disconnect()` is dropped mid-way.
struct PendingTeardown<'a, L: BleLink> {
    shared: &'a Shared<L>,
    task: Option<PendingRelease>,
}

impl<L: BleLink> Drop for PendingTeardown<'_, L> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Disconnect abandoned, teardown continues in background");
            self.shared.track_release(task);
        }
    }
}

/// Manages the link to the oximeter.
///
/// `connect()` and `disconnect()` are serialized; the transport reports
/// unsolicited losses through an observer registered on every connect.
/// Both operations are cancel-safe: a dropped future never leaves the state
/// `Connected` without a live link, and any acquired link is still released.
pub struct ConnectionManager<L: BleLink> {
    /// Characteristic carrying notification frames.
    characteristic: Uuid,
    /// Where notification frames are delivered.
    frame_sink: FrameSink,
    /// Transport and state shared with link-loss observers.
    shared: Arc<Shared<L>>,
    /// Serializes connect and disconnect.
    op_lock: tokio::sync::Mutex<()>,
}

impl<L: BleLink> ConnectionManager<L> {
    /// Create a connection manager for the peripheral at `address`.
    pub fn new(
        link: Arc<L>,
        address: impl Into<String>,
        characteristic: Uuid,
        frame_sink: FrameSink,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            characteristic,
            frame_sink,
            shared: Arc::new(Shared {
                link,
                address: address.into(),
                slot: Mutex::new(LinkSlot {
                    state: ConnectionState::Disconnected,
                    handle: None,
                    generation: 0,
                    lost_during_setup: false,
                    pending_releases: Vec::new(),
                }),
                event_tx,
                link_loss_listener: RwLock::new(None),
            }),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Address of the peripheral.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Characteristic subscribed for notifications.
    pub fn characteristic(&self) -> &Uuid {
        &self.characteristic
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Set the callback told about unsolicited link losses.
    ///
    /// It runs after the state has moved to `Disconnected`.
    pub fn set_link_loss_listener(&self, listener: LinkLossSink) {
        *self.shared.link_loss_listener.write() = Some(listener);
    }

    /// Connect and subscribe for notifications.
    ///
    /// Does nothing if already connected. Waits for releases of earlier links
    /// to finish first. On failure any partially acquired link is released
    /// and the state stays `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;

        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        self.wait_for_pending_releases().await;

        let address = self.address();
        debug!("Connecting to {}", address);

        let link = &self.shared.link;
        let handle = Arc::new(link.connect(address).await?);
        let mut guard = ReleaseGuard::new(self.shared.clone(), handle.clone());

        let generation = {
            let mut slot = self.shared.slot.lock();
            slot.generation += 1;
            slot.lost_during_setup = false;
            slot.generation
        };

        if let Err(e) = link
            .subscribe(&handle, &self.characteristic, self.frame_sink.clone())
            .await
        {
            warn!("Failed to subscribe to {}: {}", self.characteristic, e);
            guard.release().await;
            return Err(e);
        }

        if let Err(e) = link
            .watch_link_loss(&handle, self.link_loss_observer(generation))
            .await
        {
            warn!("Failed to watch link to {}: {}", address, e);
            guard.release().await;
            return Err(e);
        }

        let committed = {
            let mut slot = self.shared.slot.lock();
            if slot.lost_during_setup {
                false
            } else {
                slot.handle = Some(handle);
                slot.state = ConnectionState::Connected;
                true
            }
        };

        if !committed {
            guard.release().await;
            return Err(Error::ConnectionFailed {
                reason: "link lost during setup".to_string(),
            });
        }

        guard.disarm();
        info!("Connected to {}", address);
        self.shared.publish(ConnectionState::Connected, None);

        Ok(())
    }

    /// Unsubscribe and release the link.
    ///
    /// Does nothing if already disconnected. The state moves to
    /// `Disconnected` before any await; the link is released even when
    /// unsubscribing fails or this future is dropped, and an unsubscribe
    /// failure is returned once cleanup is done.
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let handle = {
            let mut slot = self.shared.slot.lock();
            if !slot.state.is_connected() {
                return Ok(());
            }
            slot.generation += 1;
            slot.state = ConnectionState::Disconnected;
            slot.handle.take()
        };

        info!("Disconnecting from {}", self.address());
        self.shared.publish(ConnectionState::Disconnected, None);

        let Some(handle) = handle else {
            return Ok(());
        };

        let task = tokio::spawn(teardown(
            self.shared.link.clone(),
            handle,
            Some(self.characteristic),
        ));
        let mut pending = PendingTeardown {
            shared: &self.shared,
            task: Some(task),
        };

        let outcome = match pending.task.as_mut() {
            Some(task) => task.await,
            None => return Ok(()),
        };
        pending.task = None;

        outcome.unwrap_or_else(|e| {
            Err(Error::ReleaseFailed {
                reason: e.to_string(),
            })
        })
    }

    async fn wait_for_pending_releases(&self) {
        loop {
            let next = self.shared.slot.lock().pending_releases.pop();
            let Some(task) = next else {
                break;
            };
            if let Err(e) = task.await {
                error!("Background release of {} failed: {}", self.address(), e);
            }
        }
    }

    fn link_loss_observer(&self, generation: u64) -> LinkLossSink {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |reason: Option<String>| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_link_loss(generation, reason);
            }
        })
    }
}
