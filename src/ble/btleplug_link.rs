//! [`BleLink`] over the platform Bluetooth stack via `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::link::{BleLink, FrameSink, LinkLossSink};
use crate::ble::uuids::is_oximeter_characteristic;
use crate::error::{Error, Result};

/// How long `connect` scans for a peripheral that is not yet known.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A connected peripheral plus the tasks forwarding its events.
pub struct BtleplugHandle {
    peripheral: Peripheral,
    /// Adapter events opened before connecting, until a watcher takes them.
    events: Mutex<Option<BoxStream<'static, CentralEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugHandle {
    /// The underlying peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for BtleplugHandle {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Real transport using the first Bluetooth adapter.
pub struct BtleplugLink {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BtleplugLink {
    /// Use the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Set how long `connect` may scan for an unknown peripheral.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// The adapter in use.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn known_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        let wanted = address.parse::<BDAddr>().ok();
        let needle = address.to_ascii_lowercase();

        for peripheral in self.adapter.peripherals().await? {
            let matches = match wanted {
                Some(addr) => peripheral.address() == addr,
                // macOS hides MAC addresses; fall back to the platform id.
                None => format!("{:?}", peripheral.id())
                    .to_ascii_lowercase()
                    .contains(&needle),
            };
            if matches {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }

        debug!("Scanning up to {:?} for {}", self.scan_timeout, address);
        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = tokio::time::timeout(self.scan_timeout, async {
            loop {
                match self.known_peripheral(address).await {
                    Ok(Some(peripheral)) => return Ok(peripheral),
                    Ok(None) => tokio::time::sleep(SCAN_POLL_INTERVAL).await,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(Error::PeripheralNotFound {
                address: address.to_string(),
            }),
        }
    }

    fn characteristic(handle: &BtleplugHandle, uuid: &Uuid) -> Result<Characteristic> {
        handle
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    type Handle = BtleplugHandle;

    async fn connect(&self, address: &str) -> Result<BtleplugHandle> {
        let peripheral = self.find_peripheral(address).await?;

        // Subscribe to adapter events before connecting so a drop during
        // setup is still seen by the watcher.
        let events = self.adapter.events().await?;

        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })?;

        let handle = BtleplugHandle {
            peripheral,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
        };

        if let Err(e) = handle.peripheral.discover_services().await {
            if let Err(release) = handle.peripheral.disconnect().await {
                debug!("Disconnect after failed discovery: {}", release);
            }
            return Err(Error::ConnectionFailed {
                reason: format!("service discovery failed: {}", e),
            });
        }

        debug!(
            "Connected to {}, {} characteristic(s) discovered",
            address,
            handle.peripheral.characteristics().len()
        );
        Ok(handle)
    }

    async fn subscribe(
        &self,
        handle: &BtleplugHandle,
        characteristic: &Uuid,
        sink: FrameSink,
    ) -> Result<()> {
        if !is_oximeter_characteristic(characteristic) {
            debug!("Subscribing to non-standard characteristic {}", characteristic);
        }
        let target = Self::characteristic(handle, characteristic)?;

        // Open the stream first so no frame is missed between subscribe and listen.
        let mut notifications = handle.peripheral.notifications().await?;

        handle
            .peripheral
            .subscribe(&target)
            .await
            .map_err(|e| Error::SubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: e.to_string(),
            })?;

        let uuid = *characteristic;
        handle.track(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                trace!(
                    "Notification from {}: {:02X?}",
                    notification.uuid,
                    notification.value
                );
                sink(notification.value.as_slice());
            }
            debug!("Notification stream for {} ended", uuid);
        }));

        Ok(())
    }

    async fn unsubscribe(&self, handle: &BtleplugHandle, characteristic: &Uuid) -> Result<()> {
        let target = Self::characteristic(handle, characteristic)?;

        handle
            .peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| Error::UnsubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self, handle: &BtleplugHandle) -> Result<()> {
        handle.abort_tasks();

        handle
            .peripheral
            .disconnect()
            .await
            .map_err(|e| Error::ReleaseFailed {
                reason: e.to_string(),
            })
    }

    async fn watch_link_loss(&self, handle: &BtleplugHandle, sink: LinkLossSink) -> Result<()> {
        let opened = handle.events.lock().take();
        let events = match opened {
            Some(events) => events,
            None => self.adapter.events().await?,
        };
        let id = handle.peripheral.id();

        handle.track(tokio::spawn(forward_link_loss(
            events,
            move |event: &CentralEvent| {
                matches!(event, CentralEvent::DeviceDisconnected(lost) if *lost == id)
            },
            sink,
        )));

        Ok(())
    }
}

/// Report the first event matching `is_loss` to `sink`.
///
/// The end of the stream counts as a loss too.
async fn forward_link_loss<S, F>(mut events: S, is_loss: F, sink: LinkLossSink)
where
    S: Stream + Unpin,
    F: Fn(&S::Item) -> bool,
{
    while let Some(event) = events.next().await {
        if is_loss(&event) {
            sink(Some("peripheral disconnected".to_string()));
            return;
        }
    }
    sink(Some("adapter event stream ended".to_string()));
}
