//! In-memory transport for unit tests.
//!
//! Records every call and lets tests push frames and link losses from the
//! "peripheral" side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::link::{BleLink, FrameSink, LinkLossSink};
use crate::error::{Error, Result};

#[derive(Default)]
struct FakeState {
    connect_failures: u32,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    unsubscribe_delay: Option<Duration>,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    connect_times: Vec<Instant>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    disconnect_calls: usize,
    live_handles: usize,
    next_id: u64,
    frame_sink: Option<FrameSink>,
    link_loss_sink: Option<LinkLossSink>,
}

pub(crate) struct FakeHandle {
    #[allow(dead_code)]
    pub id: u64,
}

#[derive(Default)]
pub(crate) struct FakeLink {
    state: Mutex<FakeState>,
}

impl FakeLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.state.lock().subscribe_delay = Some(delay);
    }

    pub fn set_unsubscribe_delay(&self, delay: Duration) {
        self.state.lock().unsubscribe_delay = Some(delay);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state.lock().fail_unsubscribe = fail;
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.state.lock().unsubscribe_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles
    }

    pub fn link_loss_sink(&self) -> Option<LinkLossSink> {
        self.state.lock().link_loss_sink.clone()
    }

    /// Push a notification frame. Returns false if nothing is subscribed.
    pub fn emit_frame(&self, data: &[u8]) -> bool {
        let sink = self.state.lock().frame_sink.clone();
        match sink {
            Some(sink) => {
                sink(data);
                true
            }
            None => false,
        }
    }

    /// Drop the link from the peripheral side. Returns false if no link is watched.
    ///
    /// The handle stays live until the owner calls `disconnect` on it.
    pub fn drop_link(&self, reason: Option<&str>) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.frame_sink = None;
            state.link_loss_sink.take()
        };
        match sink {
            Some(sink) => {
                sink(reason.map(str::to_string));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BleLink for FakeLink {
    type Handle = FakeHandle;

    async fn connect(&self, address: &str) -> Result<FakeHandle> {
        let delay = {
            let mut state = self.state.lock();
            state.connect_times.push(Instant::now());
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(Error::PeripheralNotFound {
                address: address.to_string(),
            });
        }

        state.next_id += 1;
        state.live_handles += 1;
        Ok(FakeHandle { id: state.next_id })
    }

    async fn subscribe(
        &self,
        _handle: &FakeHandle,
        characteristic: &Uuid,
        sink: FrameSink,
    ) -> Result<()> {
        let delay = self.state.lock().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if state.fail_subscribe {
            return Err(Error::SubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: "refused by peripheral".to_string(),
            });
        }
        state.frame_sink = Some(sink);
        Ok(())
    }

    async fn unsubscribe(&self, _handle: &FakeHandle, characteristic: &Uuid) -> Result<()> {
        let delay = self.state.lock().unsubscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.unsubscribe_calls += 1;
        state.frame_sink = None;
        if state.fail_unsubscribe {
            return Err(Error::UnsubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: "peripheral did not answer".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, _handle: &FakeHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.live_handles = state.live_handles.saturating_sub(1);
        state.frame_sink = None;
        state.link_loss_sink = None;
        Ok(())
    }

    async fn watch_link_loss(&self, _handle: &FakeHandle, sink: LinkLossSink) -> Result<()> {
        self.state.lock().link_loss_sink = Some(sink);
        Ok(())
    }
}
