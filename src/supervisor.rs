//! Reconnection supervision.
//!
//! [`ReconnectSupervisor`] turns unsolicited link losses into a single
//! recovery loop that calls [`ConnectionManager::connect`] until it succeeds,
//! the policy gives up, or the supervisor is cancelled.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ble::connection::ConnectionManager;
use crate::ble::link::{BleLink, LinkLossSink};
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};

/// Progress of a recovery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// A recovery loop was started.
    Started {
        /// Reason reported with the link loss.
        reason: Option<String>,
    },
    /// A connection attempt failed and another will follow.
    AttemptFailed {
        /// 1-based attempt number.
        attempt: u32,
        /// The connection error.
        error: String,
        /// Wait before the next attempt.
        retry_in: Duration,
    },
    /// The link is back.
    Reconnected {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The policy's attempt ceiling was reached.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
    /// The loop was cancelled by shutdown.
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

struct ActiveRecovery {
    id: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Drives the connection back to `Connected` after a link loss.
///
/// At most one recovery loop runs at a time no matter how many losses are
/// reported.
pub struct ReconnectSupervisor<L: BleLink> {
    connection: Arc<ConnectionManager<L>>,
    policy: ReconnectPolicy,
    runtime: tokio::runtime::Handle,
    shutdown: CancellationToken,
    active: Mutex<Option<ActiveRecovery>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<RecoveryEvent>,
}

impl<L: BleLink> ReconnectSupervisor<L> {
    /// Create a supervisor for `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeUnavailable`] when called outside a tokio
    /// runtime, or an invalid-parameter error for a bad policy.
    pub fn new(
        connection: Arc<ConnectionManager<L>>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        policy.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            connection,
            policy,
            runtime,
            shutdown: CancellationToken::new(),
            active: Mutex::new(None),
            next_id: AtomicU64::new(0),
            event_tx,
        }))
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Whether a recovery loop is currently active.
    pub fn is_recovering(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Subscribe to recovery progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.event_tx.subscribe()
    }

    /// A link-loss callback that forwards to [`Self::on_link_lost`].
    pub fn link_loss_listener(self: &Arc<Self>) -> LinkLossSink {
        let supervisor = Arc::downgrade(self);
        Arc::new(move |reason: Option<String>| {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_link_lost(reason);
            }
        })
    }

    /// Start a recovery loop unless one is already active.
    ///
    /// Returns `true` if a new loop was started. Never blocks; the loop runs
    /// on the runtime the supervisor was created in.
    pub fn on_link_lost(self: &Arc<Self>, reason: Option<String>) -> bool {
        let mut active = self.active.lock();

        if self.shutdown.is_cancelled() {
            debug!("Supervisor is shut down, ignoring link loss");
            return false;
        }

        if active.is_some() {
            debug!("Recovery already in progress, ignoring link loss");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();

        info!(
            "Link to {} lost ({}), starting recovery",
            self.connection.address(),
            reason.as_deref().unwrap_or("unknown reason")
        );
        let _ = self.event_tx.send(RecoveryEvent::Started { reason });

        let task = self.runtime.spawn(self.clone().recover(id, token.clone()));
        *active = Some(ActiveRecovery {
            id,
            token,
            task: Some(task),
        });

        true
    }

    /// Cancel any active recovery loop and refuse new ones.
    ///
    /// Waits for the loop to finish so no further `connect()` calls follow.
    pub async fn cancel(&self) {
        self.shutdown.cancel();

        let active = self.active.lock().take();
        let Some(mut active) = active else {
            return;
        };

        debug!("Cancelling recovery loop {}", active.id);
        active.token.cancel();

        if let Some(task) = active.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Recovery loop panicked: {}", e);
                }
            }
        }
    }

    /// Stop recovery without waiting for the loop to finish.
    ///
    /// For synchronous contexts such as `Drop`; prefer [`Self::cancel`].
    pub fn abort(&self) {
        self.shutdown.cancel();
        if let Some(active) = self.active.lock().as_ref() {
            active.token.cancel();
        }
    }

    async fn recover(self: Arc<Self>, id: u64, token: CancellationToken) {
        let mut attempts = 0u32;
        let mut failures = 0u32;

        let outcome = loop {
            if token.is_cancelled() {
                break RecoveryEvent::Cancelled { attempts };
            }

            attempts += 1;
            debug!("Reconnection attempt {}", attempts);

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break RecoveryEvent::Cancelled { attempts },
                result = self.connection.connect() => result,
            };

            match result {
                Ok(()) => {
                    let mut active = self.active.lock();
                    if self.connection.is_connected() {
                        Self::clear(&mut active, id);
                        drop(active);

                        info!(
                            "Reconnected to {} after {} attempt(s)",
                            self.connection.address(),
                            attempts
                        );
                        let _ = self.event_tx.send(RecoveryEvent::Reconnected { attempts });
                        return;
                    }

                    debug!("Link dropped again right after reconnecting, retrying");
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;

                    if !self.policy.allows_attempt(attempts + 1) {
                        warn!("Reconnection attempt {} failed: {}", attempts, e);
                        break RecoveryEvent::GaveUp { attempts };
                    }

                    let retry_in = self.policy.next_delay(failures);
                    warn!(
                        "Reconnection attempt {} failed: {}, retrying in {:?}",
                        attempts, e, retry_in
                    );
                    let _ = self.event_tx.send(RecoveryEvent::AttemptFailed {
                        attempt: attempts,
                        error: e.to_string(),
                        retry_in,
                    });

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break RecoveryEvent::Cancelled { attempts },
                        _ = tokio::time::sleep(retry_in) => {}
                    }
                }
            }
        };

        Self::clear(&mut self.active.lock(), id);

        match &outcome {
            RecoveryEvent::GaveUp { attempts } => {
                error!(
                    "Giving up on {} after {} attempt(s)",
                    self.connection.address(),
                    attempts
                );
            }
            _ => debug!("Recovery loop {} cancelled after {} attempt(s)", id, attempts),
        }
        let _ = self.event_tx.send(outcome);
    }

    fn clear(active: &mut Option<ActiveRecovery>, id: u64) {
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ConnectionState;
    use crate::ble::fake::FakeLink;
    use crate::ble::uuids::OXIMETER_DATA_CHARACTERISTIC_UUID;
    use pretty_assertions::assert_eq;

    struct Harness {
        link: Arc<FakeLink>,
        connection: Arc<ConnectionManager<FakeLink>>,
        supervisor: Arc<ReconnectSupervisor<FakeLink>>,
    }

    fn harness(policy: ReconnectPolicy) -> Harness {
        let link = FakeLink::new();
        let connection = Arc::new(ConnectionManager::new(
            link.clone(),
            "C4:39:30:38:17:25",
            OXIMETER_DATA_CHARACTERISTIC_UUID,
            Arc::new(|_: &[u8]| {}),
        ));
        let supervisor = ReconnectSupervisor::new(connection.clone(), policy).unwrap();
        connection.set_link_loss_listener(supervisor.link_loss_listener());

        Harness {
            link,
            connection,
            supervisor,
        }
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<RecoveryEvent>) -> RecoveryEvent {
        loop {
            match rx.recv().await.unwrap() {
                RecoveryEvent::Started { .. } | RecoveryEvent::AttemptFailed { .. } => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_link_losses_start_one_loop() {
        let h = harness(ReconnectPolicy::default());
        h.link.fail_next_connects(u32::MAX);
        let mut rx = h.supervisor.subscribe();

        assert!(h.supervisor.on_link_lost(None));
        assert!(!h.supervisor.on_link_lost(Some("second report".to_string())));
        assert!(h.supervisor.is_recovering());

        tokio::time::sleep(Duration::from_secs(12)).await;

        let mut started = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RecoveryEvent::Started { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        // One loop at a 5s cadence: attempts at t=0, 5 and 10.
        assert_eq!(h.link.connect_calls(), 3);

        h.supervisor.cancel().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_link_losses_from_many_tasks_start_one_loop() {
        let h = harness(ReconnectPolicy::default());
        h.link.fail_next_connects(u32::MAX);
        let mut rx = h.supervisor.subscribe();

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let reporters: Vec<_> = (0..8)
            .map(|i| {
                let supervisor = h.supervisor.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    supervisor.on_link_lost(Some(format!("report {}", i)))
                })
            })
            .collect();

        let mut started_loops = 0;
        for reporter in reporters {
            if reporter.await.unwrap() {
                started_loops += 1;
            }
        }
        assert_eq!(started_loops, 1);
        assert!(h.supervisor.is_recovering());

        h.supervisor.cancel().await;

        let mut started = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RecoveryEvent::Started { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failures_with_fixed_delay() {
        let h = harness(ReconnectPolicy::default());
        h.connection.connect().await.unwrap();
        h.link.fail_next_connects(3);
        let mut rx = h.supervisor.subscribe();

        assert!(h.link.drop_link(Some("supervision timeout")));

        assert_eq!(
            rx.recv().await.unwrap(),
            RecoveryEvent::Started {
                reason: Some("supervision timeout".to_string())
            }
        );
        let mut failed = 0;
        let outcome = loop {
            match rx.recv().await.unwrap() {
                RecoveryEvent::AttemptFailed { retry_in, .. } => {
                    assert_eq!(retry_in, Duration::from_secs(5));
                    failed += 1;
                }
                other => break other,
            }
        };

        assert_eq!(failed, 3);
        assert_eq!(outcome, RecoveryEvent::Reconnected { attempts: 4 });
        assert_eq!(h.connection.state(), ConnectionState::Connected);
        assert!(!h.supervisor.is_recovering());

        // Initial connect plus four recovery attempts, 5s apart.
        let times = h.link.connect_times();
        assert_eq!(times.len(), 5);
        for pair in times[1..].windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_loss_after_recovery_starts_new_loop() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_secs(1)));
        h.connection.connect().await.unwrap();
        let mut rx = h.supervisor.subscribe();

        h.link.drop_link(None);
        assert_eq!(next_terminal(&mut rx).await, RecoveryEvent::Reconnected { attempts: 1 });

        h.link.drop_link(None);
        assert_eq!(next_terminal(&mut rx).await, RecoveryEvent::Reconnected { attempts: 1 });
        assert!(h.connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_stops_attempts() {
        let h = harness(ReconnectPolicy::default());
        h.connection.connect().await.unwrap();
        h.link.fail_next_connects(u32::MAX);
        let mut rx = h.supervisor.subscribe();

        h.link.drop_link(None);
        loop {
            if let RecoveryEvent::AttemptFailed { .. } = rx.recv().await.unwrap() {
                break;
            }
        }

        h.supervisor.cancel().await;
        let calls = h.link.connect_calls();

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.link.connect_calls(), calls);
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
        assert!(!h.supervisor.is_recovering());
        assert_eq!(next_terminal(&mut rx).await, RecoveryEvent::Cancelled { attempts: 1 });
        assert!(!h.supervisor.on_link_lost(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pending_attempt() {
        let h = harness(ReconnectPolicy::default());
        h.link.set_connect_delay(Duration::from_secs(30));
        let mut rx = h.supervisor.subscribe();

        h.supervisor.on_link_lost(None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.supervisor.cancel().await;

        assert_eq!(next_terminal(&mut rx).await, RecoveryEvent::Cancelled { attempts: 1 });
        assert_eq!(h.link.connect_calls(), 1);
        assert_eq!(h.link.live_handles(), 0);
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_attempt_ceiling() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_secs(1)).with_max_attempts(2));
        h.connection.connect().await.unwrap();
        h.link.fail_next_connects(u32::MAX);
        let mut rx = h.supervisor.subscribe();

        h.link.drop_link(None);

        assert_eq!(next_terminal(&mut rx).await, RecoveryEvent::GaveUp { attempts: 2 });
        assert_eq!(h.link.connect_calls(), 3);
        assert!(!h.supervisor.is_recovering());
    }

    #[test]
    fn test_requires_runtime() {
        let link = FakeLink::new();
        let connection = Arc::new(ConnectionManager::new(
            link,
            "C4:39:30:38:17:25",
            OXIMETER_DATA_CHARACTERISTIC_UUID,
            Arc::new(|_: &[u8]| {}),
        ));

        let result = ReconnectSupervisor::new(connection, ReconnectPolicy::default());
        assert!(matches!(result, Err(Error::RuntimeUnavailable)));
    }
}
