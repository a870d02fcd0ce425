//! Coordination store connection manager
//!
//! Owns a single store session, exposes a guarded accessor that fails fast
//! while disconnected, and drives automatic reconnection until the user
//! closes it.
//!
//! State machine:
//!
//! ```text
//! Disconnected -start-> Connecting -handshake-> Connected
//! Connected -session lost-> Connecting (auto restart)
//! Connecting | Connected -close-> Closing -> Closed
//! ```

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{DiscoveryEvent, EventBus};
use crate::store::{ConnectionSettings, CoordinationStore, Session, SessionEvent, StoreConnector};

/// Upper bound for the delay between handshake attempts
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Lifecycle state of the store session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    const fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

struct SessionSlot {
    state: SessionState,
    store: Option<Arc<dyn CoordinationStore>>,
}

/// Connection manager shared by registrations and resolvers
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn StoreConnector>,
    slot: RwLock<SessionSlot>,
    /// Last event published, so network-level repeats are not re-announced
    last_event: Mutex<Option<DiscoveryEvent>>,
    events: EventBus,
    cancel_token: CancellationToken,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new connection manager; nothing connects until [`start`](Self::start)
    #[must_use]
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            settings,
            connector,
            slot: RwLock::new(SessionSlot {
                state: SessionState::Disconnected,
                store: None,
            }),
            last_event: Mutex::new(None),
            events: EventBus::default(),
            cancel_token: CancellationToken::new(),
            session_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Subscribe to `Connected` / `Disconnected` events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.slot.read().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot.read().state == SessionState::Connected
    }

    /// Live store handle, or `Error::Connection` when not connected
    pub fn store(&self) -> Result<Arc<dyn CoordinationStore>> {
        let slot = self.slot.read();
        match (&slot.state, &slot.store) {
            (SessionState::Connected, Some(store)) => Ok(store.clone()),
            _ => Err(Error::Connection("Connection Not Established".to_string())),
        }
    }

    /// Open the session in the background
    ///
    /// Returns immediately; a `Connected` event follows once the handshake
    /// completes. Handshake failures are retried until [`close`](Self::close).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut task = self.session_task.lock();
        if self.slot.read().state.is_closed() {
            return Err(Error::Connection("Connection manager is closed".to_string()));
        }
        if task.is_some() {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run_session_loop().await }));

        info!(
            connection_string = %self.settings.connection_string,
            "Connecting to coordination store"
        );
        Ok(())
    }

    /// Wait until the session is connected, or fail after `timeout`
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut events = self.subscribe();
        if self.is_connected() {
            return Ok(());
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(DiscoveryEvent::Connected) => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected() {
                            return Ok(());
                        }
                        if self.state().is_closed() {
                            return Err(Error::Connection(
                                "Connection manager is closed".to_string(),
                            ));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Connection("Event channel closed".to_string()));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Connection(format!("Not connected after {timeout:?}")))?
    }

    /// Close the session for good
    ///
    /// Publishes `Disconnected` unless it was already the last event, and
    /// never reconnects afterwards.
    pub async fn close(&self) {
        let store = {
            let mut slot = self.slot.write();
            if slot.state.is_closed() {
                return;
            }
            slot.state = SessionState::Closing;
            slot.store.take()
        };

        self.cancel_token.cancel();
        if let Some(store) = store {
            store.close().await;
        }

        let task = self.session_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Session task ended abnormally");
            }
        }

        self.set_state(SessionState::Closed);
        self.announce(DiscoveryEvent::Disconnected);
        info!("Successfully closed coordination store connection");
    }

    fn set_state(&self, state: SessionState) {
        let mut slot = self.slot.write();
        if slot.state.is_closed() && !state.is_closed() {
            return;
        }
        debug!(from = ?slot.state, to = ?state, "Session state transition");
        slot.state = state;
    }

    /// Publish a lifecycle event unless it repeats the previous one
    fn announce(&self, event: DiscoveryEvent) {
        {
            let mut last = self.last_event.lock();
            if *last == Some(event) {
                return;
            }
            *last = Some(event);
        }
        self.events.publish(event);
    }

    async fn run_session_loop(self: Arc<Self>) {
        loop {
            self.set_state(SessionState::Connecting);

            let session = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                session = self.connect_with_retry() => session,
            };
            let Session { store, mut events } = session;

            let installed = {
                let mut slot = self.slot.write();
                if slot.state.is_closed() {
                    false
                } else {
                    slot.state = SessionState::Connected;
                    slot.store = Some(store.clone());
                    true
                }
            };
            if !installed {
                store.close().await;
                return;
            }
            self.announce(DiscoveryEvent::Connected);
            info!(session_id = store.session_id(), "Coordination store connected");

            let reason = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                event = events.recv() => event,
            };

            {
                let mut slot = self.slot.write();
                if slot.state.is_closed() {
                    return;
                }
                slot.state = SessionState::Disconnected;
                slot.store = None;
            }
            self.announce(DiscoveryEvent::Disconnected);
            warn!(
                session_id = store.session_id(),
                reason = ?reason.unwrap_or(SessionEvent::Disconnected),
                "Coordination store disconnected, restarting session"
            );
            store.close().await;
        }
    }

    /// Handshake until it succeeds
    ///
    /// Each round retries `retry_count` times with exponential backoff
    /// starting at `retry_wait`; exhausted rounds start over.
    async fn connect_with_retry(&self) -> Session {
        let mut attempt: u64 = 0;
        loop {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(self.settings.retry_wait)
                .with_max_delay(MAX_RETRY_WAIT.max(self.settings.retry_wait))
                .with_max_times(self.settings.retry_count)
                .with_jitter()
                .build();

            for delay in std::iter::once(Duration::ZERO).chain(backoff) {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;

                let handshake = tokio::time::timeout(
                    self.settings.connect_timeout,
                    self.connector.connect(&self.settings),
                )
                .await;

                match handshake {
                    Ok(Ok(session)) => return session,
                    Ok(Err(e)) => {
                        warn!(attempt, error = %e, "Coordination store handshake failed");
                    }
                    Err(_) => {
                        warn!(
                            attempt,
                            timeout = ?self.settings.connect_timeout,
                            "Coordination store handshake timed out"
                        );
                    }
                }
            }

            // Discovery favours availability: keep trying after a full round
            tokio::time::sleep(self.settings.retry_wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEnsemble;

    fn manager(ensemble: &MemoryEnsemble) -> Arc<ConnectionManager> {
        let settings = ConnectionSettings::new("memory")
            .with_retry(2, Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(100));
        Arc::new(ConnectionManager::new(settings, Arc::new(ensemble.connector())))
    }

    #[tokio::test]
    async fn test_store_fails_fast_when_not_connected() {
        let ensemble = MemoryEnsemble::new();
        let manager = manager(&ensemble);

        assert!(!manager.is_connected());
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(manager.store(), Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_start_emits_connected() {
        let ensemble = MemoryEnsemble::new();
        let manager = manager(&ensemble);
        let mut events = manager.subscribe();

        manager.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);
        assert!(manager.is_connected());
        assert!(manager.store().is_ok());
        assert_eq!(ensemble.session_count(), 1);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_emits_disconnected_once() {
        let ensemble = MemoryEnsemble::new();
        let manager = manager(&ensemble);
        let mut events = manager.subscribe();

        manager.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);

        manager.close().await;
        manager.close().await;

        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(manager.state(), SessionState::Closed);
        assert!(manager.store().is_err());
        assert_eq!(ensemble.session_count(), 0);
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_session_expiry() {
        let ensemble = MemoryEnsemble::new();
        let manager = manager(&ensemble);
        let mut events = manager.subscribe();

        manager.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);
        let first = manager.store().unwrap().session_id();

        ensemble.expire_session(first);

        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);
        let second = manager.store().unwrap().session_id();
        assert_ne!(first, second);

        manager.close().await;
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_drop_announced_once() {
        let ensemble = MemoryEnsemble::new();
        let manager = manager(&ensemble);
        let mut events = manager.subscribe();

        manager.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);
        let first = manager.store().unwrap().session_id();
        assert_eq!(ensemble.session_ids(), vec![first]);

        // The transport reports the same drop twice
        ensemble.disconnect_session(first);
        ensemble.disconnect_session(first);

        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        let second = manager.store().unwrap().session_id();
        assert_ne!(first, second);
        assert_eq!(ensemble.session_ids(), vec![second]);

        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_retrying_while_store_unavailable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let manager = manager(&ensemble);

        manager.start().unwrap();
        // Well past one full retry round
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.state(), SessionState::Connecting);

        ensemble.set_available(true);
        manager
            .wait_until_connected(Duration::from_secs(60))
            .await
            .unwrap();
        assert!(manager.is_connected());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let manager = manager(&ensemble);
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.close().await;

        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Disconnected);
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(ensemble.session_count(), 0);
    }
}
