//! Service registration and heartbeat
//!
//! Advertises one [`InstanceDescriptor`] as an ephemeral node at
//! `{basePath}/{serviceName}/{host}:{port}` and keeps its payload fresh,
//! both on a fixed interval and whenever the owner reports a health change.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::{DiscoveryEvent, EventBus};
use crate::instance::{InstanceDescriptor, InstanceSnapshot};
use crate::store::{path, CreateMode, Transaction};

/// Default interval between advertisement refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(5000);

/// Registration of one service instance
pub struct ServiceRegistration {
    connection: Arc<ConnectionManager>,
    base_path: String,
    descriptor: Arc<InstanceDescriptor>,
    refresh_interval: Duration,
    /// Last snapshot written to the store
    last_snapshot: Arc<RwLock<Option<InstanceSnapshot>>>,
    events: EventBus,
    heartbeat: Mutex<Option<Heartbeat>>,
}

struct Heartbeat {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn stop(self) {
        self.cancel_token.cancel();
        self.handle.abort();
    }
}

impl ServiceRegistration {
    /// Create a new registration; nothing is written until [`register`](Self::register)
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        base_path: &str,
        descriptor: InstanceDescriptor,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            connection,
            base_path: path::normalize_base_path(base_path),
            descriptor: Arc::new(descriptor),
            refresh_interval,
            last_snapshot: Arc::new(RwLock::new(None)),
            events: EventBus::default(),
            heartbeat: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Path of this instance's advertisement node
    #[must_use]
    pub fn node_path(&self) -> String {
        path::instance_path(
            &self.base_path,
            self.descriptor.service_name(),
            self.descriptor.host(),
            self.descriptor.port(),
        )
    }

    /// Last snapshot written to the store, if any
    #[must_use]
    pub fn data(&self) -> Option<InstanceSnapshot> {
        self.last_snapshot.read().clone()
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    /// Subscribe to `HealthCheckChanged` notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Create the advertisement node and start the heartbeat
    ///
    /// Ensures `{basePath}/{serviceName}` exists, then creates the ephemeral
    /// node with the current snapshot in a single transaction. Failures are
    /// returned to the caller and not retried. Returns the created path.
    pub async fn register(&self) -> Result<String> {
        if self.refresh_interval.is_zero() {
            return Err(Error::Configuration(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        let store = self.connection.store()?;
        let service_path = path::service_path(&self.base_path, self.descriptor.service_name());
        store.create_path_recursive(&service_path).await?;

        let snapshot = self.descriptor.snapshot();
        let payload = snapshot.to_payload()?;
        let node_path = self.node_path();

        let results = store
            .commit(Transaction::new().create(node_path.clone(), payload, CreateMode::Ephemeral))
            .await?;
        let created = results
            .first()
            .map_or_else(|| node_path.clone(), |r| r.path().to_string());

        record_snapshot(&self.last_snapshot, snapshot.clone());
        self.start_heartbeat(created.clone());

        info!(
            path = %created,
            health = %snapshot.healthcheck_status,
            "Registered service instance"
        );
        Ok(created)
    }

    /// Rewrite the advertisement payload with a fresh snapshot
    ///
    /// Never recreates the node; fails if it no longer exists.
    pub async fn refresh(&self) -> Result<()> {
        push_snapshot(
            &self.connection,
            &self.descriptor,
            &self.node_path(),
            &self.last_snapshot,
        )
        .await
    }

    /// Ask the heartbeat to refresh now because external health changed
    pub fn notify_health_changed(&self) {
        self.events.publish(DiscoveryEvent::HealthCheckChanged);
    }

    /// Remove an advertisement node transactionally
    ///
    /// Removing this instance's own node also stops its heartbeat, once the
    /// removal has committed.
    pub async fn unregister(&self, node_path: &str) -> Result<()> {
        let store = self.connection.store()?;
        store.commit(Transaction::new().remove(node_path)).await?;
        if node_path == self.node_path() {
            self.stop_heartbeat();
        }
        info!(path = %node_path, "Unregistered service instance");
        Ok(())
    }

    /// Child node names advertised under `service_name`
    pub async fn instances(&self, service_name: &str) -> Result<Vec<String>> {
        let store = self.connection.store()?;
        let service_path = path::service_path(&self.base_path, service_name);
        Ok(store.list_children(&service_path, None).await?)
    }

    /// Stop refreshing; the node itself lives until unregister or session end
    pub fn shutdown(&self) {
        self.stop_heartbeat();
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
            debug!(path = %self.node_path(), "Heartbeat stopped");
        }
    }

    fn start_heartbeat(&self, node_path: String) {
        let connection = self.connection.clone();
        let descriptor = self.descriptor.clone();
        let last_snapshot = self.last_snapshot.clone();
        let cancel_token = CancellationToken::new();
        let cancel = cancel_token.clone();
        let mut health_events = self.events.subscribe();

        let period = self.refresh_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            loop {
                let trigger = tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = timer.tick() => "timer",
                    event = health_events.recv() => match event {
                        Ok(DiscoveryEvent::HealthCheckChanged) => "health_check_changed",
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Coalesced health change notifications");
                            "health_check_changed"
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };

                // Refresh failures never stop the heartbeat; a reconnected
                // session resumes on the next trigger.
                let pushed =
                    push_snapshot(&connection, &descriptor, &node_path, &last_snapshot).await;
                match pushed {
                    Ok(()) => {
                        debug!(path = %node_path, trigger, "Refreshed service instance data");
                    }
                    Err(e) if e.is_recoverable() => warn!(
                        path = %node_path,
                        trigger,
                        error = %e,
                        "Failed to refresh service instance data"
                    ),
                    Err(e) => error!(
                        path = %node_path,
                        trigger,
                        error = %e,
                        "Failed to refresh service instance data"
                    ),
                }
            }
        });

        let previous = self.heartbeat.lock().replace(Heartbeat {
            cancel_token,
            handle,
        });
        if let Some(previous) = previous {
            previous.stop();
        }
    }
}

impl Drop for ServiceRegistration {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.stop();
        }
    }
}

/// Recompute the snapshot and set it on the existing node
async fn push_snapshot(
    connection: &ConnectionManager,
    descriptor: &InstanceDescriptor,
    node_path: &str,
    last_snapshot: &RwLock<Option<InstanceSnapshot>>,
) -> Result<()> {
    let store = connection.store()?;
    let snapshot = descriptor.snapshot();
    let payload = snapshot.to_payload()?;

    store
        .commit(Transaction::new().set_data(node_path, payload))
        .await?;

    record_snapshot(last_snapshot, snapshot);
    Ok(())
}

/// Keep the newest snapshot when concurrent refreshes finish out of order
fn record_snapshot(last_snapshot: &RwLock<Option<InstanceSnapshot>>, snapshot: InstanceSnapshot) {
    let mut last = last_snapshot.write();
    let newer = last
        .as_ref()
        .map_or(true, |previous| previous.last_updated <= snapshot.last_updated);
    if newer {
        *last = Some(snapshot);
    }
}
