//! Instance provider (consumer-side resolver)
//!
//! Resolves a service name to live, healthy endpoints. A fetch cycle runs
//! three stages against the store and only swaps the resolution cache when
//! all of them succeed:
//!
//! 1. list the children of `{basePath}/{serviceName}` (optionally arming a watch)
//! 2. fetch and parse every child; per-child read failures are dropped
//! 3. keep healthy snapshots and replace the cache
//!
//! Cycles are triggered by `init`, by children-changed watch events, by
//! session reconnects and by a periodic fallback timer.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResolutionCache;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::DiscoveryEvent;
use crate::instance::InstanceSnapshot;
use crate::registration::DEFAULT_REFRESH_INTERVAL;
use crate::selection::{ResolvedInstance, SelectionStrategy, Selector};
use crate::store::{path, CoordinationStore, WatchEventKind, WatchedEvent, Watcher};

/// Consumer-side options for one provider
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub strategy: SelectionStrategy,
    /// Use `https` when building service URLs
    pub secure: bool,
    /// Interval of the fallback refresh timer
    pub refresh_interval: Duration,
    /// Drop snapshots older than this; disabled when `None`
    pub stale_node_threshold: Option<Duration>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            secure: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            stale_node_threshold: None,
        }
    }
}

/// Immutable inputs shared by the stages of one fetch cycle
struct FetchContext<'a> {
    store: Arc<dyn CoordinationStore>,
    service_path: &'a str,
}

/// Outcome of the per-child fetch stage
#[derive(Debug, Default)]
struct NodeBatch {
    snapshots: Vec<InstanceSnapshot>,
    failed: Vec<String>,
}

/// The fetch-and-cache pipeline, cheap to clone into background tasks
#[derive(Clone)]
struct FetchPipeline {
    connection: Arc<ConnectionManager>,
    service_name: String,
    service_path: String,
    cache: Arc<ResolutionCache>,
    stale_node_threshold: Option<Duration>,
    watch_tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl FetchPipeline {
    /// Run one cycle, returning the number of cached instances on success
    async fn run(&self, watched: bool) -> Result<usize> {
        let ctx = FetchContext {
            store: self.connection.store()?,
            service_path: &self.service_path,
        };

        let children = self.list_nodes(&ctx, watched).await?;
        let batch = self.fetch_node_data(&ctx, &children).await?;
        self.save_node_data(batch)
    }

    async fn list_nodes(&self, ctx: &FetchContext<'_>, watched: bool) -> Result<Vec<String>> {
        let watcher = watched.then(|| Watcher::new(self.watch_tx.clone()));
        let children = ctx.store.list_children(ctx.service_path, watcher).await?;

        if children.is_empty() {
            return Err(Error::NotFound(format!("no node data found for: {}", ctx.service_path)));
        }
        Ok(children)
    }

    async fn fetch_node_data(
        &self,
        ctx: &FetchContext<'_>,
        children: &[String],
    ) -> Result<NodeBatch> {
        let reads = children.iter().map(|child| {
            let node_path = path::join(ctx.service_path, child);
            let store = ctx.store.clone();
            async move {
                let data = store.get_data(&node_path).await;
                (node_path, data)
            }
        });

        let mut batch = NodeBatch::default();
        for (node_path, data) in join_all(reads).await {
            match data {
                Ok(payload) => {
                    let snapshot = InstanceSnapshot::from_payload(&payload).map_err(|e| {
                        Error::Serialization(format!("invalid node data at {node_path}: {e}"))
                    })?;
                    batch.snapshots.push(snapshot);
                }
                Err(e) => {
                    warn!(
                        service = %self.service_name,
                        path = %node_path,
                        error = %e,
                        "Error while getting node data"
                    );
                    batch.failed.push(node_path);
                }
            }
        }
        Ok(batch)
    }

    fn save_node_data(&self, batch: NodeBatch) -> Result<usize> {
        if batch.snapshots.is_empty() {
            return Err(Error::NotFound(format!("no node data found for: {}", self.service_path)));
        }

        let fetched = batch.snapshots.len();
        let healthy: Vec<InstanceSnapshot> = batch
            .snapshots
            .into_iter()
            .filter(|snapshot| {
                if !snapshot.is_healthy() {
                    info!(
                        service = %self.service_name,
                        instance = %snapshot.address(),
                        "Node removed due to health check"
                    );
                    return false;
                }
                if let Some(threshold) = self.stale_node_threshold {
                    if snapshot.is_stale(threshold) {
                        info!(
                            service = %self.service_name,
                            instance = %snapshot.address(),
                            last_updated = %snapshot.last_updated,
                            "Node removed as stale"
                        );
                        return false;
                    }
                }
                true
            })
            .collect();

        if healthy.is_empty() {
            return Err(Error::NotFound(format!(
                "no healthy instances for: {}",
                self.service_path
            )));
        }

        let count = healthy.len();
        self.cache.replace(healthy);
        debug!(
            service = %self.service_name,
            fetched,
            failed = batch.failed.len(),
            cached = count,
            "Resolution cache replaced"
        );
        Ok(count)
    }
}

/// Resolves one service name to cached, healthy instances
pub struct InstanceProvider {
    pipeline: FetchPipeline,
    selector: Selector,
    secure: bool,
    refresh_interval: Duration,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchedEvent>>>,
    cancel_token: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceProvider {
    /// Create a new provider; nothing is fetched until [`init`](Self::init)
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        base_path: &str,
        service_name: impl Into<String>,
        options: ProviderOptions,
    ) -> Self {
        let service_name = service_name.into();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();

        Self {
            pipeline: FetchPipeline {
                connection,
                service_path: path::service_path(base_path, &service_name),
                service_name,
                cache: Arc::new(ResolutionCache::new()),
                stale_node_threshold: options.stale_node_threshold,
                watch_tx,
            },
            selector: Selector::new(options.strategy),
            secure: options.secure,
            refresh_interval: options.refresh_interval,
            watch_rx: Mutex::new(Some(watch_rx)),
            cancel_token: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.pipeline.service_name
    }

    #[must_use]
    pub const fn strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    /// Initial watched fetch, then start the background refresh loop
    ///
    /// If the first fetch fails the provider stays unusable and `init` may
    /// be called again.
    pub async fn init(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(Error::Configuration(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        if let Err(e) = self.pipeline.run(true).await {
            error!(
                service = %self.pipeline.service_name,
                error = %e,
                "Error while getting services data from the store"
            );
            return Err(e);
        }
        info!(service = %self.pipeline.service_name, "Successfully fetched services data");

        let mut task = self.refresh_task.lock();
        if task.is_none() {
            if let Some(watch_rx) = self.watch_rx.lock().take() {
                *task = Some(self.spawn_refresh_loop(watch_rx));
            }
        }
        Ok(())
    }

    /// Run an unwatched fetch cycle now
    pub async fn refresh(&self) -> Result<usize> {
        self.pipeline.run(false).await
    }

    /// Pick an instance from the cache according to the strategy
    ///
    /// Never touches the store; fails with `EmptyCache` before the first
    /// successful fetch.
    pub fn get_instance(&self) -> Result<ResolvedInstance> {
        let instances = self.pipeline.cache.current();
        self.selector
            .select(&instances)
            .map(|instance| ResolvedInstance::new(instance.clone(), self.secure))
            .ok_or_else(|| {
                Error::EmptyCache(format!(
                    "no instances cached for: {}",
                    self.pipeline.service_name
                ))
            })
    }

    /// Every cached instance, in fetch order
    #[must_use]
    pub fn instances(&self) -> Arc<Vec<InstanceSnapshot>> {
        self.pipeline.cache.current()
    }

    /// Stop the background refresh loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
    }

    fn spawn_refresh_loop(
        &self,
        mut watch_rx: mpsc::UnboundedReceiver<WatchedEvent>,
    ) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let cancel = self.cancel_token.clone();
        let mut connection_events = pipeline.connection.subscribe();

        let period = self.refresh_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(
                            service = %pipeline.service_name,
                            "Provider refresh loop shutting down"
                        );
                        return;
                    }
                    _ = timer.tick() => {
                        report(&pipeline, "timer", pipeline.run(false).await);
                    }
                    event = watch_rx.recv() => {
                        let Some(event) = event else { return };
                        info!(
                            service = %pipeline.service_name,
                            kind = ?event.kind,
                            path = %event.path,
                            "Received watcher event"
                        );
                        // Only a children-set change re-fetches; data changes
                        // are left to the timer.
                        if event.kind == WatchEventKind::NodeChildrenChanged {
                            report(&pipeline, "watch", pipeline.run(true).await);
                        }
                    }
                    event = connection_events.recv() => match event {
                        // Watches do not survive a new session; arm a fresh one
                        Ok(DiscoveryEvent::Connected) => {
                            report(&pipeline, "reconnect", pipeline.run(true).await);
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }
}

impl Drop for InstanceProvider {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Background cycle failures are logged only; callers keep the last good cache
fn report(pipeline: &FetchPipeline, trigger: &'static str, result: Result<usize>) {
    match result {
        Ok(cached) => debug!(
            service = %pipeline.service_name,
            trigger,
            cached,
            "Refreshed services data"
        ),
        Err(e) if e.is_recoverable() => warn!(
            service = %pipeline.service_name,
            trigger,
            error = %e,
            "Services data refresh failed, serving last good cache"
        ),
        Err(e) => error!(
            service = %pipeline.service_name,
            trigger,
            error = %e,
            "Error while updating services data"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{HealthFlag, InstanceDescriptor};
    use crate::registration::ServiceRegistration;
    use crate::store::{ConnectionSettings, CreateMode, MemoryEnsemble, Transaction};

    async fn connected(ensemble: &MemoryEnsemble) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(
            ConnectionSettings::new("memory"),
            Arc::new(ensemble.connector()),
        ));
        manager.start().unwrap();
        manager
            .wait_until_connected(Duration::from_secs(5))
            .await
            .unwrap();
        manager
    }

    fn new_provider(
        connection: &Arc<ConnectionManager>,
        service_name: &str,
        strategy: SelectionStrategy,
    ) -> InstanceProvider {
        InstanceProvider::new(connection.clone(), "basePath", service_name, options(strategy))
    }

    fn options(strategy: SelectionStrategy) -> ProviderOptions {
        ProviderOptions {
            strategy,
            refresh_interval: Duration::from_secs(3600),
            ..ProviderOptions::default()
        }
    }

    #[tokio::test]
    async fn test_get_instance_before_init_is_empty_cache() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let provider = new_provider(&connection, "svc", SelectionStrategy::RoundRobin);

        assert!(matches!(provider.get_instance(), Err(Error::EmptyCache(_))));
    }

    #[tokio::test]
    async fn test_zero_refresh_interval_rejected() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let registration = ServiceRegistration::new(
            connection.clone(),
            "basePath",
            InstanceDescriptor::new("svc", "localhost", 8080),
            Duration::from_secs(3600),
        );
        registration.register().await.unwrap();

        let provider = InstanceProvider::new(
            connection,
            "basePath",
            "svc",
            ProviderOptions {
                refresh_interval: Duration::ZERO,
                ..ProviderOptions::default()
            },
        );

        assert!(matches!(provider.init().await, Err(Error::Configuration(_))));
        assert!(provider.instances().is_empty());
    }

    #[tokio::test]
    async fn test_init_fails_without_children() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        connection
            .store()
            .unwrap()
            .create_path_recursive("/basePath/svc")
            .await
            .unwrap();
        let provider = new_provider(&connection, "svc", SelectionStrategy::Random);

        assert!(matches!(provider.init().await, Err(Error::NotFound(_))));
        assert!(provider.instances().is_empty());
    }

    #[tokio::test]
    async fn test_init_fails_for_missing_service() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let provider = new_provider(&connection, "missing", SelectionStrategy::Random);

        assert!(matches!(provider.init().await, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_filtered() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;

        let healthy = ServiceRegistration::new(
            connection.clone(),
            "basePath",
            InstanceDescriptor::new("svc", "localhost", 8080),
            Duration::from_secs(3600),
        );
        let sick = ServiceRegistration::new(
            connection.clone(),
            "basePath",
            InstanceDescriptor::new("svc", "localhost", 8081)
                .with_health_check(Arc::new(HealthFlag::new(false))),
            Duration::from_secs(3600),
        );
        healthy.register().await.unwrap();
        sick.register().await.unwrap();

        let provider = new_provider(&connection, "svc", SelectionStrategy::RoundRobin);
        provider.init().await.unwrap();

        for _ in 0..10 {
            assert_eq!(provider.get_instance().unwrap().port(), 8080);
        }
    }

    #[tokio::test]
    async fn test_no_healthy_children_keeps_cache() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let health = Arc::new(HealthFlag::new(true));
        let registration = ServiceRegistration::new(
            connection.clone(),
            "basePath",
            InstanceDescriptor::new("svc", "localhost", 8080).with_health_check(health.clone()),
            Duration::from_secs(3600),
        );
        registration.register().await.unwrap();

        let provider = new_provider(&connection, "svc", SelectionStrategy::RoundRobin);
        provider.init().await.unwrap();
        let before = provider.instances();

        health.set_healthy(false);
        registration.refresh().await.unwrap();

        assert!(matches!(provider.refresh().await, Err(Error::NotFound(_))));
        assert_eq!(*provider.instances(), *before);
        assert_eq!(provider.get_instance().unwrap().port(), 8080);
    }

    #[tokio::test]
    async fn test_unreadable_payload_aborts_cycle() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let registration = ServiceRegistration::new(
            connection.clone(),
            "basePath",
            InstanceDescriptor::new("svc", "localhost", 8080),
            Duration::from_secs(3600),
        );
        registration.register().await.unwrap();

        let provider = new_provider(&connection, "svc", SelectionStrategy::RoundRobin);
        provider.init().await.unwrap();

        connection
            .store()
            .unwrap()
            .commit(Transaction::new().create(
                "/basePath/svc/garbage:1",
                "not json",
                CreateMode::Ephemeral,
            ))
            .await
            .unwrap();

        assert!(matches!(provider.refresh().await, Err(Error::Serialization(_))));
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_filter_when_configured() {
        let ensemble = MemoryEnsemble::new();
        let connection = connected(&ensemble).await;
        let store = connection.store().unwrap();
        store.create_path_recursive("/basePath/svc").await.unwrap();

        let mut old = InstanceDescriptor::new("svc", "old", 1).snapshot();
        old.last_updated = chrono::Utc::now() - chrono::Duration::minutes(10);
        let fresh = InstanceDescriptor::new("svc", "fresh", 2).snapshot();
        store
            .commit(
                Transaction::new()
                    .create(
                        "/basePath/svc/old:1",
                        old.to_payload().unwrap(),
                        CreateMode::Ephemeral,
                    )
                    .create(
                        "/basePath/svc/fresh:2",
                        fresh.to_payload().unwrap(),
                        CreateMode::Ephemeral,
                    ),
            )
            .await
            .unwrap();

        let lenient = new_provider(&connection, "svc", SelectionStrategy::RoundRobin);
        lenient.init().await.unwrap();
        assert_eq!(lenient.instances().len(), 2);

        let strict = InstanceProvider::new(
            connection,
            "basePath",
            "svc",
            ProviderOptions {
                stale_node_threshold: Some(Duration::from_secs(60)),
                ..options(SelectionStrategy::RoundRobin)
            },
        );
        strict.init().await.unwrap();
        assert_eq!(strict.instances().len(), 1);
        assert_eq!(strict.get_instance().unwrap().host(), "fresh");
    }
}
