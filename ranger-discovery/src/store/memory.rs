//! In-process coordination store
//!
//! Mirrors the ZooKeeper semantics the discovery client depends on:
//! session-owned ephemeral nodes, one-shot children watches and
//! all-or-nothing transactions. Used by the `ranger` binary as an embedded
//! store and by the test suites.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::path::{self, parent};
use super::{
    ConnectionSettings, CoordinationStore, CreateMode, Op, OpResult, Session, SessionEvent,
    StoreConnector, StoreError, Transaction, WatchEventKind, WatchedEvent, Watcher,
};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Children watches keyed by watched path, tagged with the arming session
    child_watches: HashMap<String, Vec<(u64, Watcher)>>,
    sessions: HashMap<u64, SessionEvents>,
    next_session_id: u64,
    available: bool,
}

/// Pending watch notification: the watched path and the event to deliver
type Notification = (String, WatchedEvent);

/// Watcher detached from the tree, paired with the event it fires
type FiredWatch = (Watcher, WatchedEvent);

type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Bytes::new(),
                owner: None,
            },
        );
        Self {
            nodes,
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            available: true,
        }
    }

    fn ensure_alive(&self, session_id: u64) -> Result<(), StoreError> {
        if self.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(StoreError::SessionExpired)
        }
    }

    fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        nodes
            .keys()
            .filter(|key| key.as_str() != "/" && parent(key) == Some(path))
            .filter_map(|key| key.rsplit('/').next().map(str::to_string))
            .collect()
    }

    fn children_changed(path: &str) -> Option<Notification> {
        parent(path).map(|p| {
            (
                p.to_string(),
                WatchedEvent {
                    kind: WatchEventKind::NodeChildrenChanged,
                    path: p.to_string(),
                },
            )
        })
    }

    fn apply(
        nodes: &mut BTreeMap<String, Node>,
        op: Op,
        session_id: u64,
        notifications: &mut Vec<Notification>,
    ) -> Result<OpResult, StoreError> {
        match op {
            Op::Create { path: node_path, data, mode } => {
                path::validate(&node_path)?;
                if nodes.contains_key(&node_path) {
                    return Err(StoreError::NodeExists(node_path));
                }
                let parent_path = parent(&node_path)
                    .ok_or_else(|| StoreError::InvalidPath(node_path.clone()))?;
                match nodes.get(parent_path) {
                    None => return Err(StoreError::NoNode(parent_path.to_string())),
                    Some(p) if p.owner.is_some() => {
                        return Err(StoreError::InvalidPath(format!(
                            "{node_path}: ephemeral parent cannot have children"
                        )))
                    }
                    Some(_) => {}
                }
                let owner = match mode {
                    CreateMode::Ephemeral => Some(session_id),
                    CreateMode::Persistent => None,
                };
                notifications.extend(Self::children_changed(&node_path));
                nodes.insert(node_path.clone(), Node { data, owner });
                Ok(OpResult::Created { path: node_path })
            }
            Op::SetData { path: node_path, data } => {
                path::validate(&node_path)?;
                let node = nodes
                    .get_mut(&node_path)
                    .ok_or_else(|| StoreError::NoNode(node_path.clone()))?;
                node.data = data;
                Ok(OpResult::DataSet { path: node_path })
            }
            Op::Remove { path: node_path } => {
                path::validate(&node_path)?;
                if node_path == "/" {
                    return Err(StoreError::InvalidPath(node_path));
                }
                if !nodes.contains_key(&node_path) {
                    return Err(StoreError::NoNode(node_path));
                }
                if !Self::children_of(nodes, &node_path).is_empty() {
                    return Err(StoreError::NotEmpty(node_path));
                }
                nodes.remove(&node_path);
                notifications.push((
                    node_path.clone(),
                    WatchedEvent {
                        kind: WatchEventKind::NodeDeleted,
                        path: node_path.clone(),
                    },
                ));
                notifications.extend(Self::children_changed(&node_path));
                Ok(OpResult::Removed { path: node_path })
            }
        }
    }

    /// Detach the watchers that the notifications trigger
    fn take_watchers(&mut self, notifications: Vec<Notification>) -> Vec<FiredWatch> {
        let mut fired = Vec::new();
        for (watched_path, event) in notifications {
            if let Some(watchers) = self.child_watches.remove(&watched_path) {
                fired.extend(watchers.into_iter().map(|(_, w)| (w, event.clone())));
            }
        }
        fired
    }

    /// Drop the session and every ephemeral node it owns
    fn end_session(&mut self, session_id: u64) -> (Option<SessionEvents>, Vec<FiredWatch>) {
        let events = self.sessions.remove(&session_id);
        // Watches do not outlive the session that armed them
        for watchers in self.child_watches.values_mut() {
            watchers.retain(|(owner, _)| *owner != session_id);
        }
        self.child_watches.retain(|_, watchers| !watchers.is_empty());
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(key, _)| key.clone())
            .collect();

        let mut notifications = Vec::new();
        for node_path in owned {
            // Ephemeral nodes are leaves, so removal cannot fail
            let op = Op::Remove { path: node_path };
            let _ = Self::apply(&mut self.nodes, op, session_id, &mut notifications);
        }
        let fired = self.take_watchers(notifications);
        (events, fired)
    }
}

fn deliver(fired: Vec<FiredWatch>) {
    for (watcher, event) in fired {
        watcher.fire(event);
    }
}

/// Shared in-memory tree that any number of sessions connect to
#[derive(Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Connector handing out sessions on this ensemble
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            ensemble: self.clone(),
        }
    }

    /// Refuse (or accept again) new handshakes
    pub fn set_available(&self, available: bool) {
        self.tree.lock().available = available;
    }

    /// Expire a session as the store would after a session timeout
    pub fn expire_session(&self, session_id: u64) {
        let (events, fired) = self.tree.lock().end_session(session_id);
        if let Some(events) = events {
            info!(session_id, "Session expired");
            let _ = events.send(SessionEvent::Expired);
        }
        deliver(fired);
    }

    /// Drop the transport of a session without expiring it store-side
    pub fn disconnect_session(&self, session_id: u64) {
        let tree = self.tree.lock();
        if let Some(events) = tree.sessions.get(&session_id) {
            let _ = events.send(SessionEvent::Disconnected);
        }
    }

    /// Identifiers of the live sessions
    #[must_use]
    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tree.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    #[must_use]
    pub fn exists(&self, node_path: &str) -> bool {
        self.tree.lock().nodes.contains_key(node_path)
    }

    /// Payload of a node, read outside of any session
    #[must_use]
    pub fn node_data(&self, node_path: &str) -> Option<Bytes> {
        self.tree.lock().nodes.get(node_path).map(|n| n.data.clone())
    }

    /// Owning session of an ephemeral node
    #[must_use]
    pub fn ephemeral_owner(&self, node_path: &str) -> Option<u64> {
        self.tree.lock().nodes.get(node_path).and_then(|n| n.owner)
    }
}

/// Handshake against a [`MemoryEnsemble`]
#[derive(Clone)]
pub struct MemoryConnector {
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Session, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut tree = self.ensemble.tree.lock();
            if !tree.available {
                return Err(StoreError::ConnectionLoss);
            }
            let id = tree.next_session_id;
            tree.next_session_id += 1;
            tree.sessions.insert(id, tx);
            id
        };

        debug!(
            session_id,
            connection_string = %settings.connection_string,
            "In-memory session established"
        );

        Ok(Session {
            store: Arc::new(MemorySession {
                id: session_id,
                ensemble: self.ensemble.clone(),
            }),
            events: rx,
        })
    }
}

/// Store handle bound to one session
pub struct MemorySession {
    id: u64,
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn list_children(
        &self,
        node_path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Vec<String>, StoreError> {
        path::validate(node_path)?;
        let mut tree = self.ensemble.tree.lock();
        tree.ensure_alive(self.id)?;
        if !tree.nodes.contains_key(node_path) {
            return Err(StoreError::NoNode(node_path.to_string()));
        }
        let children = Tree::children_of(&tree.nodes, node_path);
        if let Some(watcher) = watcher {
            let watchers = tree.child_watches.entry(node_path.to_string()).or_default();
            watchers.retain(|(_, w)| !w.is_closed());
            // A subscriber is notified once per change however often it re-arms
            if !watchers.iter().any(|(_, w)| w.same_subscriber(&watcher)) {
                watchers.push((self.id, watcher));
            }
        }
        Ok(children)
    }

    async fn get_data(&self, node_path: &str) -> Result<Bytes, StoreError> {
        path::validate(node_path)?;
        let tree = self.ensemble.tree.lock();
        tree.ensure_alive(self.id)?;
        tree.nodes
            .get(node_path)
            .map(|n| n.data.clone())
            .ok_or_else(|| StoreError::NoNode(node_path.to_string()))
    }

    async fn create_path_recursive(&self, node_path: &str) -> Result<(), StoreError> {
        path::validate(node_path)?;
        let fired = {
            let mut tree = self.ensemble.tree.lock();
            tree.ensure_alive(self.id)?;

            let mut notifications = Vec::new();
            let mut current = String::new();
            for segment in node_path.split('/').filter(|s| !s.is_empty()) {
                current.push('/');
                current.push_str(segment);
                if tree.nodes.contains_key(&current) {
                    continue;
                }
                let op = Op::Create {
                    path: current.clone(),
                    data: Bytes::new(),
                    mode: CreateMode::Persistent,
                };
                Tree::apply(&mut tree.nodes, op, self.id, &mut notifications)?;
            }
            tree.take_watchers(notifications)
        };
        deliver(fired);
        Ok(())
    }

    async fn commit(&self, transaction: Transaction) -> Result<Vec<OpResult>, StoreError> {
        let (results, fired) = {
            let mut tree = self.ensemble.tree.lock();
            tree.ensure_alive(self.id)?;

            let mut scratch = tree.nodes.clone();
            let mut notifications = Vec::new();
            let mut results = Vec::with_capacity(transaction.ops().len());
            for op in transaction.into_ops() {
                results.push(Tree::apply(&mut scratch, op, self.id, &mut notifications)?);
            }
            tree.nodes = scratch;
            (results, tree.take_watchers(notifications))
        };
        deliver(fired);
        Ok(results)
    }

    async fn close(&self) {
        let (_, fired) = self.ensemble.tree.lock().end_session(self.id);
        debug!(session_id = self.id, "In-memory session closed");
        deliver(fired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(ensemble: &MemoryEnsemble) -> Session {
        ensemble
            .connector()
            .connect(&ConnectionSettings::new("memory"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await;

        let err = session
            .store
            .commit(Transaction::new().create("/a/b", "x", CreateMode::Persistent))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a".to_string()));

        session.store.create_path_recursive("/a").await.unwrap();
        session.store.create_path_recursive("/a").await.unwrap();
        let results = session
            .store
            .commit(Transaction::new().create("/a/b", "x", CreateMode::Persistent))
            .await
            .unwrap();
        assert_eq!(results[0].path(), "/a/b");
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await;
        session.store.create_path_recursive("/svc").await.unwrap();

        let txn = Transaction::new()
            .create("/svc/a", "1", CreateMode::Persistent)
            .set_data("/svc/missing", "2");
        assert!(session.store.commit(txn).await.is_err());
        assert!(!ensemble.exists("/svc/a"));
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_removed_with_session() {
        let ensemble = MemoryEnsemble::new();
        let owner = open(&ensemble).await;
        let observer = open(&ensemble).await;
        owner.store.create_path_recursive("/base/svc").await.unwrap();
        owner
            .store
            .commit(Transaction::new().create("/base/svc/h:1", "{}", CreateMode::Ephemeral))
            .await
            .unwrap();
        assert_eq!(ensemble.ephemeral_owner("/base/svc/h:1"), Some(owner.store.session_id()));

        let mut events = owner.events;
        ensemble.expire_session(owner.store.session_id());

        assert_eq!(events.recv().await, Some(SessionEvent::Expired));
        assert!(!ensemble.exists("/base/svc/h:1"));
        assert!(ensemble.exists("/base/svc"));
        assert!(observer.store.list_children("/base/svc", None).await.unwrap().is_empty());
        assert_eq!(
            owner.store.get_data("/base/svc").await.unwrap_err(),
            StoreError::SessionExpired
        );
    }

    #[tokio::test]
    async fn test_children_watch_fires_once() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await;
        session.store.create_path_recursive("/svc").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .store
            .list_children("/svc", Some(Watcher::new(tx)))
            .await
            .unwrap();

        session
            .store
            .commit(Transaction::new().create("/svc/a", "", CreateMode::Ephemeral))
            .await
            .unwrap();
        session
            .store
            .commit(Transaction::new().create("/svc/b", "", CreateMode::Ephemeral))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeChildrenChanged);
        assert_eq!(event.path, "/svc");
        // Watcher was consumed by the first change and the sender dropped with it
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_set_data_does_not_fire_children_watch() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await;
        session.store.create_path_recursive("/svc").await.unwrap();
        session
            .store
            .commit(Transaction::new().create("/svc/a", "1", CreateMode::Ephemeral))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .store
            .list_children("/svc", Some(Watcher::new(tx)))
            .await
            .unwrap();
        session
            .store
            .commit(Transaction::new().set_data("/svc/a", "2"))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(ensemble.node_data("/svc/a").unwrap(), Bytes::from("2"));
    }

    #[tokio::test]
    async fn test_rearming_same_subscriber_fires_once() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await;
        session.store.create_path_recursive("/svc").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            session
                .store
                .list_children("/svc", Some(Watcher::new(tx.clone())))
                .await
                .unwrap();
        }
        session
            .store
            .commit(Transaction::new().create("/svc/a", "", CreateMode::Ephemeral))
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watches_end_with_session() {
        let ensemble = MemoryEnsemble::new();
        let watching = open(&ensemble).await;
        let writer = open(&ensemble).await;
        writer.store.create_path_recursive("/svc").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        watching
            .store
            .list_children("/svc", Some(Watcher::new(tx)))
            .await
            .unwrap();
        ensemble.expire_session(watching.store.session_id());

        writer
            .store
            .commit(Transaction::new().create("/svc/a", "", CreateMode::Ephemeral))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_refuses_handshake() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let result = ensemble
            .connector()
            .connect(&ConnectionSettings::new("memory"))
            .await;
        assert!(matches!(result, Err(StoreError::ConnectionLoss)));
    }
}
