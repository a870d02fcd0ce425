//! Coordination store capability
//!
//! The discovery client only needs a small slice of a ZooKeeper-style tree:
//! child listing with one-shot watches, data reads, recursive path creation
//! and atomic multi-op transactions. Concrete backends plug in through
//! [`StoreConnector`] and [`CoordinationStore`].

pub mod memory;
pub mod path;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, MemoryEnsemble};

/// Errors reported by a coordination store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("connection to the store was lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Settings handed to a connector for the session handshake
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connection_string: String,
    pub retry_count: usize,
    pub retry_wait: Duration,
    pub connect_timeout: Duration,
    pub session_timeout: Duration,
}

impl ConnectionSettings {
    pub const DEFAULT_RETRY_COUNT: usize = 5;
    pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(10_000);

    /// Settings with default retry and timeout policy
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            retry_count: Self::DEFAULT_RETRY_COUNT,
            retry_wait: Self::DEFAULT_RETRY_WAIT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry_count: usize, retry_wait: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_wait = retry_wait;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// Session-level notifications delivered after a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport dropped; the session may still be alive store-side
    Disconnected,
    /// The store ended the session and released its ephemeral nodes
    Expired,
}

/// A live session produced by [`StoreConnector::connect`]
pub struct Session {
    pub store: Arc<dyn CoordinationStore>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// How a node created inside a transaction outlives its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

/// Single operation inside a [`Transaction`]
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Bytes,
    },
    Remove {
        path: String,
    },
}

/// Result of one committed operation, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Created { path: String },
    DataSet { path: String },
    Removed { path: String },
}

impl OpResult {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Created { path } | Self::DataSet { path } | Self::Removed { path } => path,
        }
    }
}

/// Multi-operation transaction committed all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn create(
        mut self,
        path: impl Into<String>,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> Self {
        self.ops.push(Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        });
        self
    }

    #[must_use]
    pub fn set_data(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.ops.push(Op::SetData {
            path: path.into(),
            data: data.into(),
        });
        self
    }

    #[must_use]
    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.ops.push(Op::Remove { path: path.into() });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Kind of change reported to a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Notification delivered to a [`Watcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// One-shot watch subscription
///
/// The store keeps the watcher until the next qualifying change and then
/// consumes it; a fired watcher must be re-armed by a new read.
#[derive(Debug)]
pub struct Watcher {
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watcher {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<WatchedEvent>) -> Self {
        Self { tx }
    }

    /// Deliver the event, consuming the subscription
    pub fn fire(self, event: WatchedEvent) {
        // Receiver gone means the subscriber shut down
        let _ = self.tx.send(event);
    }

    /// Whether both watchers deliver to the same subscriber
    #[must_use]
    pub fn same_subscriber(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Whether anyone is still listening
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Performs the session handshake against a store ensemble
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Session, StoreError>;
}

/// Operations available on a live session
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Identifier of the owning session
    fn session_id(&self) -> u64;

    /// List the child names of `path`, optionally arming a children watch
    async fn list_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Vec<String>, StoreError>;

    /// Read the payload stored at `path`
    async fn get_data(&self, path: &str) -> Result<Bytes, StoreError>;

    /// Create `path` and every missing ancestor as persistent nodes
    async fn create_path_recursive(&self, path: &str) -> Result<(), StoreError>;

    /// Commit every operation atomically
    async fn commit(&self, transaction: Transaction) -> Result<Vec<OpResult>, StoreError>;

    /// End the session, releasing its ephemeral nodes
    async fn close(&self);
}
