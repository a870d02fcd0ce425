//! Advertisable service instances and their point-in-time snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::store::path;

/// Health probe evaluated on every snapshot
#[cfg_attr(test, mockall::automock)]
pub trait HealthCheck: Send + Sync {
    fn is_healthy(&self) -> bool;
}

impl<F> HealthCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_healthy(&self) -> bool {
        self()
    }
}

/// Health probe backed by a flag the owning process flips
#[derive(Debug)]
pub struct HealthFlag {
    healthy: AtomicBool,
}

impl HealthFlag {
    #[must_use]
    pub const fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

impl HealthCheck for HealthFlag {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Health status persisted in the advertisement payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Environment metadata carried with every snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub environment: String,
}

/// Value snapshot of one instance, serialized into its advertisement node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default)]
    pub node_data: NodeData,
    /// Older writers spelled the key `healthCheckStatus`
    #[serde(alias = "healthCheckStatus")]
    pub healthcheck_status: HealthStatus,
    #[serde(rename = "lastUpdatedTimeStamp", with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl InstanceSnapshot {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.healthcheck_status.is_healthy()
    }

    /// Check if the snapshot has not been refreshed within `threshold`
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_updated);
        elapsed
            .to_std()
            .map(|elapsed| elapsed > threshold)
            .unwrap_or(false)
    }

    /// `host:port`, the advertisement node name
    #[must_use]
    pub fn address(&self) -> String {
        path::node_name(&self.host, self.port)
    }

    /// Encode as the UTF-8 JSON advertisement payload
    pub fn to_payload(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an advertisement payload
    pub fn from_payload(payload: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Ports were written as strings by earlier clients
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(port) => Ok(port),
        PortRepr::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// One advertisable endpoint of a named service
///
/// Identity (name, host, port) is fixed at construction. Health and
/// timestamp are recomputed by every [`snapshot`](Self::snapshot) call.
#[derive(Clone)]
pub struct InstanceDescriptor {
    service_name: String,
    host: String,
    port: u16,
    secure: bool,
    node_data: NodeData,
    health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl fmt::Debug for InstanceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceDescriptor")
            .field("service_name", &self.service_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("node_data", &self.node_data)
            .field("health_checks", &self.health_checks.len())
            .finish()
    }
}

impl InstanceDescriptor {
    #[must_use]
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            secure: false,
            node_data: NodeData::default(),
            health_checks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.node_data.environment = environment.into();
        self
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Append a probe; probes run in insertion order
    #[must_use]
    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn secure(&self) -> bool {
        self.secure
    }

    /// Evaluate probes in order, stopping at the first failure
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        if self.health_checks.iter().all(|check| check.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Fresh snapshot with current health and wall-clock timestamp
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            host: self.host.clone(),
            port: self.port,
            node_data: self.node_data.clone(),
            healthcheck_status: self.health_status(),
            last_updated: Utc::now(),
        }
    }
}
