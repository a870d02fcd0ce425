pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod instance;
pub mod logging;
pub mod provider;
pub mod registration;
pub mod selection;
pub mod store;

pub use cache::ResolutionCache;
pub use config::Config;
pub use connection::{ConnectionManager, SessionState};
pub use error::{Error, Result};
pub use events::{DiscoveryEvent, EventBus};
pub use instance::{
    HealthCheck, HealthFlag, HealthStatus, InstanceDescriptor, InstanceSnapshot, NodeData,
};
pub use provider::{InstanceProvider, ProviderOptions};
pub use registration::ServiceRegistration;
pub use selection::{ResolvedInstance, SelectionStrategy, Selector};
pub use store::{
    ConnectionSettings, CoordinationStore, MemoryConnector, MemoryEnsemble, StoreConnector,
    StoreError,
};
