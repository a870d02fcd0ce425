//! Resolution cache
//!
//! Holds the last successfully fetched list of healthy instances for one
//! consumed service. The list is swapped as a whole; readers get a shared
//! snapshot and never observe a partial update.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::instance::InstanceSnapshot;

#[derive(Debug, Default)]
pub struct ResolutionCache {
    instances: RwLock<Arc<Vec<InstanceSnapshot>>>,
}

impl ResolutionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the entire backing list
    pub fn replace(&self, instances: Vec<InstanceSnapshot>) {
        *self.instances.write() = Arc::new(instances);
    }

    /// Current list as a shared snapshot
    #[must_use]
    pub fn current(&self) -> Arc<Vec<InstanceSnapshot>> {
        self.instances.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceDescriptor;

    #[test]
    fn test_replace_swaps_whole_list() {
        let cache = ResolutionCache::new();
        assert!(cache.is_empty());

        let a = InstanceDescriptor::new("svc", "a", 1).snapshot();
        let b = InstanceDescriptor::new("svc", "b", 2).snapshot();
        cache.replace(vec![a.clone(), b]);
        let before = cache.current();

        cache.replace(vec![a]);
        // Readers holding the previous snapshot keep an intact list
        assert_eq!(before.len(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current()[0].host, "a");
    }
}
