//! Instance selection over the resolution cache
//!
//! Reads a shared snapshot of the cache without holding any lock across
//! the pick; a concurrent cache swap is picked up on the next call.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::instance::InstanceSnapshot;

/// Selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Uniform pick over the current list
    #[serde(alias = "Random")]
    Random,
    /// Pre-incremented cursor, wrapped against the current list length
    #[default]
    #[serde(alias = "RoundRobin")]
    RoundRobin,
}

impl FromStr for SelectionStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "random" => Ok(Self::Random),
            "roundrobin" => Ok(Self::RoundRobin),
            _ => Err(crate::Error::Configuration(format!(
                "Unknown selection strategy: {s}"
            ))),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("random"),
            Self::RoundRobin => f.write_str("round_robin"),
        }
    }
}

/// A cached instance handed to the caller, with its derived service URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInstance {
    #[serde(flatten)]
    pub instance: InstanceSnapshot,
    pub service_url: String,
}

impl ResolvedInstance {
    #[must_use]
    pub fn new(instance: InstanceSnapshot, secure: bool) -> Self {
        let scheme = if secure { "https" } else { "http" };
        let service_url = format!("{scheme}://{}:{}", instance.host, instance.port);
        Self {
            instance,
            service_url,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.instance.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.instance.port
    }

    #[must_use]
    pub fn address(&self) -> String {
        self.instance.address()
    }
}

/// Strategy plus round-robin cursor
#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    #[must_use]
    pub const fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Index into a list of `len` entries, `None` when the list is empty
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self.strategy {
            SelectionStrategy::Random => Some(rand::thread_rng().gen_range(0..len)),
            SelectionStrategy::RoundRobin => {
                // The list may have shrunk since the last call; an out of range
                // cursor resets to the first entry.
                let advance = |cursor: usize| {
                    let next = cursor.wrapping_add(1);
                    if next < len {
                        next
                    } else {
                        0
                    }
                };
                let previous = self
                    .cursor
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(advance(c)))
                    .unwrap_or_else(|c| c);
                Some(advance(previous))
            }
        }
    }

    /// Pick one entry of `instances`
    pub fn select<'a>(&self, instances: &'a [InstanceSnapshot]) -> Option<&'a InstanceSnapshot> {
        self.next_index(instances.len()).and_then(|idx| instances.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceDescriptor;
    use std::collections::HashMap;

    fn instances(n: u16) -> Vec<InstanceSnapshot> {
        (0..n)
            .map(|i| InstanceDescriptor::new("svc", "localhost", 8080 + i).snapshot())
            .collect()
    }

    #[test]
    fn test_round_robin_even_distribution() {
        let selector = Selector::new(SelectionStrategy::RoundRobin);
        let list = instances(3);
        let mut counts: HashMap<u16, usize> = HashMap::new();

        for _ in 0..100 {
            let picked = selector.select(&list).unwrap();
            *counts.entry(picked.port).or_default() += 1;
        }

        for count in counts.values() {
            assert!(*count == 33 || *count == 34, "uneven split: {counts:?}");
        }
        assert_eq!(counts.values().sum::<usize>(), 100);
    }

    #[test]
    fn test_round_robin_pre_increments() {
        let selector = Selector::new(SelectionStrategy::RoundRobin);
        assert_eq!(selector.next_index(2), Some(1));
        assert_eq!(selector.next_index(2), Some(0));
        assert_eq!(selector.next_index(2), Some(1));
    }

    #[test]
    fn test_round_robin_resets_when_list_shrinks() {
        let selector = Selector::new(SelectionStrategy::RoundRobin);
        assert_eq!(selector.next_index(5), Some(1));
        assert_eq!(selector.next_index(5), Some(2));
        assert_eq!(selector.next_index(5), Some(3));
        // Cursor 3 runs past a list of two
        assert_eq!(selector.next_index(2), Some(0));
        assert_eq!(selector.next_index(2), Some(1));
    }

    #[test]
    fn test_random_converges() {
        let selector = Selector::new(SelectionStrategy::Random);
        let list = instances(2);
        let mut first = 0usize;

        for _ in 0..10_000 {
            if selector.select(&list).unwrap().port == 8080 {
                first += 1;
            }
        }

        assert!((4_500..=5_500).contains(&first), "skewed split: {first}");
    }

    #[test]
    fn test_empty_list_selects_nothing() {
        let selector = Selector::new(SelectionStrategy::Random);
        assert!(selector.select(&[]).is_none());
        let selector = Selector::new(SelectionStrategy::RoundRobin);
        assert!(selector.next_index(0).is_none());
    }

    #[test]
    fn test_service_url_scheme() {
        let snapshot = InstanceDescriptor::new("svc", "localhost", 8080).snapshot();
        assert_eq!(
            ResolvedInstance::new(snapshot.clone(), false).service_url,
            "http://localhost:8080"
        );
        assert_eq!(
            ResolvedInstance::new(snapshot, true).service_url,
            "https://localhost:8080"
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Random".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::Random);
        assert_eq!(
            "RoundRobin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            "round_robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert!("least_connections".parse::<SelectionStrategy>().is_err());
    }
}
