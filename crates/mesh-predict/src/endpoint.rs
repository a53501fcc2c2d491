//! Forecaster endpoint selection strategies

use mesh_core::{EndpointSelection, RequestId};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Picks one forecaster endpoint per call
pub trait EndpointSelector: Send + Sync {
    /// Index into `endpoints` of the endpoint to use, `None` when there are none
    fn select(&self, endpoints: &[String], request_id: &RequestId) -> Option<usize>;

    /// Selector statistics
    fn stats(&self) -> SelectorStats;
}

/// Selection statistics
#[derive(Debug, Clone, Default)]
pub struct SelectorStats {
    /// Total number of selections made
    pub total_selections: usize,

    /// Selections per endpoint
    pub selections_per_endpoint: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct SelectorStatsInner {
    total_selections: AtomicUsize,
    selections_per_endpoint: parking_lot::RwLock<HashMap<String, usize>>,
}

impl SelectorStatsInner {
    fn record(&self, endpoint: &str) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        let mut selections = self.selections_per_endpoint.write();
        *selections.entry(endpoint.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> SelectorStats {
        SelectorStats {
            total_selections: self.total_selections.load(Ordering::Relaxed),
            selections_per_endpoint: self.selections_per_endpoint.read().clone(),
        }
    }
}

/// Round-robin endpoint selection
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
    stats: SelectorStatsInner,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, endpoints: &[String], request_id: &RequestId) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        self.stats.record(&endpoints[index]);

        debug!(
            request_id = %request_id,
            endpoint = %endpoints[index],
            index = index,
            "Selected forecaster (round-robin)"
        );

        Some(index)
    }

    fn stats(&self) -> SelectorStats {
        self.stats.snapshot()
    }
}

/// Hash-by-request endpoint selection; one request always lands on one endpoint
#[derive(Debug, Default)]
pub struct HashedSelector {
    stats: SelectorStatsInner,
}

impl HashedSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointSelector for HashedSelector {
    fn select(&self, endpoints: &[String], request_id: &RequestId) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        let mut hasher = DefaultHasher::new();
        request_id.hash(&mut hasher);
        let index = (hasher.finish() % endpoints.len() as u64) as usize;
        self.stats.record(&endpoints[index]);

        debug!(
            request_id = %request_id,
            endpoint = %endpoints[index],
            index = index,
            "Selected forecaster (hashed)"
        );

        Some(index)
    }

    fn stats(&self) -> SelectorStats {
        self.stats.snapshot()
    }
}

/// Selector factory
pub struct SelectorFactory;

impl SelectorFactory {
    pub fn create(selection: EndpointSelection) -> Box<dyn EndpointSelector> {
        match selection {
            EndpointSelection::RoundRobin => Box::new(RoundRobinSelector::new()),
            EndpointSelection::HashedByRequest => Box::new(HashedSelector::new()),
        }
    }
}
