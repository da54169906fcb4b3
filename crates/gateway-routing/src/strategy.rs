//! Primary selection strategies.
//!
//! A strategy only decides which of a route's equally ranked primaries is
//! tried first. The remaining primaries keep their configured order and the
//! fallback chain always follows unchanged.
//!
//! - Fixed: configured order
//! - Least busy: fewest in-flight calls
//! - Usage based: lowest token bucket utilization

use dashmap::DashMap;
use gateway_config::RoutingStrategyKind;
use gateway_core::{BackendDescriptor, BackendId, ModelRoute};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Live load signals consulted by strategies
pub trait LoadView: Send + Sync {
    /// Calls currently in flight against a backend
    fn in_flight(&self, backend: &BackendId) -> u64;

    /// Fraction of the token budget currently consumed, 0.0 to 1.0
    fn utilization(&self, backend: &BackendId) -> f64;
}

/// Orders a route's candidates for one call
pub trait RoutingStrategy: Send + Sync {
    /// Index into `route.primaries()` of the primary to try first
    fn select_primary(&self, route: &ModelRoute, load: &dyn LoadView) -> usize;

    /// Get the strategy name
    fn name(&self) -> &'static str;

    /// Candidate order for one call: chosen primary, other primaries, fallbacks
    fn order(&self, route: &ModelRoute, load: &dyn LoadView) -> Vec<Arc<BackendDescriptor>> {
        let chosen = if route.primaries().len() > 1 {
            self.select_primary(route, load).min(route.primaries().len() - 1)
        } else {
            0
        };
        let mut ordered = Vec::with_capacity(route.candidates().len());
        ordered.push(Arc::clone(&route.primaries()[chosen]));
        ordered.extend(
            route
                .primaries()
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != chosen)
                .map(|(_, d)| Arc::clone(d)),
        );
        ordered.extend(route.fallbacks().iter().cloned());
        debug!(
            strategy = self.name(),
            model = %route.name(),
            first = %ordered[0].id,
            "Ordered candidates"
        );
        ordered
    }
}

/// Always the first configured primary
#[derive(Debug, Default)]
pub struct FixedStrategy;

impl RoutingStrategy for FixedStrategy {
    fn select_primary(&self, _route: &ModelRoute, _load: &dyn LoadView) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Primary with the fewest in-flight calls; ties keep configured order
#[derive(Debug, Default)]
pub struct LeastBusyStrategy;

impl RoutingStrategy for LeastBusyStrategy {
    fn select_primary(&self, route: &ModelRoute, load: &dyn LoadView) -> usize {
        route
            .primaries()
            .iter()
            .enumerate()
            .min_by_key(|(i, d)| (load.in_flight(&d.id), *i))
            .map_or(0, |(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "least-busy"
    }
}

/// Primary with the most remaining token budget; ties keep configured order
#[derive(Debug, Default)]
pub struct UsageBasedStrategy;

impl RoutingStrategy for UsageBasedStrategy {
    fn select_primary(&self, route: &ModelRoute, load: &dyn LoadView) -> usize {
        let mut best = 0;
        let mut best_utilization = f64::INFINITY;
        for (i, descriptor) in route.primaries().iter().enumerate() {
            let utilization = load.utilization(&descriptor.id);
            if utilization < best_utilization {
                best = i;
                best_utilization = utilization;
            }
        }
        best
    }

    fn name(&self) -> &'static str {
        "usage-based"
    }
}

/// Create the strategy for a configured kind
#[must_use]
pub fn create_strategy(kind: RoutingStrategyKind) -> Arc<dyn RoutingStrategy> {
    match kind {
        RoutingStrategyKind::Fixed => Arc::new(FixedStrategy),
        RoutingStrategyKind::LeastBusy => Arc::new(LeastBusyStrategy),
        RoutingStrategyKind::UsageBased => Arc::new(UsageBasedStrategy),
    }
}

/// In-flight call counts per backend
#[derive(Debug, Default)]
pub struct InFlightTracker {
    counts: DashMap<String, AtomicU64>,
}

impl InFlightTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call as in flight until the guard drops
    #[must_use]
    pub fn begin(self: &Arc<Self>, backend: &BackendId) -> InFlightGuard {
        self.counts
            .entry(backend.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            tracker: Arc::clone(self),
            backend: backend.to_string(),
        }
    }

    /// Calls currently in flight against a backend
    #[must_use]
    pub fn get(&self, backend: &BackendId) -> u64 {
        self.counts
            .get(backend.as_str())
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn finish(&self, backend: &str) {
        if let Some(count) = self.counts.get(backend) {
            // Saturate at zero
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
        }
    }
}

/// Decrements the in-flight count on drop
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    backend: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ModelName;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticLoad {
        in_flight: HashMap<String, u64>,
        utilization: HashMap<String, f64>,
    }

    impl LoadView for StaticLoad {
        fn in_flight(&self, backend: &BackendId) -> u64 {
            self.in_flight.get(backend.as_str()).copied().unwrap_or(0)
        }

        fn utilization(&self, backend: &BackendId) -> f64 {
            self.utilization.get(backend.as_str()).copied().unwrap_or(0.0)
        }
    }

    fn descriptor(name: &str) -> Arc<BackendDescriptor> {
        Arc::new(BackendDescriptor::new(
            BackendId::new(name).expect("valid id"),
            "openai",
            "m",
            "http://localhost",
        ))
    }

    fn route() -> ModelRoute {
        ModelRoute::new(
            ModelName::new("chat").expect("valid name"),
            vec![descriptor("p1"), descriptor("p2"), descriptor("p3")],
            vec![descriptor("f1")],
        )
        .expect("valid route")
    }

    fn ids(ordered: &[Arc<BackendDescriptor>]) -> Vec<&str> {
        ordered.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_fixed_keeps_configured_order() {
        let ordered = FixedStrategy.order(&route(), &StaticLoad::default());
        assert_eq!(ids(&ordered), vec!["p1", "p2", "p3", "f1"]);
    }

    #[test]
    fn test_least_busy_picks_idle_primary() {
        let load = StaticLoad {
            in_flight: HashMap::from([("p1".to_string(), 4), ("p2".to_string(), 2), ("p3".to_string(), 2)]),
            ..StaticLoad::default()
        };
        let ordered = LeastBusyStrategy.order(&route(), &load);
        assert_eq!(ids(&ordered), vec!["p2", "p1", "p3", "f1"]);
    }

    #[test]
    fn test_least_busy_ties_keep_order() {
        let ordered = LeastBusyStrategy.order(&route(), &StaticLoad::default());
        assert_eq!(ids(&ordered), vec!["p1", "p2", "p3", "f1"]);
    }

    #[test]
    fn test_usage_based_picks_lowest_utilization() {
        let load = StaticLoad {
            utilization: HashMap::from([
                ("p1".to_string(), 0.9),
                ("p2".to_string(), 0.5),
                ("p3".to_string(), 0.1),
            ]),
            ..StaticLoad::default()
        };
        let ordered = UsageBasedStrategy.order(&route(), &load);
        assert_eq!(ids(&ordered), vec!["p3", "p1", "p2", "f1"]);
    }

    #[test]
    fn test_fallbacks_never_promoted() {
        let load = StaticLoad {
            in_flight: HashMap::from([("p1".to_string(), 9), ("p2".to_string(), 9), ("p3".to_string(), 9)]),
            ..StaticLoad::default()
        };
        let ordered = create_strategy(RoutingStrategyKind::LeastBusy).order(&route(), &load);
        assert_eq!(ordered.last().map(|d| d.id.as_str()), Some("f1"));
    }

    #[test]
    fn test_in_flight_guard() {
        let tracker = Arc::new(InFlightTracker::new());
        let id = BackendId::new("p1").expect("valid id");
        let first = tracker.begin(&id);
        let second = tracker.begin(&id);
        assert_eq!(tracker.get(&id), 2);
        drop(first);
        assert_eq!(tracker.get(&id), 1);
        drop(second);
        assert_eq!(tracker.get(&id), 0);
    }
}
