//! # Gateway Routing
//!
//! Resolution of logical model names to ordered backend candidates:
//! - Model registry with atomically swapped catalog snapshots
//! - Fallback chain construction and validation
//! - Primary selection strategies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod strategy;

pub use registry::{ModelCatalog, ModelDefinition, ModelRegistry};
pub use strategy::{
    create_strategy, FixedStrategy, InFlightGuard, InFlightTracker, LeastBusyStrategy, LoadView,
    RoutingStrategy, UsageBasedStrategy,
};
