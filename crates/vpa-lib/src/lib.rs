//! Vertical resource recommender library
//!
//! This crate provides the core functionality for:
//! - Decaying usage histograms and aggregated container history
//! - Resource estimation and recommendation capping
//! - Checkpointing aggregated history across restarts
//! - The recommender and updater control loops
//! - Health checks and observability

pub mod capping;
pub mod checkpoint;
pub mod cluster;
pub mod error;
pub mod estimator;
pub mod health;
pub mod histogram;
pub mod models;
pub mod observability;
pub mod recommender;
pub mod sources;
pub mod updater;

pub use error::{CheckpointError, ClusterStateError, EvictionError, HistogramError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
