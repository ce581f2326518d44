//! Cluster state model
//!
//! Tracks pods, containers and policy objects, and groups usage samples
//! under aggregation keys so history survives pod replacement:
//! - `labels`: selectors and the label-set intern table
//! - `aggregate`: per-key usage history and its checkpoint form
//! - `container`: per-container sample filtering and memory peak windows
//! - `vpa`: in-memory policy objects
//! - `state`: the cluster-wide owner of all of the above

mod aggregate;
mod container;
mod labels;
mod state;
mod vpa;

pub use aggregate::{
    AggregateContainerState, AggregateStateCheckpoint, AggregationKey, AggregationsConfig,
    SampleAggregator, CHECKPOINT_VERSION,
};
pub use container::ContainerState;
pub use labels::{LabelRequirement, LabelSelector, LabelSetId, LabelSetInterner, SelectorOperator};
pub use state::{ClusterState, PodState};
pub use vpa::{AggregateStateMap, ContainerNameToAggregateStateMap, Vpa};

#[cfg(test)]
mod tests;
