//! Core data models shared by the recommender and the updater
//!
//! Amounts are integers (millicores for CPU, bytes for memory) so that
//! repeated arithmetic never drifts. Histograms work in floating point
//! cores and bytes; the conversion helpers below are the only bridge.

use crate::cluster::LabelSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Sub};

/// Largest amount any resource can take (guards against runaway scaling)
pub const MAX_RESOURCE_AMOUNT: i64 = 100_000_000_000_000;

/// Kind of resource tracked per container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Integer amount of a resource: millicores for CPU, bytes for memory
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceAmount(pub i64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);
    pub const MAX: ResourceAmount = ResourceAmount(MAX_RESOURCE_AMOUNT);

    /// Convert a float to an amount, clamping to `[0, MAX_RESOURCE_AMOUNT]`
    pub fn from_f64(amount: f64) -> Self {
        if amount.is_nan() || amount < 0.0 {
            ResourceAmount::ZERO
        } else if amount > MAX_RESOURCE_AMOUNT as f64 {
            ResourceAmount::MAX
        } else {
            ResourceAmount(amount as i64)
        }
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for ResourceAmount {
    type Output = ResourceAmount;

    fn add(self, rhs: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_add(rhs.0).min(MAX_RESOURCE_AMOUNT))
    }
}

impl Sub for ResourceAmount {
    type Output = ResourceAmount;

    fn sub(self, rhs: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_sub(rhs.0).max(0))
    }
}

impl fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Amount of CPU (millicores) for a number of cores
pub fn cpu_amount_from_cores(cores: f64) -> ResourceAmount {
    ResourceAmount::from_f64(cores * 1000.0)
}

/// Number of cores for an amount of CPU
pub fn cores_from_cpu_amount(amount: ResourceAmount) -> f64 {
    amount.0 as f64 / 1000.0
}

/// Amount of memory for a number of bytes
pub fn memory_amount_from_bytes(bytes: f64) -> ResourceAmount {
    ResourceAmount::from_f64(bytes)
}

/// Number of bytes for an amount of memory
pub fn bytes_from_memory_amount(amount: ResourceAmount) -> f64 {
    amount.0 as f64
}

/// Multiply an amount by a factor, clamping the result
pub fn scale_resource(amount: ResourceAmount, factor: f64) -> ResourceAmount {
    ResourceAmount::from_f64(amount.0 as f64 * factor)
}

pub fn resource_amount_max(a: ResourceAmount, b: ResourceAmount) -> ResourceAmount {
    a.max(b)
}

/// Amounts per resource kind
pub type Resources = BTreeMap<ResourceKind, ResourceAmount>;

/// Pod label set
pub type Labels = BTreeMap<String, String>;

/// Unique identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// Unique identity of a container within a pod
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(pod_id: PodId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id,
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

/// Unique identity of a VPA policy object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VpaId {
    pub namespace: String,
    pub vpa_name: String,
}

impl VpaId {
    pub fn new(namespace: impl Into<String>, vpa_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vpa_name: vpa_name.into(),
        }
    }
}

impl fmt::Display for VpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.vpa_name)
    }
}

/// A single usage observation for one resource of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Start of the measurement window
    pub measure_start: DateTime<Utc>,
    pub resource: ResourceKind,
    /// Observed usage
    pub usage: ResourceAmount,
    /// Request active when the sample was observed
    pub request: ResourceAmount,
}

impl UsageSample {
    /// A sample is valid for a stream if usage is non-negative and the kind matches
    pub fn is_valid(&self, expected: ResourceKind) -> bool {
        self.usage.0 >= 0 && self.resource == expected
    }
}

/// Usage sample addressed to a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedUsageSample {
    pub container: ContainerId,
    pub sample: UsageSample,
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Pods in a terminal phase will never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Kind of the controller that owns a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    Job,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerKind::ReplicaSet => write!(f, "ReplicaSet"),
            ControllerKind::ReplicationController => write!(f, "ReplicationController"),
            ControllerKind::StatefulSet => write!(f, "StatefulSet"),
            ControllerKind::Job => write!(f, "Job"),
        }
    }
}

/// Owning controller of a pod (kind + namespace + name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControllerRef {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Declared resources of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub requests: Resources,
    #[serde(default)]
    pub limits: Resources,
}

/// Last termination of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationState {
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub const OOM_KILLED_REASON: &str = "OOMKilled";

impl TerminationState {
    pub fn is_oom_kill(&self) -> bool {
        self.reason == OOM_KILLED_REASON
    }
}

/// Runtime status of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_termination: Option<TerminationState>,
}

/// Point-in-time view of a pod as listed from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub owner: Option<ControllerRef>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    pub fn id(&self) -> PodId {
        PodId::new(self.namespace.clone(), self.name.clone())
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn container_status(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|c| c.name == name)
    }

    pub fn is_pending(&self) -> bool {
        self.phase == PodPhase::Pending
    }
}

/// Usage of all resources of one container at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetricsSnapshot {
    pub container: ContainerId,
    pub snapshot_time: DateTime<Utc>,
    pub usage: Resources,
}

/// When the updater is allowed to apply recommendations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    #[default]
    Auto,
}

impl UpdateMode {
    /// Modes under which the updater evicts pods
    pub fn allows_eviction(self) -> bool {
        matches!(self, UpdateMode::Auto | UpdateMode::Recreate)
    }
}

/// Whether a container is autoscaled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerScalingMode {
    #[default]
    Auto,
    Off,
}

/// Container name that matches every container in a resource policy
pub const DEFAULT_CONTAINER_RESOURCE_POLICY: &str = "*";

/// Per-container constraints declared on a policy object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default)]
    pub mode: Option<ContainerScalingMode>,
    #[serde(default)]
    pub min_allowed: Resources,
    #[serde(default)]
    pub max_allowed: Resources,
    #[serde(default)]
    pub controlled_resources: Option<Vec<ResourceKind>>,
}

impl ContainerResourcePolicy {
    pub fn scaling_disabled(&self) -> bool {
        self.mode == Some(ContainerScalingMode::Off)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

impl PodResourcePolicy {
    /// Policy for a container: an exact name match wins over the `*` default
    pub fn container_policy(&self, container_name: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == container_name)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == DEFAULT_CONTAINER_RESOURCE_POLICY)
            })
    }
}

/// Recommendation for a single container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendedContainerResources {
    pub container_name: String,
    pub target: Resources,
    #[serde(default)]
    pub lower_bound: Resources,
    #[serde(default)]
    pub upper_bound: Resources,
    #[serde(default)]
    pub uncapped_target: Resources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendedPodResources {
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

impl RecommendedPodResources {
    pub fn for_container(&self, container_name: &str) -> Option<&RecommendedContainerResources> {
        self.container_recommendations
            .iter()
            .find(|r| r.container_name == container_name)
    }

    pub fn is_empty(&self) -> bool {
        self.container_recommendations.is_empty()
    }
}

/// Condition types reported in a policy object's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    RecommendationProvided,
    LowConfidence,
    NoPodsMatched,
    FetchingHistory,
    ConfigUnsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpaCondition {
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Status sub-document written back by the recommender
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpaStatus {
    #[serde(default)]
    pub recommendation: Option<RecommendedPodResources>,
    #[serde(default)]
    pub conditions: Vec<VpaCondition>,
}

impl VpaStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&VpaCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Policy object as read from the external store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpaObject {
    pub namespace: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub selector: LabelSelector,
    #[serde(default)]
    pub update_mode: Option<UpdateMode>,
    #[serde(default)]
    pub resource_policy: Option<PodResourcePolicy>,
    #[serde(default)]
    pub status: VpaStatus,
}

impl VpaObject {
    pub fn id(&self) -> VpaId {
        VpaId::new(self.namespace.clone(), self.name.clone())
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode.unwrap_or_default()
    }
}
