//! Scenario tests for the cluster state

use super::*;
use crate::models::{
    ConditionType, ContainerId, KeyedUsageSample, Labels, PodId, PodPhase, RecommendedPodResources,
    ResourceAmount, ResourceKind, Resources, UsageSample, VpaCondition, VpaId, VpaObject,
    VpaStatus,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn web_labels() -> Labels {
    labels(&[("app", "web")])
}

fn vpa_object(name: &str, selector: LabelSelector) -> VpaObject {
    VpaObject {
        namespace: "ns".to_string(),
        name: name.to_string(),
        created_at: t0(),
        selector,
        update_mode: None,
        resource_policy: None,
        status: VpaStatus::default(),
    }
}

fn new_cluster() -> ClusterState {
    ClusterState::new(AggregationsConfig::default(), Duration::hours(1))
}

fn add_pod(cluster: &mut ClusterState, name: &str, labels: &Labels) -> ContainerId {
    let pod = PodId::new("ns", name);
    cluster.add_or_update_pod(pod.clone(), labels, PodPhase::Running, t0());
    let container = ContainerId::new(pod, "app");
    let mut request = Resources::new();
    request.insert(ResourceKind::Cpu, ResourceAmount(500));
    cluster
        .add_or_update_container(&container, request, t0())
        .unwrap();
    container
}

fn cpu_sample(container: &ContainerId, at: DateTime<Utc>) -> KeyedUsageSample {
    KeyedUsageSample {
        container: container.clone(),
        sample: UsageSample {
            measure_start: at,
            resource: ResourceKind::Cpu,
            usage: ResourceAmount(250),
            request: ResourceAmount(500),
        },
    }
}

#[test]
fn test_history_survives_pod_replacement() {
    let mut cluster = new_cluster();
    let vpa_id = VpaId::new("ns", "web-vpa");
    cluster
        .add_or_update_vpa(&vpa_object("web-vpa", LabelSelector::from_labels(&[("app", "web")])))
        .unwrap();

    let first = add_pod(&mut cluster, "web-abc", &web_labels());
    for minute in 0..5 {
        assert!(cluster
            .add_sample(&cpu_sample(&first, t0() + Duration::minutes(minute)))
            .unwrap());
    }
    cluster.delete_pod(&first.pod_id);

    let second = add_pod(&mut cluster, "web-def", &web_labels());
    assert_eq!(
        cluster.container(&second).unwrap().aggregation_key(),
        &AggregationKey::new("ns", "app", cluster.pod(&second.pod_id).unwrap().label_set())
    );
    assert!(cluster
        .add_sample(&cpu_sample(&second, t0() + Duration::minutes(10)))
        .unwrap());

    assert_eq!(cluster.aggregates().len(), 1);
    let by_name = cluster.aggregate_state_by_container_name(&vpa_id).unwrap();
    assert_eq!(by_name["app"].total_samples_count(), 6);
}

#[test]
fn test_matching_is_independent_of_creation_order() {
    let selector = LabelSelector::from_labels(&[("app", "web")]);

    let mut vpa_first = new_cluster();
    vpa_first
        .add_or_update_vpa(&vpa_object("web-vpa", selector.clone()))
        .unwrap();
    add_pod(&mut vpa_first, "web-1", &web_labels());

    let mut pod_first = new_cluster();
    add_pod(&mut pod_first, "web-1", &web_labels());
    pod_first
        .add_or_update_vpa(&vpa_object("web-vpa", selector))
        .unwrap();

    let id = VpaId::new("ns", "web-vpa");
    for cluster in [&vpa_first, &pod_first] {
        let vpa = cluster.vpa(&id).unwrap();
        assert_eq!(vpa.aggregate_keys().count(), 1);
        assert_eq!(vpa.pod_count, 1);
        let key = vpa.aggregate_keys().next().unwrap();
        assert!(cluster.aggregates()[key].is_under_vpa);
    }
}

#[test]
fn test_relabeled_pod_routes_to_new_aggregate() {
    let mut cluster = new_cluster();
    let container = add_pod(&mut cluster, "web-1", &web_labels());
    cluster
        .add_sample(&cpu_sample(&container, t0()))
        .unwrap();
    let old_key = cluster.container(&container).unwrap().aggregation_key().clone();

    cluster.add_or_update_pod(
        container.pod_id.clone(),
        &labels(&[("app", "web"), ("version", "2")]),
        PodPhase::Running,
        t0(),
    );
    let new_key = cluster.container(&container).unwrap().aggregation_key().clone();
    assert_ne!(old_key, new_key);

    cluster
        .add_sample(&cpu_sample(&container, t0() + Duration::minutes(1)))
        .unwrap();
    assert_eq!(cluster.aggregates()[&old_key].total_samples_count(), 1);
    assert_eq!(cluster.aggregates()[&new_key].total_samples_count(), 1);
}

#[test]
fn test_selector_change_relinks_aggregates() {
    let mut cluster = new_cluster();
    add_pod(&mut cluster, "web-1", &web_labels());
    add_pod(&mut cluster, "db-1", &labels(&[("app", "db")]));
    let id = VpaId::new("ns", "vpa");

    cluster
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::from_labels(&[("app", "web")])))
        .unwrap();
    let web_key = cluster.vpa(&id).unwrap().aggregate_keys().next().cloned().unwrap();

    cluster
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::from_labels(&[("app", "db")])))
        .unwrap();
    let vpa = cluster.vpa(&id).unwrap();
    assert_eq!(vpa.aggregate_keys().count(), 1);
    assert!(!vpa.uses_aggregation(&web_key));
    assert!(!cluster.aggregates()[&web_key].is_under_vpa);
}

#[test]
fn test_recommendation_read_only_when_provided() {
    let mut cluster = new_cluster();
    let mut object = vpa_object("vpa", LabelSelector::default());
    object.status.recommendation = Some(RecommendedPodResources::default());
    cluster.add_or_update_vpa(&object).unwrap();
    let id = VpaId::new("ns", "vpa");
    assert!(cluster.vpa(&id).unwrap().recommendation.is_none());

    object.status.conditions.push(VpaCondition {
        condition_type: ConditionType::RecommendationProvided,
        status: true,
        reason: String::new(),
        message: String::new(),
        last_transition_time: t0(),
    });
    cluster.add_or_update_vpa(&object).unwrap();
    assert!(cluster.vpa(&id).unwrap().recommendation.is_some());
}

#[test]
fn test_delete_vpa_marks_aggregates_not_autoscaled() {
    let mut cluster = new_cluster();
    cluster
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::default()))
        .unwrap();
    let container = add_pod(&mut cluster, "web-1", &web_labels());
    let key = cluster.container(&container).unwrap().aggregation_key().clone();
    assert!(cluster.aggregates()[&key].is_under_vpa);

    cluster.delete_vpa(&VpaId::new("ns", "vpa")).unwrap();
    assert!(!cluster.aggregates()[&key].is_under_vpa);
}

#[test]
fn test_gc_keeps_aggregates_of_live_pods() {
    let mut cluster = new_cluster();
    cluster
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::default()))
        .unwrap();
    let live = add_pod(&mut cluster, "web-1", &web_labels());
    let finished = add_pod(&mut cluster, "batch-1", &labels(&[("app", "batch")]));
    cluster.add_sample(&cpu_sample(&live, t0())).unwrap();
    cluster.add_sample(&cpu_sample(&finished, t0())).unwrap();
    cluster.add_or_update_pod(
        finished.pod_id.clone(),
        &labels(&[("app", "batch")]),
        PodPhase::Succeeded,
        t0(),
    );
    let finished_key = cluster.container(&finished).unwrap().aggregation_key().clone();

    // Not yet expired
    assert_eq!(cluster.garbage_collect(t0() + Duration::days(7)), 0);

    assert_eq!(cluster.garbage_collect(t0() + Duration::days(9)), 1);
    assert!(!cluster.aggregates().contains_key(&finished_key));
    let vpa = cluster.vpa(&VpaId::new("ns", "vpa")).unwrap();
    assert!(!vpa.uses_aggregation(&finished_key));
    assert_eq!(vpa.aggregate_keys().count(), 1);
}

#[test]
fn test_empty_aggregate_expires_from_its_creation_time() {
    let mut cluster = new_cluster();
    let created = t0() + Duration::days(1);
    let pod = PodId::new("ns", "batch-1");
    cluster.add_or_update_pod(pod.clone(), &web_labels(), PodPhase::Running, created);
    let container = ContainerId::new(pod.clone(), "app");
    cluster
        .add_or_update_container(&container, Resources::new(), created)
        .unwrap();
    cluster.add_or_update_pod(pod, &web_labels(), PodPhase::Succeeded, created);

    let key = cluster.container(&container).unwrap().aggregation_key().clone();
    assert_eq!(cluster.aggregates()[&key].creation_time(), created);
    assert_eq!(cluster.garbage_collect(created + Duration::days(7)), 0);
    assert_eq!(cluster.garbage_collect(created + Duration::days(8)), 1);
}

#[test]
fn test_collected_aggregate_recreated_on_next_sample() {
    let mut cluster = new_cluster();
    let container = add_pod(&mut cluster, "job-1", &web_labels());
    cluster.add_sample(&cpu_sample(&container, t0())).unwrap();
    cluster.add_or_update_pod(container.pod_id.clone(), &web_labels(), PodPhase::Failed, t0());
    assert_eq!(cluster.garbage_collect(t0() + Duration::days(9)), 1);
    assert!(cluster.aggregates().is_empty());

    assert!(cluster
        .add_sample(&cpu_sample(&container, t0() + Duration::days(9)))
        .unwrap());
    let key = cluster.container(&container).unwrap().aggregation_key().clone();
    assert_eq!(cluster.aggregates()[&key].total_samples_count(), 1);
}

#[test]
fn test_oom_routed_to_memory_histogram() {
    let mut cluster = new_cluster();
    let container = add_pod(&mut cluster, "web-1", &web_labels());
    assert!(cluster
        .record_oom(&container, t0(), ResourceAmount(512 * 1024 * 1024))
        .unwrap());

    let key = cluster.container(&container).unwrap().aggregation_key().clone();
    let aggregate = &cluster.aggregates()[&key];
    assert!(!aggregate.memory_peaks_histogram().is_empty());
    assert!(aggregate.is_empty());
}

#[test]
fn test_checkpointed_state_merged_into_container_view() {
    let mut source = new_cluster();
    let id = VpaId::new("ns", "vpa");
    source
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::default()))
        .unwrap();
    let container = add_pod(&mut source, "web-1", &web_labels());
    for minute in 0..3 {
        source
            .add_sample(&cpu_sample(&container, t0() + Duration::minutes(minute)))
            .unwrap();
    }
    let checkpoint = source.aggregate_state_by_container_name(&id).unwrap()["app"]
        .save_to_checkpoint(t0() + Duration::hours(1));

    let mut restored = new_cluster();
    restored
        .add_or_update_vpa(&vpa_object("vpa", LabelSelector::default()))
        .unwrap();
    restored
        .set_vpa_checkpoint(&id, "app", &checkpoint, t0())
        .unwrap();
    let by_name = restored.aggregate_state_by_container_name(&id).unwrap();
    assert_eq!(by_name["app"].total_samples_count(), 3);

    let missing = VpaId::new("ns", "other");
    assert!(restored
        .set_vpa_checkpoint(&missing, "app", &checkpoint, t0())
        .is_err());
}
