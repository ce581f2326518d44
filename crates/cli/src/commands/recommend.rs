//! Offline recommendation command

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;
use tokio::sync::mpsc;
use vpa_lib::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use vpa_lib::health::HealthRegistry;
use vpa_lib::models::{RecommendedPodResources, ResourceKind};
use vpa_lib::recommender::{Recommender, RecommenderConfig, RecommenderSources};
use vpa_lib::sources::{MemoryStatusWriter, SnapshotSource};

use crate::output::{format_resource, print_info, print_json, print_table, print_warning, OutputFormat};

/// Recommendation computed for one policy object
#[derive(Debug, Serialize)]
pub struct VpaRecommendation {
    pub namespace: String,
    pub name: String,
    pub matched_pods: usize,
    pub recommendation: Option<RecommendedPodResources>,
}

/// Row for recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "VPA")]
    vpa: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "CPU Target")]
    cpu_target: String,
    #[tabled(rename = "CPU Range")]
    cpu_range: String,
    #[tabled(rename = "Mem Target")]
    memory_target: String,
    #[tabled(rename = "Mem Range")]
    memory_range: String,
}

/// Run one recommender pass over the snapshot without touching any file
///
/// Checkpoints are copied into memory first so the run can neither
/// write nor garbage-collect them on disk.
pub async fn compute_recommendations(
    snapshot: &Path,
    checkpoint_dir: &Path,
    history: bool,
    now: DateTime<Utc>,
) -> Result<Vec<VpaRecommendation>> {
    let source = Arc::new(SnapshotSource::from_file(snapshot));
    // Fail early with the snapshot's own error instead of a degraded run
    source.snapshot().await?;

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let on_disk = FileCheckpointStore::new(checkpoint_dir)
        .list(None)
        .await
        .context("Failed to read checkpoints")?;
    for checkpoint in &on_disk {
        checkpoints.save(checkpoint).await?;
    }

    let (_oom_tx, oom_rx) = mpsc::channel(1);
    let mut recommender = Recommender::new(
        RecommenderConfig::default(),
        RecommenderSources {
            cluster: source.clone(),
            metrics: source.clone(),
            checkpoints,
            status: Arc::new(MemoryStatusWriter::new()),
        },
        oom_rx,
        HealthRegistry::new(),
    );
    recommender.init(now).await;
    if history {
        recommender.init_from_history(source.as_ref(), now).await;
    }
    recommender.run_once_at(now).await;

    let mut results: Vec<VpaRecommendation> = recommender
        .cluster_state()
        .vpas()
        .map(|vpa| VpaRecommendation {
            namespace: vpa.id.namespace.clone(),
            name: vpa.id.vpa_name.clone(),
            matched_pods: vpa.pod_count,
            recommendation: vpa.recommendation.clone().filter(|r| !r.is_empty()),
        })
        .collect();
    results.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    Ok(results)
}

/// Compute and print recommendations
pub async fn show_recommendations(
    snapshot: &Path,
    checkpoint_dir: &Path,
    namespace: Option<String>,
    history: bool,
    format: OutputFormat,
) -> Result<()> {
    let results: Vec<VpaRecommendation> =
        compute_recommendations(snapshot, checkpoint_dir, history, Utc::now())
            .await?
            .into_iter()
            .filter(|r| namespace.as_ref().map(|ns| &r.namespace == ns).unwrap_or(true))
            .collect();

    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Table => {
            if results.is_empty() {
                print_warning("No VPA objects found");
                return Ok(());
            }

            let mut rows = Vec::new();
            let mut pending = 0;
            for result in &results {
                let Some(recommendation) = &result.recommendation else {
                    pending += 1;
                    continue;
                };
                for container in &recommendation.container_recommendations {
                    rows.push(RecommendationRow {
                        namespace: result.namespace.clone(),
                        vpa: result.name.clone(),
                        container: container.container_name.clone(),
                        cpu_target: format_resource(&container.target, ResourceKind::Cpu),
                        cpu_range: format!(
                            "{} - {}",
                            format_resource(&container.lower_bound, ResourceKind::Cpu),
                            format_resource(&container.upper_bound, ResourceKind::Cpu)
                        ),
                        memory_target: format_resource(&container.target, ResourceKind::Memory),
                        memory_range: format!(
                            "{} - {}",
                            format_resource(&container.lower_bound, ResourceKind::Memory),
                            format_resource(&container.upper_bound, ResourceKind::Memory)
                        ),
                    });
                }
            }

            if rows.is_empty() {
                print_warning("No recommendations yet");
            } else {
                print_table(rows);
            }
            println!("\nTotal: {} VPA objects", results.len());
            if pending > 0 {
                print_info(&format!("{} without a recommendation", pending));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use vpa_lib::cluster::LabelSelector;
    use vpa_lib::models::{
        ContainerId, ContainerMetricsSnapshot, ContainerSpec, PodPhase, PodSnapshot,
        ResourceAmount, Resources, VpaObject, VpaStatus,
    };
    use vpa_lib::sources::ClusterSnapshot;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn resources(cpu: i64, memory: i64) -> Resources {
        [
            (ResourceKind::Cpu, ResourceAmount(cpu)),
            (ResourceKind::Memory, ResourceAmount(memory)),
        ]
        .into_iter()
        .collect()
    }

    fn write_snapshot(dir: &Path) -> std::path::PathBuf {
        let pod = PodSnapshot {
            namespace: "ns".to_string(),
            name: "web-1".to_string(),
            labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
            phase: PodPhase::Running,
            owner: None,
            start_time: Some(now() - Duration::hours(1)),
            deletion_timestamp: None,
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                requests: resources(200, 100 << 20),
                limits: Resources::new(),
            }],
            container_statuses: Vec::new(),
        };
        let snapshot = ClusterSnapshot {
            vpas: vec![
                VpaObject {
                    namespace: "ns".to_string(),
                    name: "web".to_string(),
                    created_at: now() - Duration::days(1),
                    selector: LabelSelector::from_labels(&[("app", "web")]),
                    update_mode: None,
                    resource_policy: None,
                    status: VpaStatus::default(),
                },
                VpaObject {
                    namespace: "ns".to_string(),
                    name: "idle".to_string(),
                    created_at: now() - Duration::days(1),
                    selector: LabelSelector::from_labels(&[("app", "idle")]),
                    update_mode: None,
                    resource_policy: None,
                    status: VpaStatus::default(),
                },
            ],
            metrics: vec![ContainerMetricsSnapshot {
                container: ContainerId::new(pod.id(), "app"),
                snapshot_time: now(),
                usage: resources(500, 200_000_000),
            }],
            pods: vec![pod],
            ..Default::default()
        };
        let path = dir.join("cluster.json");
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_recommendations_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(dir.path());
        let checkpoints = dir.path().join("checkpoints");

        let results = compute_recommendations(&snapshot, &checkpoints, false, now())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "idle");
        assert!(results[0].recommendation.is_none());

        let web = &results[1];
        assert_eq!(web.matched_pods, 1);
        let recommendation = web.recommendation.as_ref().unwrap();
        assert_eq!(recommendation.container_recommendations.len(), 1);
        assert_eq!(recommendation.container_recommendations[0].container_name, "app");

        // Nothing is written back
        assert!(!checkpoints.exists());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result =
            compute_recommendations(&dir.path().join("absent.json"), dir.path(), false, now())
                .await;
        assert!(result.is_err());
    }
}
