//! Eviction plan command

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;
use vpa_lib::health::HealthRegistry;
use vpa_lib::models::VpaObject;
use vpa_lib::sources::{ClusterSource, LoggingEvictionClient, SnapshotSource};
use vpa_lib::updater::{
    controlling_vpa, EvictionConfig, PriorityConfig, Updater, UpdaterConfig,
};

use crate::output::{print_json, print_success, print_table, OutputFormat};

/// Pod the updater would evict
#[derive(Debug, Serialize, Tabled)]
pub struct PlannedEviction {
    #[tabled(rename = "Namespace")]
    pub namespace: String,
    #[tabled(rename = "Pod")]
    pub pod: String,
    #[tabled(rename = "VPA")]
    pub vpa: String,
}

/// Result of one dry-run updater pass
#[derive(Debug, Serialize)]
pub struct EvictionPlan {
    pub vpas: usize,
    pub controlled_pods: usize,
    pub evictions: Vec<PlannedEviction>,
}

pub fn plan_config(tolerance: f64, min_replicas: u32, min_change_priority: f64) -> UpdaterConfig {
    UpdaterConfig {
        priority: PriorityConfig {
            min_change_priority,
            ..Default::default()
        },
        eviction: EvictionConfig {
            min_replicas,
            tolerance,
        },
        ..Default::default()
    }
}

/// Run the updater once against the snapshot with a recording eviction client
pub async fn plan_evictions(
    snapshot: &Path,
    config: UpdaterConfig,
    now: DateTime<Utc>,
) -> Result<EvictionPlan> {
    let source = Arc::new(SnapshotSource::from_file(snapshot));
    let client = Arc::new(LoggingEvictionClient::new());
    let mut updater = Updater::new(
        config,
        source.clone(),
        source.clone(),
        client.clone(),
        HealthRegistry::new(),
    );
    let stats = updater.run_once_at(now).await?;

    let vpas: Vec<VpaObject> = source
        .list_vpas()
        .await?
        .into_iter()
        .filter(|vpa| vpa.update_mode().allows_eviction())
        .collect();
    let pods = source.list_pods().await?;

    let evictions = client
        .evicted()
        .await
        .into_iter()
        .map(|id| {
            let vpa = pods
                .iter()
                .find(|pod| pod.id() == id)
                .and_then(|pod| controlling_vpa(pod, &vpas))
                .map(|vpa| vpa.name.clone())
                .unwrap_or_else(|| "-".to_string());
            PlannedEviction {
                namespace: id.namespace,
                pod: id.pod_name,
                vpa,
            }
        })
        .collect();

    Ok(EvictionPlan {
        vpas: stats.vpas,
        controlled_pods: stats.controlled_pods,
        evictions,
    })
}

/// Print the pods the updater would evict right now
pub async fn show_eviction_plan(
    snapshot: &Path,
    config: UpdaterConfig,
    format: OutputFormat,
) -> Result<()> {
    let plan = plan_evictions(snapshot, config, Utc::now()).await?;

    match format {
        OutputFormat::Json => print_json(&plan)?,
        OutputFormat::Table => {
            if plan.evictions.is_empty() {
                print_success(&format!(
                    "No evictions needed ({} VPA objects, {} pods)",
                    plan.vpas, plan.controlled_pods
                ));
                return Ok(());
            }
            let total = plan.evictions.len();
            print_table(plan.evictions);
            println!(
                "\nTotal: {} of {} controlled pods would be evicted",
                total, plan.controlled_pods
            );
        }
    }

    Ok(())
}
