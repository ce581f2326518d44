//! Checkpoint inspection commands

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;
use vpa_lib::checkpoint::{CheckpointStore, FileCheckpointStore, VpaCheckpoint};
use vpa_lib::cluster::{AggregateContainerState, AggregationsConfig};
use vpa_lib::estimator::{confidence, ResourceEstimator};
use vpa_lib::models::{ResourceKind, Resources};

use crate::output::{
    color_confidence, format_resource, print_info, print_json, print_table, print_warning,
    OutputFormat,
};

const PERCENTILES: [f64; 4] = [0.5, 0.9, 0.95, 0.99];

/// Row for checkpoints table
#[derive(Tabled)]
struct CheckpointRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "VPA")]
    vpa: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Samples")]
    samples: u64,
    #[tabled(rename = "Last Sample")]
    last_sample: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Row for percentile table
#[derive(Tabled)]
struct PercentileRow {
    #[tabled(rename = "Percentile")]
    percentile: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
}

/// Usage distribution restored from one checkpoint
#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint: VpaCheckpoint,
    /// Days of history backing the histograms
    pub confidence: f64,
    pub percentiles: Vec<(f64, Resources)>,
}

/// Restore a checkpoint's histograms and read their percentiles
pub fn summarize(checkpoint: VpaCheckpoint) -> Result<CheckpointSummary> {
    let mut state = AggregateContainerState::new(
        &AggregationsConfig::default(),
        checkpoint.status.last_update_time,
    );
    state
        .load_from_checkpoint(&checkpoint.status)
        .with_context(|| format!("Cannot restore checkpoint {}", checkpoint.name))?;

    let percentiles = PERCENTILES
        .iter()
        .map(|&p| (p, ResourceEstimator::percentile(p, p).estimate(&state)))
        .collect();

    Ok(CheckpointSummary {
        confidence: confidence(&state),
        percentiles,
        checkpoint,
    })
}

fn parse_checkpoint_ref(reference: &str) -> Result<(&str, &str)> {
    match reference.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace, name))
        }
        _ => Err(anyhow!(
            "Invalid checkpoint '{}', expected namespace/name",
            reference
        )),
    }
}

/// List checkpoints
pub async fn list_checkpoints(
    checkpoint_dir: &Path,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let store = FileCheckpointStore::new(checkpoint_dir);
    let checkpoints = store.list(namespace.as_deref()).await?;

    match format {
        OutputFormat::Json => print_json(&checkpoints)?,
        OutputFormat::Table => {
            if checkpoints.is_empty() {
                print_warning("No checkpoints found");
                return Ok(());
            }

            let rows: Vec<CheckpointRow> = checkpoints
                .iter()
                .map(|c| CheckpointRow {
                    namespace: c.namespace.clone(),
                    name: c.name.clone(),
                    vpa: c.vpa_name.clone(),
                    container: c.container_name.clone(),
                    samples: c.status.total_samples_count,
                    last_sample: c
                        .status
                        .last_sample_start
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    updated: c.status.last_update_time.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();

            print_table(rows);
            println!("\nTotal: {} checkpoints", checkpoints.len());
        }
    }

    Ok(())
}

/// Show the usage percentiles stored in one checkpoint
pub async fn inspect_checkpoint(
    checkpoint_dir: &Path,
    reference: &str,
    format: OutputFormat,
) -> Result<()> {
    let (namespace, name) = parse_checkpoint_ref(reference)?;
    let store = FileCheckpointStore::new(checkpoint_dir);
    let checkpoint = store
        .list(Some(namespace))
        .await?
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow!("Checkpoint {}/{} not found", namespace, name))?;

    let summary = summarize(checkpoint)?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            let checkpoint = &summary.checkpoint;
            print_info(&format!(
                "{}/{} (VPA {}, container {})",
                checkpoint.namespace, checkpoint.name, checkpoint.vpa_name, checkpoint.container_name
            ));
            println!(
                "Samples: {}   Confidence (days): {}",
                checkpoint.status.total_samples_count,
                color_confidence(summary.confidence)
            );

            let rows: Vec<PercentileRow> = summary
                .percentiles
                .iter()
                .map(|(p, resources)| PercentileRow {
                    percentile: format!("p{}", (p * 100.0).round()),
                    cpu: format_resource(resources, ResourceKind::Cpu),
                    memory: format_resource(resources, ResourceKind::Memory),
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use vpa_lib::cluster::SampleAggregator;
    use vpa_lib::models::{ResourceAmount, UsageSample, VpaId};

    #[test]
    fn test_parse_checkpoint_ref() {
        assert_eq!(parse_checkpoint_ref("ns/web-app").unwrap(), ("ns", "web-app"));
        assert!(parse_checkpoint_ref("web-app").is_err());
        assert!(parse_checkpoint_ref("ns/").is_err());
    }

    #[test]
    fn test_summarize_restores_percentiles() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut state = AggregateContainerState::new(&AggregationsConfig::default(), start);
        for minute in 0..60 {
            state.add_sample(&UsageSample {
                measure_start: start + Duration::minutes(minute),
                usage: ResourceAmount(500),
                request: ResourceAmount(1000),
                resource: ResourceKind::Cpu,
            });
        }
        let checkpoint = VpaCheckpoint::new(
            &VpaId::new("ns", "web"),
            "app",
            state.save_to_checkpoint(start + Duration::hours(1)),
        );

        let summary = summarize(checkpoint).unwrap();
        assert_eq!(summary.percentiles.len(), PERCENTILES.len());
        assert!(summary.confidence > 0.0);
        let (_, p90) = &summary.percentiles[1];
        // End of the bucket holding the 0.5 core samples
        let cpu = p90.get(&ResourceKind::Cpu).unwrap().value();
        assert!((500..=540).contains(&cpu), "p90 cpu {}", cpu);
    }
}
