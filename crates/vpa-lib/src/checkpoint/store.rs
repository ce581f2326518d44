//! Checkpoint store backends

use super::{CheckpointStore, VpaCheckpoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One JSON file per checkpoint under `<root>/<namespace>/<name>.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{}.json", name))
    }

    async fn list_namespace(&self, dir: &Path, out: &mut Vec<VpaCheckpoint>) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read directory {:?}", dir))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {:?}", dir))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
            match serde_json::from_slice::<VpaCheckpoint>(&data) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file")
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<VpaCheckpoint>> {
        let mut checkpoints = Vec::new();
        match namespace {
            Some(ns) => self.list_namespace(&self.root.join(ns), &mut checkpoints).await?,
            None => {
                let mut namespaces = match tokio::fs::read_dir(&self.root).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(checkpoints),
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to read directory {:?}", self.root))
                    }
                };
                while let Some(entry) = namespaces
                    .next_entry()
                    .await
                    .with_context(|| format!("Failed to list {:?}", self.root))?
                {
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        self.list_namespace(&entry.path(), &mut checkpoints).await?;
                    }
                }
            }
        }
        checkpoints.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(checkpoints)
    }

    async fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.namespace, &checkpoint.name);
        write_json_atomic(&path, checkpoint).await?;
        debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let path = self.path_for(namespace, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete checkpoint {:?}", path)),
        }
    }
}

/// Serialize `value` to `path` through a temp file and rename
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec_pretty(value).context("Failed to serialize record")?;

    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(&json)
        .await
        .context("Failed to write record data")?;
    file.sync_all().await.context("Failed to sync record file")?;

    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
    Ok(())
}

/// Checkpoints held in memory, keyed by (namespace, name)
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<(String, String), VpaCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<VpaCheckpoint> {
        self.checkpoints
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<VpaCheckpoint>> {
        let mut checkpoints: Vec<VpaCheckpoint> = self
            .checkpoints
            .iter()
            .filter(|r| namespace.map_or(true, |ns| r.key().0 == ns))
            .map(|r| r.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(checkpoints)
    }

    async fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()> {
        self.checkpoints.insert(
            (checkpoint.namespace.clone(), checkpoint.name.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.checkpoints
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{AggregateContainerState, AggregationsConfig};
    use crate::models::VpaId;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn checkpoint(namespace: &str, vpa: &str, container: &str) -> VpaCheckpoint {
        let now = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let state = AggregateContainerState::new(&AggregationsConfig::default(), now);
        VpaCheckpoint::new(
            &VpaId::new(namespace, vpa),
            container,
            state.save_to_checkpoint(now),
        )
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save(&checkpoint("ns-a", "web", "app")).await.unwrap();
        store.save(&checkpoint("ns-a", "web", "sidecar")).await.unwrap();
        store.save(&checkpoint("ns-b", "db", "app")).await.unwrap();

        assert!(dir.path().join("ns-a").join("web-app.json").exists());
        assert!(!dir.path().join("ns-a").join("web-app.json.tmp").exists());

        let in_a = store.list(Some("ns-a")).await.unwrap();
        let names: Vec<_> = in_a.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["web-app", "web-sidecar"]);
        assert_eq!(in_a[0], checkpoint("ns-a", "web", "app"));

        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_file_store_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("ns", "web", "app")).await.unwrap();

        store.delete("ns", "web-app").await.unwrap();
        store.delete("ns", "web-app").await.unwrap();
        assert!(store.list(Some("ns")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_missing_root_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("absent"));
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(store.list(Some("ns")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("ns", "web", "app")).await.unwrap();
        std::fs::write(dir.path().join("ns").join("broken.json"), b"{not json").unwrap();

        assert_eq!(store.list(Some("ns")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        store.save(&checkpoint("ns-a", "web", "app")).await.unwrap();
        store.save(&checkpoint("ns-b", "web", "app")).await.unwrap();
        store.save(&checkpoint("ns-b", "web", "app")).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.list(Some("ns-b")).await.unwrap().len(), 1);
        store.delete("ns-a", "web-app").await.unwrap();
        assert!(store.get("ns-a", "web-app").is_none());
        assert!(store.get("ns-b", "web-app").is_some());
    }
}
