//! Loading manifests into the in-memory store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use choreo_core::api::{Deliverable, Runnable, Workload};
use choreo_core::{DynamicObject, Resource, TypeMeta};
use choreo_reconciler::InMemorySubstrate;
use serde_json::{json, Value};
use tracing::{debug, info};

/// YAML files directly under `dir`, in name order.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read manifest directory {}", dir.display()))?;
    let mut files = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    files.retain(|path| {
        path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
    });
    files.sort();
    Ok(files)
}

/// Every object in every YAML document under `dir`.
///
/// # Errors
///
/// Fails on unreadable files and on documents that are not objects.
pub fn load_dir(dir: &Path) -> Result<Vec<DynamicObject>> {
    manifest_files(dir)?
        .into_iter()
        .map(|path| {
            let input = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let objects = DynamicObject::from_yaml_documents(&input)
                .with_context(|| format!("Invalid manifest in {}", path.display()))?;
            debug!(file = %path.display(), objects = objects.len(), "Loaded manifest");
            Ok(objects)
        })
        .collect::<Result<Vec<_>>>()
        .map(|nested| nested.into_iter().flatten().collect())
}

/// Seed `objects` into `substrate`.
///
/// # Errors
///
/// Fails on the first object the store rejects.
pub async fn seed(substrate: &InMemorySubstrate, objects: Vec<DynamicObject>) -> Result<usize> {
    let count = objects.len();
    for object in objects {
        let kind = object.kind.clone();
        let name = object.metadata.name.clone();
        substrate
            .seed(object)
            .await
            .with_context(|| format!("Failed to load {kind} '{name}'"))?;
    }
    info!(objects = count, "Manifests loaded");
    Ok(count)
}

/// The status of every intent, one YAML document each.
///
/// # Errors
///
/// Fails if a status cannot be rendered.
pub async fn intent_statuses(substrate: &InMemorySubstrate) -> Result<String> {
    let kinds: [TypeMeta; 3] = [Workload::type_meta(), Deliverable::type_meta(), Runnable::type_meta()];
    let mut documents = Vec::new();
    for type_meta in &kinds {
        for object in substrate.all(type_meta).await {
            let summary: Value = json!({
                "kind": object.kind,
                "namespace": object.metadata.namespace,
                "name": object.metadata.name,
                "status": object.status().cloned().unwrap_or(Value::Null),
            });
            documents.push(serde_yaml::to_string(&summary).context("Failed to render status")?);
        }
    }
    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    const WORKLOAD: &str = "\
apiVersion: carto.run/v1alpha1
kind: Workload
metadata:
  name: app
  namespace: dev
  labels:
    app: web
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: default
  namespace: dev
";

    #[test]
    fn test_load_dir_reads_yaml_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b-workload.yaml"), WORKLOAD).unwrap();
        std::fs::write(
            dir.path().join("a-chain.yml"),
            "apiVersion: carto.run/v1alpha1\nkind: ClusterSupplyChain\nmetadata:\n  name: chain\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

        let objects = load_dir(dir.path()).unwrap();
        let kinds: Vec<&str> = objects.iter().map(|o| o.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ClusterSupplyChain", "Workload", "ServiceAccount"]);
    }

    #[test]
    fn test_load_dir_names_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "kind: [unterminated").unwrap();

        let err = load_dir(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("broken.yaml"));
    }

    #[test]
    fn test_missing_dir_is_error() {
        assert!(load_dir(Path::new("/nonexistent/choreo-manifests")).is_err());
    }

    #[tokio::test]
    async fn test_statuses_cover_intents_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("all.yaml"), WORKLOAD).unwrap();
        let substrate = InMemorySubstrate::new();
        let loaded = seed(&substrate, load_dir(dir.path()).unwrap()).await.unwrap();
        assert_eq!(loaded, 2);

        let printed = intent_statuses(&substrate).await.unwrap();
        assert!(printed.contains("kind: Workload"));
        assert!(printed.contains("name: app"));
        assert!(!printed.contains("ServiceAccount"));
    }
}
