//! Shared per-stage outcome types.
//!
//! Every stage collects per-item failures instead of aborting, then reports a
//! [`RunStatus`]. Failures can be persisted as a [`FailureManifest`] and fed back
//! into a follow-up run that only retries those items.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One recoverable per-item failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// File path, transcript stem or persona id, depending on the stage
    pub item: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            item: item.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    SuccessWithWarnings,
    Failed,
}

impl RunStatus {
    /// `Failed` only when nothing succeeded although there was work to do
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => RunStatus::Success,
            (0, _) => RunStatus::Failed,
            _ => RunStatus::SuccessWithWarnings,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Generate,
    Import,
    AutoTag,
    LoadTags,
}

/// Persisted list of per-item failures for a stage run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureManifest {
    pub stage: Stage,
    pub generated_at: DateTime<Utc>,
    pub failures: Vec<ItemFailure>,
}

impl FailureManifest {
    pub fn new(stage: Stage, failures: Vec<ItemFailure>) -> Self {
        Self {
            stage,
            generated_at: Utc::now(),
            failures,
        }
    }

    pub fn items(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.item.clone()).collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize failure manifest")?;
        write_atomic(path, json.as_bytes())
            .with_context(|| format!("Failed to write failure manifest to {:?}", path))
    }

    /// Write the manifest when there are failures, otherwise remove a stale one
    /// left at `path` by an earlier run. Returns the path when one was written.
    pub fn write_or_clear(
        stage: Stage,
        failures: &[ItemFailure],
        path: &Path,
    ) -> Result<Option<PathBuf>> {
        if failures.is_empty() {
            if path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove stale manifest {:?}", path))?;
                tracing::debug!("Removed stale failure manifest {:?}", path);
            }
            return Ok(None);
        }
        Self::new(stage, failures.to_vec()).write(path)?;
        Ok(Some(path.to_path_buf()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read failure manifest {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse failure manifest {:?}", path))
    }
}

/// `<dir>/<stem>.failures.json` next to an output artifact
pub fn manifest_path_for(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    artifact.with_file_name(format!("{}.failures.json", stem))
}

/// Write to a temporary sibling, then rename over the destination.
/// The destination is either the complete new content or untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("Output path {:?} has no file name", path))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = fs::write(&tmp, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to write {:?}", tmp));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to move {:?} into place", path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_counts() {
        assert_eq!(RunStatus::from_counts(3, 0), RunStatus::Success);
        assert_eq!(RunStatus::from_counts(0, 0), RunStatus::Success);
        assert_eq!(RunStatus::from_counts(2, 1), RunStatus::SuccessWithWarnings);
        assert_eq!(RunStatus::from_counts(0, 4), RunStatus::Failed);
    }

    #[test]
    fn manifest_path_sits_next_to_artifact() {
        let path = manifest_path_for(Path::new("/tmp/autotags/run1.json"));
        assert_eq!(path, PathBuf::from("/tmp/autotags/run1.failures.json"));
    }

    #[test]
    fn manifest_write_then_read_keeps_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("gen.failures.json");
        let manifest = FailureManifest::new(
            Stage::Generate,
            vec![ItemFailure::new("interview_07", "model returned empty output")],
        );
        manifest.write(&path).expect("write manifest");

        let loaded = FailureManifest::read(&path).expect("read manifest");
        assert_eq!(loaded.stage, Stage::Generate);
        assert_eq!(loaded.items(), vec!["interview_07".to_string()]);
    }

    #[test]
    fn clean_run_removes_stale_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ingest.failures.json");
        let failures = vec![ItemFailure::new("a.txt", "empty")];

        let written = FailureManifest::write_or_clear(Stage::Ingest, &failures, &path).unwrap();
        assert_eq!(written.as_deref(), Some(path.as_path()));
        assert!(path.exists());

        let cleared = FailureManifest::write_or_clear(Stage::Ingest, &[], &path).unwrap();
        assert!(cleared.is_none());
        assert!(!path.exists());
        assert!(FailureManifest::write_or_clear(Stage::Ingest, &[], &path)
            .unwrap()
            .is_none());
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("overwrite");

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
