//! On-disk resume snapshots.
//!
//! After every completed step the runner writes `<temp>/.resume.json`. A
//! snapshot with at least one completed step lets a crashed or failed job be
//! picked up again without redoing finished work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::JobError;
use super::job::{JobStatus, Step};

pub const RESUME_FILE_NAME: &str = ".resume.json";

/// Serialized projection of a job. The live log, the held drive and the
/// runner handle are deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub job_id: String,
    pub disc_type: String,
    pub disc_label: String,
    pub source_drive: String,
    pub temp_path: PathBuf,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
    pub step_weights: Vec<f64>,
    pub current_step: usize,
    pub step_progress: u8,
    pub progress: u8,
    pub status: JobStatus,
}

impl ResumeSnapshot {
    pub fn path_in(temp_path: &Path) -> PathBuf {
        temp_path.join(RESUME_FILE_NAME)
    }

    pub fn is_resumable(&self) -> bool {
        self.steps.iter().any(|s| s.completed)
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.completed).count()
    }

    /// Write atomically: a sibling temp file is renamed over the target.
    pub async fn write(&self) -> Result<(), JobError> {
        let path = Self::path_in(&self.temp_path);
        let tmp = self.temp_path.join(format!("{}.tmp", RESUME_FILE_NAME));
        let body = serde_json::to_vec_pretty(self)?;

        let io = async {
            tokio::fs::create_dir_all(&self.temp_path).await?;
            tokio::fs::write(&tmp, &body).await?;
            tokio::fs::rename(&tmp, &path).await
        };

        io.await.map_err(|source| JobError::SnapshotWrite {
            path: path.clone(),
            source,
        })?;

        debug!(job_id = %self.job_id, path = %path.display(), "Resume snapshot written");
        Ok(())
    }

    /// Load a snapshot for resumption. Missing, unreadable or corrupt files,
    /// and snapshots with nothing completed, are all "not resumable".
    pub async fn load_resumable(path: &Path, job_id: &str) -> Result<Self, JobError> {
        let not_resumable = |reason: String| JobError::NotResumable {
            id: job_id.to_string(),
            reason,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| not_resumable(format!("cannot read {}: {}", path.display(), e)))?;

        let snapshot: ResumeSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| not_resumable(format!("corrupt snapshot {}: {}", path.display(), e)))?;

        if snapshot.job_id != job_id {
            return Err(not_resumable(format!(
                "snapshot belongs to job {}",
                snapshot.job_id
            )));
        }
        if !snapshot.is_resumable() {
            return Err(not_resumable("no completed steps".to_string()));
        }

        Ok(snapshot)
    }

    pub async fn remove(temp_path: &Path) {
        let path = Self::path_in(temp_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Resume snapshot removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove resume snapshot"),
        }
    }
}

/// Scan `<temp_root>/*/.resume.json` for resumable snapshots. Unreadable
/// entries are skipped with a warning.
pub async fn find_resumable(temp_root: &Path) -> Vec<ResumeSnapshot> {
    let mut found = Vec::new();

    let mut entries = match tokio::fs::read_dir(temp_root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %temp_root.display(), error = %e, "No temp directory to scan");
            return found;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = ResumeSnapshot::path_in(&entry.path());
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };

        match serde_json::from_slice::<ResumeSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.is_resumable() => found.push(snapshot),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt resume snapshot"),
        }
    }

    found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    found
}
