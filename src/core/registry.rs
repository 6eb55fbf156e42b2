//! In-memory catalog of jobs.
//!
//! Jobs are shared as `Arc<Job>` so the runner, the orchestrator and any
//! viewer can hold one without going through the map lock.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::error::JobError;
use super::job::{Job, JobStatus, NewJob};

static UNSAFE_PATH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._ -]+").expect("static regex"));

/// Turn a disc label into a single safe path component.
pub fn sanitize_label(label: &str) -> String {
    let cleaned = UNSAFE_PATH_CHARS.replace_all(label.trim(), "_");
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c == ' ');
    if cleaned.is_empty() {
        "UNTITLED".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Job>>>>,
    log_capacity: usize,
}

impl JobRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            log_capacity,
        }
    }

    /// Allocate a fresh job. The temp directory is `temp_root/<id>` and the
    /// output path is `output_root/<sanitized label>`.
    pub async fn create(
        &self,
        disc_type: &str,
        drive_id: &str,
        disc_label: &str,
        temp_root: &Path,
        output_root: &Path,
    ) -> Arc<Job> {
        let id = Uuid::now_v7().to_string();
        let job = Arc::new(Job::new(NewJob {
            id: id.clone(),
            disc_type: disc_type.to_string(),
            disc_label: disc_label.to_string(),
            source_drive: drive_id.to_string(),
            temp_path: temp_root.join(&id),
            output_path: output_root.join(sanitize_label(disc_label)),
            log_capacity: self.log_capacity,
        }));

        self.inner.write().await.insert(id.clone(), job.clone());
        info!(job_id = %id, disc_type = %disc_type, drive = %drive_id, label = %disc_label, "Job created");
        job
    }

    /// Register a job rebuilt from a resume snapshot. A terminal entry with
    /// the same id is replaced; a queued or running one is left alone.
    pub async fn add_if_inactive(&self, job: Arc<Job>) -> Result<(), JobError> {
        let mut jobs = self.inner.write().await;
        if let Some(existing) = jobs.get(job.id()) {
            if !existing.status().is_terminal() {
                return Err(JobError::AlreadyActive(job.id().to_string()));
            }
        }
        jobs.insert(job.id().to_string(), job);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.read().await.get(id).cloned()
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.inner.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at());
        jobs
    }

    /// Mark a job Cancelled. This does not stop a running process; callers
    /// wanting a hard stop must also cancel the job's runner.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(job) => {
                if job.transition(JobStatus::Cancelled) {
                    info!(job_id = %id, "Job marked cancelled");
                }
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.write().await.remove(id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|j| j.status() == JobStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn create_builds_paths_and_queues() {
        let registry = JobRegistry::new(15);
        let job = registry
            .create(
                "dvd_video",
                "/dev/sr0",
                "MY MOVIE",
                Path::new("/tmp/ripd"),
                Path::new("/media/out"),
            )
            .await;

        assert_eq!(job.status(), JobStatus::Queued);
        assert!(job.steps().is_empty());
        assert_eq!(job.temp_path(), PathBuf::from("/tmp/ripd").join(job.id()));
        assert_eq!(job.output_path(), Path::new("/media/out/MY MOVIE"));
        assert_eq!(registry.get(job.id()).await.unwrap().id(), job.id());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = JobRegistry::new(15);
        let a = registry.create("cd_audio", "/dev/sr0", "A", Path::new("/t"), Path::new("/o")).await;
        let b = registry.create("cd_audio", "/dev/sr1", "B", Path::new("/t"), Path::new("/o")).await;
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_marks_status_only() {
        let registry = JobRegistry::new(15);
        let job = registry.create("cd_rom", "/dev/sr0", "X", Path::new("/t"), Path::new("/o")).await;

        assert!(registry.cancel(job.id()).await);
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(registry.cancel(job.id()).await);
        assert!(!registry.cancel("missing").await);
    }

    #[tokio::test]
    async fn rebuilt_job_replaces_only_a_finished_entry() {
        let registry = JobRegistry::new(15);
        let job = registry.create("cd_rom", "/dev/sr0", "X", Path::new("/t"), Path::new("/o")).await;
        let rebuilt = Arc::new(Job::from_snapshot(job.to_snapshot(), 15));

        let err = registry.add_if_inactive(rebuilt.clone()).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyActive(id) if id == job.id()));
        assert!(Arc::ptr_eq(&registry.get(job.id()).await.unwrap(), &job));

        job.transition(JobStatus::Running);
        assert!(registry.add_if_inactive(rebuilt.clone()).await.is_err());

        job.transition(JobStatus::Failed);
        registry.add_if_inactive(rebuilt.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&registry.get(job.id()).await.unwrap(), &rebuilt));
        assert_eq!(registry.list().await.len(), 1);

        assert!(registry.remove(job.id()).await.is_some());
        assert!(registry.get(job.id()).await.is_none());
    }

    #[test]
    fn labels_are_made_path_safe() {
        assert_eq!(sanitize_label("STAR_WARS"), "STAR_WARS");
        assert_eq!(sanitize_label("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_label("  "), "UNTITLED");
        assert_eq!(sanitize_label("Disc: 1/2"), "Disc_ 1_2");
    }
}
