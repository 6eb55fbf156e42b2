use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::adapters;
use crate::context::AppContext;
use crate::core::drive::Capability;
use crate::core::error::JobError;
use crate::core::hardware::{DiscInfo, HardwareAdapter, HardwareEvent, OpticalDrive};
use crate::core::job::{Job, Step};
use crate::core::plan::PlannedStep;
use crate::core::runner::JobRunner;
use crate::core::snapshot::{ResumeSnapshot, find_resumable};

/// Slack on top of the kill grace for runners to record their final state.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

/// Wires hardware events to jobs: registers drives, starts a job per inserted
/// disc and tears jobs down when their drive disappears.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            temp = %self.ctx.config.temp_directory.display(),
            simulation = self.ctx.config.simulation,
            disc_types = ?self.ctx.planners.disc_types(),
            "ripd starting"
        );

        tokio::fs::create_dir_all(&self.ctx.config.temp_directory)
            .await
            .with_context(|| {
                format!("Failed to create temp directory {}", self.ctx.config.temp_directory.display())
            })?;

        self.spawn_output_logger();

        let (tx, mut rx) = mpsc::channel(32);
        let adapter = adapters::get_adapter(&self.ctx.config);
        self.register_attached_drives(adapter.as_ref());

        self.resume_on_start().await;

        adapter.start(tx);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        adapter.stop();
        self.shutdown().await;
        Ok(())
    }

    fn register_attached_drives(&self, adapter: &dyn HardwareAdapter) {
        match adapter.list_drives() {
            Ok(drives) => {
                for drive in drives {
                    self.register_drive(&drive);
                }
            }
            Err(e) => warn!(error = %e, "Could not list attached drives"),
        }
    }

    async fn resume_on_start(&self) {
        let resumable = self.list_resumable().await;
        if resumable.is_empty() {
            return;
        }

        for snapshot in &resumable {
            info!(
                job_id = %snapshot.job_id,
                label = %snapshot.disc_label,
                completed = snapshot.completed_steps(),
                total = snapshot.steps.len(),
                "Found resumable job"
            );
        }

        if !self.ctx.config.resume_on_start {
            info!(count = resumable.len(), "Resumable jobs left untouched (resume_on_start is off)");
            return;
        }

        for snapshot in resumable {
            if let Err(e) = self.resume_job(&snapshot.job_id).await {
                warn!(job_id = %snapshot.job_id, error = %e, "Could not resume job");
            }
        }
    }

    /// Mirror job output into the daemon log at debug level.
    fn spawn_output_logger(&self) {
        let mut rx = self.ctx.subscribe_output();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => debug!(
                        job_id = %event.job_id,
                        step = event.step_index + 1,
                        progress = event.progress,
                        "{}",
                        event.line
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Output logger lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn handle_event(&self, event: HardwareEvent) {
        match event {
            HardwareEvent::DriveAdded(drive) => self.register_drive(&drive),
            HardwareEvent::DriveRemoved(path) => self.handle_drive_removed(&path).await,
            HardwareEvent::DiscInserted(disc) => self.handle_disc_inserted(disc).await,
        }
    }

    fn register_drive(&self, drive: &OpticalDrive) {
        self.ctx
            .drives
            .register(&drive.path, &drive.model, drive.capabilities.iter().copied());
    }

    async fn handle_drive_removed(&self, path: &str) {
        if let Some(job_id) = self.ctx.drives.holder_of(path) {
            warn!(drive = %path, job_id = %job_id, "Drive removed while in use, cancelling job");

            if let Some(job) = self.ctx.jobs.get(&job_id).await {
                if let Some(runner) = job.runner() {
                    runner.cancel();
                }
            }
            self.ctx.jobs.cancel(&job_id).await;
            self.ctx.drives.release(path);
        }

        self.ctx.drives.unregister(path);
    }

    async fn handle_disc_inserted(&self, disc: DiscInfo) {
        if self.ctx.drives.get(&disc.drive).is_none() {
            self.ctx.drives.register(&disc.drive, "Unknown", std::iter::empty::<Capability>());
        }
        self.ctx.drives.set_disc_label(&disc.drive, Some(disc.label.clone()));

        info!(drive = %disc.drive, disc_type = %disc.disc_type, label = %disc.label, "Disc detected");

        if let Err(e) = self.start_job(&disc.drive, &disc.disc_type, &disc.label).await {
            warn!(drive = %disc.drive, error = %e, "Disc not ripped");
        }
    }

    /// Create a job for a disc, claim its drive and start the runner.
    pub async fn start_job(&self, drive: &str, disc_type: &str, label: &str) -> Result<Arc<Job>, JobError> {
        let config = &self.ctx.config;
        let job = self
            .ctx
            .jobs
            .create(
                disc_type,
                drive,
                label,
                &config.temp_directory,
                &config.output_root_for(disc_type),
            )
            .await;

        if !self.ctx.drives.reserve(drive, job.id()) {
            self.ctx.jobs.remove(job.id()).await;
            return Err(JobError::DriveUnavailable(drive.to_string()));
        }
        job.hold_drive(drive);

        self.spawn_runner(&job);
        Ok(job)
    }

    /// Rebuild a job from its snapshot and run its remaining steps.
    pub async fn resume_job(&self, job_id: &str) -> Result<Arc<Job>, JobError> {
        let path = ResumeSnapshot::path_in(&self.ctx.config.temp_directory.join(job_id));
        let snapshot = ResumeSnapshot::load_resumable(&path, job_id).await?;
        let job = Arc::new(Job::from_snapshot(snapshot, self.ctx.config.log_capacity));

        self.ctx.jobs.add_if_inactive(job.clone()).await?;

        // Only claim the drive if a drive-bound step is still ahead.
        let needs_drive = match self.ctx.planners.plan_for(&job) {
            Ok(plan) => remaining_steps_need_drive(&plan, &job.steps()),
            Err(_) => false,
        };
        if needs_drive {
            let drive = job.source_drive().to_string();
            if !self.ctx.drives.reserve(&drive, job.id()) {
                self.ctx.jobs.remove(job.id()).await;
                return Err(JobError::DriveUnavailable(drive));
            }
            job.hold_drive(&drive);
        }

        info!(
            job_id = %job.id(),
            progress = job.progress(),
            from_step = job.current_step() + 1,
            "Resuming job"
        );

        self.spawn_runner(&job);
        Ok(job)
    }

    fn spawn_runner(&self, job: &Arc<Job>) {
        let supervisor = JobRunner::new(job.clone(), self.ctx.runner_context()).run();
        self.ctx.tasks.spawn(supervisor);
    }

    pub async fn list_resumable(&self) -> Vec<ResumeSnapshot> {
        find_resumable(&self.ctx.config.temp_directory).await
    }

    /// Cancel a job, stopping its process if it is running.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .ctx
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        match job.runner() {
            Some(runner) => runner.cancel(),
            None => {
                self.ctx.jobs.cancel(job_id).await;
            }
        }
        Ok(())
    }

    /// Step processes live in their own process groups, so they would outlive
    /// the daemon unless stopped here. Their snapshots stay for a later resume.
    pub async fn shutdown(&self) {
        let running = self.ctx.jobs.active_count().await;
        info!(running, "Stopping jobs");

        for job in self.ctx.jobs.list().await {
            if let Some(runner) = job.runner() {
                debug!(job_id = %job.id(), "Stopping job for shutdown");
                runner.cancel();
            }
        }

        self.ctx.tasks.close();
        let limit = self.ctx.config.kill_grace() + SHUTDOWN_MARGIN;
        if tokio::time::timeout(limit, self.ctx.tasks.wait()).await.is_err() {
            warn!(pending = self.ctx.tasks.len(), "Runners did not stop in time");
        }
    }
}

/// True if any step from the first incomplete one onward still reads the disc.
fn remaining_steps_need_drive(plan: &[PlannedStep], steps: &[Step]) -> bool {
    let first_incomplete = steps.iter().position(|s| !s.completed).unwrap_or(steps.len());
    plan.iter().skip(first_incomplete).any(|s| s.release_drive_after)
}
