//! The job runner: drives one job's step plan to a terminal state.
//!
//! A runner owns exactly one job and executes on its own tokio task, one
//! child process at a time. It is the only writer of the job's progress
//! fields; `cancel` may be called from anywhere and only touches the
//! cancellation token, the child's process group, the status and the held
//! drive, all of which are synchronized.

use nix::sys::signal::Signal;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::drive::DriveRegistry;
use super::error::{JobError, PlanError, ProcessError};
use super::job::{Job, JobStatus};
use super::plan::{PlannedStep, PlannerRegistry};
use super::process::{StepProcess, kill_group_stragglers, signal_group};
use super::progress::{StepEstimator, normalize_weights, weights_are_valid};
use super::snapshot::ResumeSnapshot;
use crate::config::AppConfig;
use crate::logging::LogThrottle;

/// One line of step output plus where the job stands, for live viewers.
#[derive(Debug, Clone, Serialize)]
pub struct OutputEvent {
    pub job_id: String,
    pub line: String,
    pub step_index: usize,
    pub step_name: String,
    pub status: JobStatus,
    pub step_progress: u8,
    pub progress: u8,
}

/// Best-effort live output. Sending never waits; slow receivers lag and
/// lose lines instead of stalling the rip.
pub type OutputSink = broadcast::Sender<OutputEvent>;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub eject_on_release: bool,
    pub kill_grace: Duration,
    pub progress_half_way_lines: u32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            eject_on_release: true,
            kill_grace: Duration::from_secs(5),
            progress_half_way_lines: 200,
        }
    }
}

impl From<&AppConfig> for RunnerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            eject_on_release: config.eject_on_release,
            kill_grace: config.kill_grace(),
            progress_half_way_lines: config.progress_half_way_lines,
        }
    }
}

/// Everything a runner needs besides its job.
#[derive(Clone)]
pub struct RunnerContext {
    pub drives: DriveRegistry,
    pub planners: Arc<PlannerRegistry>,
    pub options: RunnerOptions,
    pub output: Option<OutputSink>,
}

pub(crate) struct RunnerShared {
    job: Arc<Job>,
    ctx: RunnerContext,
    cancel: CancellationToken,
    started: AtomicBool,
    child_pgid: Mutex<Option<i32>>,
    progress_log: LogThrottle,
}

/// Cheap, cloneable control handle for a job's runner.
#[derive(Clone)]
pub struct JobRunner {
    shared: Arc<RunnerShared>,
}

const CANCELLED_LINE: &str = "Job cancelled";

/// Minimum spacing of per-line progress debug events.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

enum StepFailure {
    Cancelled,
    Failed(String),
}

impl JobRunner {
    /// Bind a runner to a job. The job gets a weak back-reference so other
    /// parts of the system can reach `cancel` through it.
    pub fn new(job: Arc<Job>, ctx: RunnerContext) -> Self {
        let shared = Arc::new(RunnerShared {
            job: job.clone(),
            ctx,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            child_pgid: Mutex::new(None),
            progress_log: LogThrottle::new(PROGRESS_LOG_INTERVAL),
        });
        job.attach_runner(Arc::downgrade(&shared));
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<RunnerShared>) -> Self {
        Self { shared }
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.shared.job
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Start the job on a background task and return immediately.
    ///
    /// A supervisor task awaits the worker so that errors and panics inside
    /// the step loop still end in Failed with the drive released.
    pub fn run(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();

        if shared.started.swap(true, Ordering::SeqCst) {
            warn!(job_id = %shared.job.id(), "Runner already started");
            return tokio::spawn(async {});
        }

        let span = info_span!("job", job_id = %shared.job.id(), disc_type = %shared.job.disc_type());

        tokio::spawn(
            async move {
                let worker = tokio::spawn(shared.clone().execute().in_current_span());

                match worker.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => shared.fail(format!("Job failed: {}", e)).await,
                    Err(e) => shared.fail(format!("Fatal runner fault: {}", e)).await,
                }

                if shared.job.status() == JobStatus::Cancelled {
                    shared.append_log_file(CANCELLED_LINE).await;
                }

                shared.job.detach_runner();
                debug!("Runner finished");
            }
            .instrument(span),
        )
    }

    /// Stop the job: kill the current step's process group, mark the job
    /// Cancelled, release and eject the drive. Idempotent and safe to race
    /// with the step loop.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl RunnerShared {
    fn job_id(&self) -> &str {
        self.job.id()
    }

    fn cancel(&self) {
        let first = !self.cancel.is_cancelled();
        self.cancel.cancel();

        let pgid = *self.child_pgid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pgid) = pgid {
            signal_group(pgid, Signal::SIGTERM);
        }

        if self.job.transition(JobStatus::Cancelled) {
            self.job.append_log(CANCELLED_LINE);
            info!(job_id = %self.job_id(), "Job cancelled");
        } else if first {
            debug!(job_id = %self.job_id(), status = %self.job.status(), "Cancel after terminal state");
        }

        self.release_drive(true);
    }

    /// Release the held drive if this job still has it. Only the first caller
    /// gets the drive back, so a late release never frees another job's claim.
    fn release_drive(&self, eject: bool) {
        let Some(path) = self.job.take_held_drive() else {
            return;
        };

        self.ctx.drives.release(&path);
        info!(job_id = %self.job_id(), drive = %path, "Drive released");

        if !eject || !self.ctx.options.eject_on_release {
            return;
        }

        // cancel() may come from outside the runtime; eject is best-effort.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(drive = %path, "No runtime to eject from");
            return;
        };
        runtime.spawn(async move {
            match tokio::process::Command::new("eject").arg(&path).status().await {
                Ok(status) if status.success() => debug!(drive = %path, "Ejected"),
                Ok(status) => debug!(drive = %path, %status, "Eject reported failure"),
                Err(e) => debug!(drive = %path, error = %e, "Eject unavailable"),
            }
        });
    }

    async fn fail(&self, message: String) {
        self.job.append_log(message.clone());
        self.append_log_file(&message).await;

        if self.job.transition(JobStatus::Failed) {
            error!(job_id = %self.job_id(), progress = self.job.progress(), reason = %message, "Job failed");
        }
        self.release_drive(false);
    }

    fn emit(&self, line: String) {
        let Some(tx) = &self.ctx.output else {
            return;
        };

        let event = {
            let state = self.job.state();
            OutputEvent {
                job_id: self.job.id().to_string(),
                line,
                step_index: state.current_step,
                step_name: state
                    .steps
                    .get(state.current_step)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                status: state.status,
                step_progress: state.step_progress,
                progress: state.progress,
            }
        };

        // No receivers is fine.
        let _ = tx.send(event);
    }

    async fn append_log_file(&self, line: &str) {
        let result = async {
            tokio::fs::create_dir_all(self.job.temp_path()).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.job.log_path())
                .await?;
            file.write_all(format!("{}\n", line).as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            warn!(job_id = %self.job_id(), error = %e, "Failed to write job log file");
        }
    }

    /// Resolve the plan and reconcile it with the job's recorded steps.
    fn prepare_plan(&self) -> Result<Vec<PlannedStep>, PlanError> {
        let plan = self.ctx.planners.plan_for(&self.job)?;
        let raw_weights: Vec<Option<f64>> = plan.iter().map(|s| s.weight).collect();
        let recorded = self.job.steps();

        if recorded.is_empty() {
            let names = plan.iter().map(|s| s.description.clone()).collect();
            self.job.install_steps(names, normalize_weights(&raw_weights));
            return Ok(plan);
        }

        if recorded.len() != plan.len() {
            return Err(PlanError::Mismatch(format!(
                "recorded {} steps, plan has {}",
                recorded.len(),
                plan.len()
            )));
        }
        if let Some((step, planned)) = recorded
            .iter()
            .zip(&plan)
            .find(|(step, planned)| step.name != planned.description)
        {
            return Err(PlanError::Mismatch(format!(
                "step {} was {:?}, plan now says {:?}",
                step.index, step.name, planned.description
            )));
        }

        if !weights_are_valid(&self.job.step_weights(), plan.len()) {
            self.job.set_step_weights(normalize_weights(&raw_weights));
        }
        Ok(plan)
    }

    async fn execute(self: Arc<Self>) -> Result<(), JobError> {
        if self.cancel.is_cancelled() || !self.job.transition(JobStatus::Running) {
            info!(status = %self.job.status(), "Job not runnable, skipping");
            self.release_drive(false);
            return Ok(());
        }

        let plan = self.prepare_plan()?;
        let completed: Vec<bool> = self.job.steps().iter().map(|s| s.completed).collect();
        let total = plan.len();

        info!(
            steps = total,
            already_completed = completed.iter().filter(|c| **c).count(),
            "Job running"
        );

        for (index, step) in plan.iter().enumerate() {
            if completed[index] {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.job.begin_step(index);
            self.progress_log.reset();
            info!(step = index + 1, total, description = %step.description, "Step started");

            match self.run_step(step).await {
                Ok(()) => {}
                Err(StepFailure::Cancelled) => return Ok(()),
                Err(StepFailure::Failed(reason)) => {
                    self.fail(format!("Step {} ({}) failed: {}", index + 1, step.description, reason))
                        .await;
                    return Ok(());
                }
            }

            self.job.complete_step(index);
            info!(step = index + 1, total, progress = self.job.progress(), "Step completed");

            if let Err(e) = self.job.to_snapshot().write().await {
                warn!(error = %e, "Resume snapshot not written");
                self.job.append_log(format!("Warning: {}", e));
            }

            if step.release_drive_after {
                self.release_drive(true);
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        if self.job.transition(JobStatus::Finished) {
            ResumeSnapshot::remove(self.job.temp_path()).await;
            info!(output = %self.job.output_path().display(), "Job finished");
        }
        self.release_drive(false);
        Ok(())
    }

    async fn run_step(&self, step: &PlannedStep) -> Result<(), StepFailure> {
        let log_file = async {
            tokio::fs::create_dir_all(self.job.temp_path()).await?;
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.job.log_path())
                .await
        };
        let mut log_file = log_file
            .await
            .map_err(|e| StepFailure::Failed(format!("cannot open job log: {}", e)))?;

        let mut process =
            StepProcess::spawn(&step.argv).map_err(|e| StepFailure::Failed(e.to_string()))?;
        let pgid = process.pgid;
        self.set_child(Some(pgid));

        let mut estimator = StepEstimator::new(self.ctx.options.progress_half_way_lines);
        let mut log_file_ok = true;
        let mut kill_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                line = process.lines.recv() => {
                    let Some(line) = line else { break };

                    if log_file_ok {
                        if let Err(e) = log_file.write_all(format!("{}\n", line).as_bytes()).await {
                            warn!(error = %e, "Job log file write failed, continuing without it");
                            log_file_ok = false;
                        }
                    }
                    self.job.append_log(line.clone());

                    if let Some(percent) = estimator.observe_line() {
                        let overall = self.job.set_step_progress(percent);
                        if let Some(skipped) = self.progress_log.admit() {
                            debug!(step_progress = percent, progress = overall, skipped, "Step progress");
                        }
                    }
                    self.emit(line);
                }
                _ = self.cancel.cancelled(), if kill_deadline.is_none() => {
                    signal_group(pgid, Signal::SIGTERM);
                    kill_deadline = Some(Instant::now() + self.ctx.options.kill_grace);
                }
                _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                    warn!(pgid, "Step ignored SIGTERM, killing process group");
                    signal_group(pgid, Signal::SIGKILL);
                    break;
                }
            }
        }

        let status = self.reap(&mut process, &mut kill_deadline).await;
        if self.cancel.is_cancelled() {
            // Members that ignore SIGTERM and closed their output outlive the leader.
            let deadline = kill_deadline.unwrap_or_else(|| Instant::now() + self.ctx.options.kill_grace);
            kill_group_stragglers(pgid, deadline).await;
        }
        self.set_child(None);
        let _ = log_file.flush().await;

        if self.cancel.is_cancelled() {
            return Err(StepFailure::Cancelled);
        }

        let status = status.map_err(|e| StepFailure::Failed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(StepFailure::Failed(
                ProcessError::NonZeroExit {
                    program: process.program().to_string(),
                    status: status.to_string(),
                }
                .to_string(),
            ))
        }
    }

    /// Wait for the step leader to exit, escalating to SIGKILL if a cancelled
    /// step outlives the grace period. Records the kill deadline it used.
    async fn reap(
        &self,
        process: &mut StepProcess,
        kill_deadline: &mut Option<Instant>,
    ) -> Result<ExitStatus, ProcessError> {
        let pgid = process.pgid;
        if !self.cancel.is_cancelled() {
            tokio::select! {
                status = process.wait() => return status,
                _ = self.cancel.cancelled() => signal_group(pgid, Signal::SIGTERM),
            }
        }

        let deadline = *kill_deadline.get_or_insert_with(|| Instant::now() + self.ctx.options.kill_grace);
        match timeout_at(deadline, process.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pgid, "Step still alive after grace period, killing process group");
                signal_group(pgid, Signal::SIGKILL);
                process.wait().await
            }
        }
    }

    fn set_child(&self, pgid: Option<i32>) {
        *self.child_pgid.lock().unwrap_or_else(PoisonError::into_inner) = pgid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::drive::Capability;
    use crate::core::job::NewJob;
    use std::path::Path;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn job_in(dir: &Path, disc_type: &str) -> Arc<Job> {
        Arc::new(Job::new(NewJob {
            id: "runner-test".to_string(),
            disc_type: disc_type.to_string(),
            disc_label: "LABEL".to_string(),
            source_drive: "/dev/sr0".to_string(),
            temp_path: dir.join("runner-test"),
            output_path: dir.join("out"),
            log_capacity: 4,
        }))
    }

    fn context(planners: PlannerRegistry) -> RunnerContext {
        let drives = DriveRegistry::new();
        drives.register("/dev/sr0", "Test Drive", [Capability::Dvd]);
        RunnerContext {
            drives,
            planners: Arc::new(planners),
            options: RunnerOptions {
                eject_on_release: false,
                kill_grace: Duration::from_millis(500),
                progress_half_way_lines: 10,
            },
            output: None,
        }
    }

    fn fixed_plan(steps: Vec<PlannedStep>) -> Arc<dyn crate::core::StepPlanner> {
        Arc::new(move |_: &Job| -> Result<Vec<PlannedStep>, PlanError> { Ok(steps.clone()) })
    }

    #[tokio::test]
    async fn unsupported_disc_type_fails_the_job_and_frees_the_drive() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "hddvd");
        let ctx = context(PlannerRegistry::new());
        assert!(ctx.drives.reserve("/dev/sr0", job.id()));
        job.hold_drive("/dev/sr0");

        JobRunner::new(job.clone(), ctx.clone()).run().await.unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.log_lines().iter().any(|l| l.contains("unsupported disc type")));
        assert!(ctx.drives.get("/dev/sr0").unwrap().is_available());
        assert!(job.runner().is_none());
    }

    #[tokio::test]
    async fn output_is_mirrored_to_ring_buffer_log_file_and_sink() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "data");
        let planners = PlannerRegistry::new().with(
            "data",
            fixed_plan(vec![PlannedStep::new(sh("for i in 1 2 3 4 5 6; do echo line$i; done"), "Echo")]),
        );
        let (tx, mut rx) = broadcast::channel(64);
        let mut ctx = context(planners);
        ctx.output = Some(tx);

        JobRunner::new(job.clone(), ctx).run().await.unwrap();

        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.progress(), 100);
        assert_eq!(job.log_lines(), vec!["line3", "line4", "line5", "line6"]);

        let on_disk = std::fs::read_to_string(job.log_path()).unwrap();
        assert_eq!(on_disk.lines().count(), 6);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, "line1");
        assert_eq!(first.step_name, "Echo");
        assert_eq!(first.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn double_run_is_ignored() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "data");
        let planners = PlannerRegistry::new().with("data", fixed_plan(vec![PlannedStep::new(sh("true"), "noop")]));
        let runner = JobRunner::new(job.clone(), context(planners));

        let first = runner.run();
        let second = runner.run();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(job.status(), JobStatus::Finished);
    }

    #[tokio::test]
    async fn launch_failure_is_a_step_failure() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "data");
        let planners = PlannerRegistry::new().with(
            "data",
            fixed_plan(vec![PlannedStep::new(vec!["/nonexistent/makemkvcon".to_string()], "Rip")]),
        );

        JobRunner::new(job.clone(), context(planners)).run().await.unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.log_lines().last().unwrap().contains("failed to launch"));
    }

    #[tokio::test]
    async fn panicking_planner_fails_the_job_and_frees_the_drive() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "data");
        let planner: Arc<dyn crate::core::StepPlanner> =
            Arc::new(|_: &Job| -> Result<Vec<PlannedStep>, PlanError> { panic!("planner blew up") });
        let ctx = context(PlannerRegistry::new().with("data", planner));
        assert!(ctx.drives.reserve("/dev/sr0", job.id()));
        job.hold_drive("/dev/sr0");

        JobRunner::new(job.clone(), ctx.clone()).run().await.unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.log_lines().iter().any(|l| l.starts_with("Fatal runner fault")));
        assert!(ctx.drives.get("/dev/sr0").unwrap().is_available());
        assert!(job.held_drive().is_none());
        assert!(job.runner().is_none());
    }

    #[tokio::test]
    async fn resumed_job_with_corrupt_weights_takes_them_from_the_plan() {
        let temp = tempdir().unwrap();
        let first = job_in(temp.path(), "video");
        first.install_steps(vec!["Rip".into(), "Encode".into()], vec![0.7, 0.3]);
        first.transition(JobStatus::Running);
        first.complete_step(0);
        let mut snapshot = first.to_snapshot();
        snapshot.step_weights = vec![0.5, 0.6];

        let resumed = Arc::new(Job::from_snapshot(snapshot, 4));
        let planners = PlannerRegistry::new().with(
            "video",
            fixed_plan(vec![
                PlannedStep::new(sh("true"), "Rip").weight(0.7),
                PlannedStep::new(sh("exit 1"), "Encode").weight(0.3),
            ]),
        );

        JobRunner::new(resumed.clone(), context(planners)).run().await.unwrap();

        assert_eq!(resumed.status(), JobStatus::Failed);
        assert_eq!(resumed.step_weights(), vec![0.7, 0.3]);
        assert_eq!(resumed.progress(), 70);
    }

    #[tokio::test]
    async fn cancellation_is_recorded_in_the_log_file() {
        let temp = tempdir().unwrap();
        let job = job_in(temp.path(), "data");
        let planners = PlannerRegistry::new().with(
            "data",
            fixed_plan(vec![PlannedStep::new(sh("echo up; sleep 30 & wait"), "Rip")]),
        );
        let runner = JobRunner::new(job.clone(), context(planners));
        let handle = runner.run();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !job.log_lines().iter().any(|l| l == "up") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        runner.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();

        let on_disk = std::fs::read_to_string(job.log_path()).unwrap();
        assert_eq!(on_disk.lines().last(), Some("Job cancelled"));
    }

    #[test]
    fn cancel_outside_a_runtime_skips_eject() {
        let dir = std::env::temp_dir();
        let job = job_in(&dir, "data");
        let mut ctx = context(PlannerRegistry::new());
        ctx.options.eject_on_release = true;
        assert!(ctx.drives.reserve("/dev/sr0", job.id()));
        job.hold_drive("/dev/sr0");

        JobRunner::new(job.clone(), ctx.clone()).cancel();

        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(ctx.drives.get("/dev/sr0").unwrap().is_available());
    }
}
