//! The job record: one disc, one pipeline, one state machine.
//!
//! Identity fields are immutable. Everything that changes while the job
//! runs sits behind a per-job mutex that is only held for field updates,
//! never across an await point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use super::log_buffer::LogBuffer;
use super::progress::{self, overall_percent};
use super::runner::{JobRunner, RunnerShared};
use super::snapshot::ResumeSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// One-way transitions. Re-entering Running from a terminal state only
    /// happens through resume, which rebuilds the job as Queued first.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Finished)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub name: String,
    pub completed: bool,
}

#[derive(Debug)]
pub(crate) struct JobState {
    pub steps: Vec<Step>,
    pub step_weights: Vec<f64>,
    pub current_step: usize,
    pub step_progress: u8,
    pub progress: u8,
    pub status: JobStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub held_drive: Option<String>,
    pub log: LogBuffer,
}

/// Point-in-time copy of a job for presentation and logging.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
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
    pub held_drive: Option<String>,
    pub log: Vec<String>,
    pub runner_attached: bool,
}

pub struct Job {
    id: String,
    disc_type: String,
    disc_label: String,
    source_drive: String,
    temp_path: PathBuf,
    output_path: PathBuf,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    runner: Mutex<Weak<RunnerShared>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("disc_type", &self.disc_type)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

pub struct NewJob {
    pub id: String,
    pub disc_type: String,
    pub disc_label: String,
    pub source_drive: String,
    pub temp_path: PathBuf,
    pub output_path: PathBuf,
    pub log_capacity: usize,
}

impl Job {
    pub fn new(new: NewJob) -> Self {
        Self {
            id: new.id,
            disc_type: new.disc_type,
            disc_label: new.disc_label,
            source_drive: new.source_drive,
            temp_path: new.temp_path,
            output_path: new.output_path,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                steps: Vec::new(),
                step_weights: Vec::new(),
                current_step: 0,
                step_progress: 0,
                progress: 0,
                status: JobStatus::Queued,
                finished_at: None,
                held_drive: None,
                log: LogBuffer::new(new.log_capacity),
            }),
            runner: Mutex::new(Weak::new()),
        }
    }

    /// Rebuild a job from its resume snapshot, ready to run again.
    ///
    /// Status goes back to Queued, the cursor moves to the first incomplete
    /// step, and overall progress is recomputed from completed steps.
    /// Stored weights are kept as-is; if they are invalid the runner replaces
    /// them from the plan, and until then progress is shown with uniform ones.
    pub fn from_snapshot(snapshot: ResumeSnapshot, log_capacity: usize) -> Self {
        let completed: Vec<bool> = snapshot.steps.iter().map(|s| s.completed).collect();
        let current_step = completed.iter().position(|done| !done).unwrap_or(completed.len());
        let progress = if progress::weights_are_valid(&snapshot.step_weights, snapshot.steps.len()) {
            overall_percent(&snapshot.step_weights, &completed, current_step, 0)
        } else {
            let uniform = progress::uniform_weights(snapshot.steps.len());
            overall_percent(&uniform, &completed, current_step, 0)
        };
        let weights = snapshot.step_weights;

        Self {
            id: snapshot.job_id,
            disc_type: snapshot.disc_type,
            disc_label: snapshot.disc_label,
            source_drive: snapshot.source_drive,
            temp_path: snapshot.temp_path,
            output_path: snapshot.output_path,
            created_at: snapshot.created_at,
            state: Mutex::new(JobState {
                steps: snapshot.steps,
                step_weights: weights,
                current_step,
                step_progress: 0,
                progress,
                status: JobStatus::Queued,
                finished_at: None,
                held_drive: None,
                log: LogBuffer::new(log_capacity),
            }),
            runner: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn disc_type(&self) -> &str {
        &self.disc_type
    }

    pub fn disc_label(&self) -> &str {
        &self.disc_label
    }

    /// Device the disc was read from. Kept after release so a resumed plan
    /// can be rebuilt with the same commands.
    pub fn source_drive(&self) -> &str {
        &self.source_drive
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn log_path(&self) -> PathBuf {
        self.temp_path.join("log.txt")
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn progress(&self) -> u8 {
        self.state().progress
    }

    pub fn step_progress(&self) -> u8 {
        self.state().step_progress
    }

    pub fn current_step(&self) -> usize {
        self.state().current_step
    }

    pub fn steps(&self) -> Vec<Step> {
        self.state().steps.clone()
    }

    pub fn step_weights(&self) -> Vec<f64> {
        self.state().step_weights.clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.state().log.lines()
    }

    pub fn held_drive(&self) -> Option<String> {
        self.state().held_drive.clone()
    }

    /// Record the drive this job has reserved.
    pub fn hold_drive(&self, path: &str) {
        self.state().held_drive = Some(path.to_string());
    }

    /// Hand back the held drive exactly once; later calls get `None`.
    pub fn take_held_drive(&self) -> Option<String> {
        self.state().held_drive.take()
    }

    pub fn append_log(&self, line: impl Into<String>) {
        self.state().log.push(line);
    }

    /// Apply a status transition if the state machine allows it.
    pub fn transition(&self, next: JobStatus) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next == JobStatus::Finished {
            state.finished_at = Some(Utc::now());
            state.progress = 100;
        } else if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        true
    }

    /// Install the plan's step names and weights on a fresh job.
    pub(crate) fn install_steps(&self, names: Vec<String>, weights: Vec<f64>) {
        let mut state = self.state();
        state.steps = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| Step {
                index,
                name,
                completed: false,
            })
            .collect();
        state.step_weights = weights;
        state.current_step = 0;
        state.step_progress = 0;
    }

    /// Replace invalid recorded weights and recompute progress from them.
    pub(crate) fn set_step_weights(&self, weights: Vec<f64>) {
        let mut state = self.state();
        let completed: Vec<bool> = state.steps.iter().map(|s| s.completed).collect();
        state.progress = overall_percent(&weights, &completed, state.current_step, 0);
        state.step_weights = weights;
    }

    pub(crate) fn begin_step(&self, index: usize) {
        let mut state = self.state();
        state.current_step = index;
        state.step_progress = 0;
    }

    /// Update the in-flight step estimate and the derived overall progress.
    /// Overall progress never moves backwards.
    pub(crate) fn set_step_progress(&self, percent: u8) -> u8 {
        let mut state = self.state();
        state.step_progress = percent.min(100);
        let completed: Vec<bool> = state.steps.iter().map(|s| s.completed).collect();
        let overall = overall_percent(
            &state.step_weights,
            &completed,
            state.current_step,
            state.step_progress,
        );
        state.progress = state.progress.max(overall);
        state.progress
    }

    pub(crate) fn complete_step(&self, index: usize) {
        let mut state = self.state();
        state.step_progress = 100;
        if let Some(step) = state.steps.get_mut(index) {
            step.completed = true;
        }
        state.current_step = index + 1;
        let completed: Vec<bool> = state.steps.iter().map(|s| s.completed).collect();
        let overall = overall_percent(&state.step_weights, &completed, state.current_step, 0);
        state.progress = state.progress.max(overall);
    }

    pub(crate) fn attach_runner(&self, runner: Weak<RunnerShared>) {
        *self.runner.lock().unwrap_or_else(PoisonError::into_inner) = runner;
    }

    pub(crate) fn detach_runner(&self) {
        *self.runner.lock().unwrap_or_else(PoisonError::into_inner) = Weak::new();
    }

    /// The active runner, if one is still alive for this job.
    pub fn runner(&self) -> Option<JobRunner> {
        self.runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .map(JobRunner::from_shared)
    }

    pub fn to_snapshot(&self) -> ResumeSnapshot {
        let state = self.state();
        ResumeSnapshot {
            job_id: self.id.clone(),
            disc_type: self.disc_type.clone(),
            disc_label: self.disc_label.clone(),
            source_drive: self.source_drive.clone(),
            temp_path: self.temp_path.clone(),
            output_path: self.output_path.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
            steps: state.steps.clone(),
            step_weights: state.step_weights.clone(),
            current_step: state.current_step,
            step_progress: state.step_progress,
            progress: state.progress,
            status: state.status,
        }
    }

    pub fn view(&self) -> JobView {
        let runner_attached = self.runner().is_some();
        let state = self.state();
        JobView {
            id: self.id.clone(),
            disc_type: self.disc_type.clone(),
            disc_label: self.disc_label.clone(),
            source_drive: self.source_drive.clone(),
            temp_path: self.temp_path.clone(),
            output_path: self.output_path.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
            steps: state.steps.clone(),
            step_weights: state.step_weights.clone(),
            current_step: state.current_step,
            step_progress: state.step_progress,
            progress: state.progress,
            status: state.status,
            held_drive: state.held_drive.clone(),
            log: state.log.lines(),
            runner_attached,
        }
    }
}
