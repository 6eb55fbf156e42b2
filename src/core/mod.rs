pub mod drive;
pub mod error;
pub mod hardware;
pub mod job;
pub mod log_buffer;
pub mod orchestrator;
pub mod plan;
pub mod process;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod snapshot;

pub use drive::{Capability, Drive, DriveRegistry};
pub use error::{JobError, PlanError, ProcessError};
pub use hardware::{DiscInfo, HardwareAdapter, HardwareEvent, OpticalDrive};
pub use job::{Job, JobStatus, JobView, NewJob, Step};
pub use orchestrator::Orchestrator;
pub use plan::{PlannedStep, PlannerRegistry, StepPlanner};
pub use registry::{JobRegistry, sanitize_label};
pub use runner::{JobRunner, OutputEvent, OutputSink, RunnerContext, RunnerOptions};
pub use snapshot::{ResumeSnapshot, find_resumable};
