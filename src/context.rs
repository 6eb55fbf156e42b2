use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::core::{
    DriveRegistry, JobRegistry, OutputEvent, OutputSink, PlannerRegistry, RunnerContext, RunnerOptions,
};
use crate::rippers;

/// Buffered output events per subscriber before slow ones start lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub drives: DriveRegistry,
    pub jobs: JobRegistry,
    pub planners: Arc<PlannerRegistry>,
    pub output: OutputSink,
    /// Supervisors of every started runner, awaited on shutdown.
    pub tasks: TaskTracker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let planners = rippers::default_planners(&config);
        Self::with_planners(config, planners)
    }

    /// Context with a custom planner table in place of the built-in rippers.
    pub fn with_planners(config: AppConfig, planners: PlannerRegistry) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            jobs: JobRegistry::new(config.log_capacity),
            config: Arc::new(config),
            drives: DriveRegistry::new(),
            planners: Arc::new(planners),
            output,
            tasks: TaskTracker::new(),
        }
    }

    pub fn runner_context(&self) -> RunnerContext {
        RunnerContext {
            drives: self.drives.clone(),
            planners: self.planners.clone(),
            options: RunnerOptions::from(self.config.as_ref()),
            output: Some(self.output.clone()),
        }
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.output.subscribe()
    }
}
