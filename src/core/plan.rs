//! Step plans and the disc-type strategy table.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::PlanError;
use super::job::Job;

/// One external command in a job's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub argv: Vec<String>,
    pub description: String,
    /// Free the drive (and eject) once this step succeeds.
    pub release_drive_after: bool,
    /// Fraction of total effort. `None` means "unset"; the runner then
    /// splits evenly across the plan.
    pub weight: Option<f64>,
}

impl PlannedStep {
    pub fn new(argv: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            argv,
            description: description.into(),
            release_drive_after: false,
            weight: None,
        }
    }

    pub fn release_drive_after(mut self) -> Self {
        self.release_drive_after = true;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Builds the ordered steps for a job. Must be deterministic for the same
/// job and configuration, since resumed jobs rebuild their plan.
pub trait StepPlanner: Send + Sync {
    fn plan(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError>;
}

impl<F> StepPlanner for F
where
    F: Fn(&Job) -> Result<Vec<PlannedStep>, PlanError> + Send + Sync,
{
    fn plan(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError> {
        self(job)
    }
}

/// Maps a disc-type tag to its planner. Tags are case-insensitive.
#[derive(Clone, Default)]
pub struct PlannerRegistry {
    planners: HashMap<String, Arc<dyn StepPlanner>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, disc_type: &str, planner: Arc<dyn StepPlanner>) {
        self.planners.insert(disc_type.to_lowercase(), planner);
    }

    pub fn with(mut self, disc_type: &str, planner: Arc<dyn StepPlanner>) -> Self {
        self.register(disc_type, planner);
        self
    }

    pub fn disc_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.planners.keys().cloned().collect();
        types.sort();
        types
    }

    /// Resolve the job's planner and validate the plan's shape.
    pub fn plan_for(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError> {
        let disc_type = job.disc_type().to_lowercase();
        let planner = self
            .planners
            .get(&disc_type)
            .ok_or_else(|| PlanError::UnsupportedDiscType(job.disc_type().to_string()))?;

        let steps = planner.plan(job)?;
        if steps.is_empty() {
            return Err(PlanError::Empty(disc_type));
        }
        if let Some(index) = steps.iter().position(|s| s.argv.is_empty()) {
            return Err(PlanError::EmptyCommand { index });
        }
        Ok(steps)
    }
}
