use crate::config::CdConfig;
use crate::core::error::PlanError;
use crate::core::job::Job;
use crate::core::plan::{PlannedStep, StepPlanner};

/// Audio CDs: a single abcde run that rips and encodes. abcde ejects on its
/// own, so the drive is free as soon as it exits.
pub struct AudioCdRipper {
    config: CdConfig,
}

impl AudioCdRipper {
    pub fn new(config: CdConfig) -> Self {
        Self { config }
    }
}

impl StepPlanner for AudioCdRipper {
    fn plan(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError> {
        let mut argv = vec![
            "abcde".to_string(),
            "-d".to_string(),
            job.source_drive().to_string(),
            "-o".to_string(),
            self.config.output_format.clone(),
            "-c".to_string(),
            self.config.abcde_config.display().to_string(),
            "-N".to_string(),
        ];
        argv.extend(self.config.additional_options.split_whitespace().map(String::from));

        Ok(vec![
            PlannedStep::new(argv, "Ripping & Encoding Audio CD")
                .release_drive_after()
                .weight(1.0),
        ])
    }
}
