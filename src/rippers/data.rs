use std::path::{Path, PathBuf};

use super::shell_path;
use crate::config::{Compression, DataConfig};
use crate::core::error::PlanError;
use crate::core::job::Job;
use crate::core::plan::{PlannedStep, StepPlanner};
use crate::core::registry::sanitize_label;

/// Data discs: dump an ISO while the drive is needed, then compress or copy
/// it to the output location with the drive already ejected.
pub struct DataDiscRipper {
    config: DataConfig,
}

impl DataDiscRipper {
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

impl StepPlanner for DataDiscRipper {
    fn plan(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError> {
        let iso = job
            .temp_path()
            .join(format!("{}.iso", sanitize_label(job.disc_label())));
        let out_dir = job.output_path().parent().unwrap_or(Path::new("/"));
        let mkdir = format!("mkdir -p {}", shell_path(out_dir));

        let dump = PlannedStep::new(
            vec![
                "dd".to_string(),
                format!("if={}", job.source_drive()),
                format!("of={}", iso.display()),
                "bs=2048".to_string(),
                "status=progress".to_string(),
            ],
            "Creating ISO image",
        )
        .release_drive_after();

        let (script, description) = match self.config.compression {
            Compression::Zstd => (
                format!(
                    "{} && zstd -f {} -o {}",
                    mkdir,
                    shell_path(&iso),
                    shell_path(&with_suffix(job.output_path(), ".iso.zst"))
                ),
                "Compressing ISO (zstd)",
            ),
            Compression::Bzip2 => (
                format!(
                    "{} && bzip2 -c {} > {}",
                    mkdir,
                    shell_path(&iso),
                    shell_path(&with_suffix(job.output_path(), ".iso.bz2"))
                ),
                "Compressing ISO (bzip2)",
            ),
            Compression::None => (
                format!(
                    "{} && cp {} {}",
                    mkdir,
                    shell_path(&iso),
                    shell_path(&with_suffix(job.output_path(), ".iso"))
                ),
                "Copying ISO to final destination",
            ),
        };

        Ok(vec![
            dump,
            PlannedStep::new(vec!["sh".to_string(), "-c".to_string(), script], description),
        ])
    }
}
