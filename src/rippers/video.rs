use super::{shell_path, shell_quote};
use crate::config::VideoConfig;
use crate::core::error::PlanError;
use crate::core::job::Job;
use crate::core::plan::{PlannedStep, StepPlanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Dvd,
    Bluray,
}

impl VideoFormat {
    fn name(self) -> &'static str {
        match self {
            Self::Dvd => "DVD",
            Self::Bluray => "BLURAY",
        }
    }
}

/// Video discs: MakeMKV extracts every title (the slow, drive-bound part),
/// then HandBrake transcodes each MKV without the drive.
pub struct VideoDiscRipper {
    format: VideoFormat,
    config: VideoConfig,
}

const RIP_WEIGHT: f64 = 0.7;
const ENCODE_WEIGHT: f64 = 0.3;

impl VideoDiscRipper {
    pub fn new(format: VideoFormat, config: VideoConfig) -> Self {
        Self { format, config }
    }

    fn handbrake_prefix(&self) -> String {
        let binary = if self.config.handbrake_flatpak {
            "flatpak run --command=HandBrakeCLI fr.handbrake.ghb"
        } else {
            "HandBrakeCLI"
        };
        format!(
            "{} --preset-import-file {} -Z {}",
            binary,
            shell_path(&self.config.handbrake_preset_path),
            shell_quote(&self.config.handbrake_preset_name)
        )
    }
}

impl StepPlanner for VideoDiscRipper {
    fn plan(&self, job: &Job) -> Result<Vec<PlannedStep>, PlanError> {
        let name = self.format.name();
        let temp = job.temp_path();
        let out = job.output_path();

        let rip = PlannedStep::new(
            vec![
                "makemkvcon".to_string(),
                "--robot".to_string(),
                "mkv".to_string(),
                format!("dev:{}", job.source_drive()),
                "all".to_string(),
                temp.display().to_string(),
                "--noscan".to_string(),
                "--decrypt".to_string(),
                "--minlength=1".to_string(),
                format!("--progress={}", temp.join("makemkv_progress.txt").display()),
            ],
            format!("Ripping {} with MakeMKV", name),
        )
        .release_drive_after()
        .weight(RIP_WEIGHT);

        // Every title is processed so series discs come out whole.
        let script = if self.config.use_handbrake {
            format!(
                "mkdir -p {out} && for SRC in {temp}/*.mkv; do \
                 OUT={out}/\"$(basename \"${{SRC%.*}}\").{ext}\"; \
                 {hb} -i \"$SRC\" -o \"$OUT\" || exit 1; done",
                out = shell_path(out),
                temp = shell_path(temp),
                ext = self.config.handbrake_format,
                hb = self.handbrake_prefix(),
            )
        } else {
            format!(
                "mkdir -p {out} && cp {temp}/*.mkv {out}/",
                out = shell_path(out),
                temp = shell_path(temp),
            )
        };

        let description = if self.config.use_handbrake {
            format!("Encoding {} titles with HandBrake", name)
        } else {
            format!("Copying {} titles", name)
        };

        Ok(vec![
            rip,
            PlannedStep::new(vec!["bash".to_string(), "-c".to_string(), script], description)
                .weight(ENCODE_WEIGHT),
        ])
    }
}
