use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// System-wide config file, overridable with `RIPD_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ripd/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Root under which each job gets its own working directory.
    pub temp_directory: PathBuf,
    /// Fallback output root for disc types without their own.
    pub output_directory: PathBuf,
    /// Number of trailing output lines kept in memory per job.
    pub log_capacity: usize,
    /// Run `eject` when a drive is released by a step or a cancellation.
    pub eject_on_release: bool,
    /// Seconds a cancelled step may linger after SIGTERM before SIGKILL.
    pub kill_grace_secs: u64,
    pub drive_poll_interval_secs: u64,
    /// Output lines after which an in-flight step is estimated at ~50%.
    pub progress_half_way_lines: u32,
    pub resume_on_start: bool,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub cd: CdConfig,
    pub data: DataConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdConfig {
    pub output_directory: Option<PathBuf>,
    pub output_format: String,
    pub abcde_config: PathBuf,
    pub additional_options: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Bzip2,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    pub output_directory: Option<PathBuf>,
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    pub output_directory: Option<PathBuf>,
    pub use_handbrake: bool,
    pub handbrake_preset_path: PathBuf,
    pub handbrake_preset_name: String,
    pub handbrake_format: String,
    pub handbrake_flatpak: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_directory: PathBuf::from("/var/lib/ripd/temp"),
            output_directory: PathBuf::from("/var/lib/ripd/output"),
            log_capacity: 15,
            eject_on_release: true,
            kill_grace_secs: 5,
            drive_poll_interval_secs: 5,
            progress_half_way_lines: 200,
            resume_on_start: false,
            simulation: false,
            verbose: false,
            json_logs: false,
            cd: CdConfig {
                output_directory: None,
                output_format: "flac".to_string(),
                abcde_config: PathBuf::from("/etc/abcde.conf"),
                additional_options: String::new(),
            },
            data: DataConfig {
                output_directory: None,
                compression: Compression::Zstd,
            },
            video: VideoConfig {
                output_directory: None,
                use_handbrake: true,
                handbrake_preset_path: PathBuf::from("/etc/ripd/handbrake-preset.json"),
                handbrake_preset_name: "Fast 1080p30".to_string(),
                handbrake_format: "mkv".to_string(),
                handbrake_flatpak: false,
            },
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `RIPD_*` env vars and CLI overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = std::env::var("RIPD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RIPD_").ignore(&["config"]).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", path))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn drive_poll_interval(&self) -> Duration {
        Duration::from_secs(self.drive_poll_interval_secs.max(1))
    }

    /// Output root for a disc-type tag, falling back to `output_directory`.
    pub fn output_root_for(&self, disc_type: &str) -> PathBuf {
        let specific = match disc_type.to_lowercase().as_str() {
            "cd_audio" => self.cd.output_directory.clone(),
            "dvd_video" | "bluray_video" => self.video.output_directory.clone(),
            _ => self.data.output_directory.clone(),
        };
        specific.unwrap_or_else(|| self.output_directory.clone())
    }
}
