//! Default step plans per disc type.
//!
//! Each ripper only builds argv lists; the runner owns execution. Plans are
//! pure functions of the job and the ripper's config so a resumed job gets
//! the same steps back.

mod audio;
mod data;
mod video;

use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::plan::PlannerRegistry;

pub use audio::AudioCdRipper;
pub use data::DataDiscRipper;
pub use video::{VideoDiscRipper, VideoFormat};

/// Planner table for every disc type the daemon knows how to rip.
pub fn default_planners(config: &AppConfig) -> PlannerRegistry {
    let data = Arc::new(DataDiscRipper::new(config.data.clone()));

    PlannerRegistry::new()
        .with("cd_audio", Arc::new(AudioCdRipper::new(config.cd.clone())))
        .with("cd_rom", data.clone())
        .with("dvd_rom", data.clone())
        .with("bluray_rom", data)
        .with(
            "dvd_video",
            Arc::new(VideoDiscRipper::new(VideoFormat::Dvd, config.video.clone())),
        )
        .with(
            "bluray_video",
            Arc::new(VideoDiscRipper::new(VideoFormat::Bluray, config.video.clone())),
        )
}

/// Quote one word for `sh -c`.
pub(crate) fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

pub(crate) fn shell_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_disc_type_has_a_planner() {
        let planners = default_planners(&AppConfig::default());
        assert_eq!(
            planners.disc_types(),
            vec!["bluray_rom", "bluray_video", "cd_audio", "cd_rom", "dvd_rom", "dvd_video"]
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
