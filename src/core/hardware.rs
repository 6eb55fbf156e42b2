use tokio::sync::mpsc;

use super::drive::Capability;

#[derive(Debug, Clone)]
pub enum HardwareEvent {
    DriveAdded(OpticalDrive),
    DriveRemoved(String),
    /// A disc was identified in a drive. Detection itself lives outside the
    /// daemon; this only carries its verdict.
    DiscInserted(DiscInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpticalDrive {
    pub path: String,
    pub model: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscInfo {
    pub drive: String,
    /// Disc-type tag, e.g. `cd_audio`, `dvd_video`, `bluray_rom`.
    pub disc_type: String,
    pub label: String,
}

pub trait HardwareAdapter: Send + Sync {
    /// Start watching for drives. Spawns internal tasks that send events to
    /// the provided channel.
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>);

    /// Stop watching.
    fn stop(&self);

    /// Optical drives currently attached.
    fn list_drives(&self) -> anyhow::Result<Vec<OpticalDrive>>;
}
