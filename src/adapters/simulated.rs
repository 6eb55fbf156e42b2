use std::sync::{Arc, Mutex, PoisonError};

use crate::core::drive::Capability;
use crate::core::hardware::{DiscInfo, HardwareAdapter, HardwareEvent, OpticalDrive};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

enum SimulatedCommand {
    InjectAdd(OpticalDrive),
    InjectRemove(String),
    InjectDisc(DiscInfo),
}

/// Handle used by tests and the stdin console to fake hardware.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
}

impl Simulator {
    pub fn add_drive(&self, path: &str, model: &str) {
        let drive = OpticalDrive {
            path: path.to_string(),
            model: model.to_string(),
            capabilities: vec![Capability::Cd, Capability::Dvd, Capability::Bluray],
        };
        let _ = self.tx.send(SimulatedCommand::InjectAdd(drive));
    }

    pub fn remove_drive(&self, path: &str) {
        let _ = self.tx.send(SimulatedCommand::InjectRemove(path.to_string()));
    }

    pub fn insert_disc(&self, drive: &str, disc_type: &str, label: &str) {
        let _ = self.tx.send(SimulatedCommand::InjectDisc(DiscInfo {
            drive: drive.to_string(),
            disc_type: disc_type.to_string(),
            label: label.to_string(),
        }));
    }
}

pub struct SimulatedAdapter {
    // start() takes &self, so the receiver is moved out from behind a lock.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>,
    drives: Arc<Mutex<Vec<OpticalDrive>>>,
    cancel: CancellationToken,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                cmd_rx: Mutex::new(Some(rx)),
                drives: Arc::new(Mutex::new(Vec::new())),
                cancel: CancellationToken::new(),
            },
            Simulator { tx },
        )
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn start(&self, daemon_tx: mpsc::Sender<HardwareEvent>) {
        let Some(mut rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!("SimulatedAdapter already started");
            return;
        };

        let drives = self.drives.clone();
        let cancel = self.cancel.clone();
        info!("Simulated hardware adapter started");

        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };

                let event = match cmd {
                    SimulatedCommand::InjectAdd(drive) => {
                        let mut known = drives.lock().unwrap_or_else(PoisonError::into_inner);
                        known.retain(|d| d.path != drive.path);
                        known.push(drive.clone());
                        HardwareEvent::DriveAdded(drive)
                    }
                    SimulatedCommand::InjectRemove(path) => {
                        drives
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .retain(|d| d.path != path);
                        HardwareEvent::DriveRemoved(path)
                    }
                    SimulatedCommand::InjectDisc(disc) => HardwareEvent::DiscInserted(disc),
                };

                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Simulated hardware adapter stopped");
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_drives(&self) -> anyhow::Result<Vec<OpticalDrive>> {
        Ok(self
            .drives
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
