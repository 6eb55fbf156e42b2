use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::drive::Capability;
use crate::core::hardware::{HardwareAdapter, HardwareEvent, OpticalDrive};

/// Polls udev for optical drives and reports plug/unplug as events.
pub struct LinuxAdapter {
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl LinuxAdapter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn start(&self, tx: mpsc::Sender<HardwareEvent>) {
        let interval = self.poll_interval;
        let cancel = self.cancel.clone();

        info!(interval_secs = interval.as_secs(), "Polling udev for optical drives");

        tokio::spawn(async move {
            let mut known: HashMap<String, OpticalDrive> = HashMap::new();

            loop {
                match tokio::task::spawn_blocking(scan_drives).await {
                    Ok(Ok(current)) => {
                        for event in diff_drives(&mut known, current) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "Drive scan failed"),
                    Err(e) => warn!(error = %e, "Drive scan task panicked"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("udev drive poller stopped");
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_drives(&self) -> Result<Vec<OpticalDrive>> {
        scan_drives()
    }
}

/// Enumerate block devices udev tags as CD-ROM class.
fn scan_drives() -> Result<Vec<OpticalDrive>> {
    let mut enumerator = udev::Enumerator::new().context("Failed to create udev enumerator")?;
    enumerator
        .match_subsystem("block")
        .context("Failed to filter udev by subsystem")?;
    enumerator
        .match_property("ID_CDROM", "1")
        .context("Failed to filter udev by ID_CDROM")?;

    let mut drives = Vec::new();
    for device in enumerator.scan_devices().context("udev scan failed")? {
        let Some(node) = device.devnode() else {
            continue;
        };

        let model = device
            .property_value("ID_MODEL")
            .map(|v| v.to_string_lossy().replace('_', " "))
            .unwrap_or_else(|| "Unknown".to_string());

        let capabilities = [
            ("ID_CDROM_CD", Capability::Cd),
            ("ID_CDROM_DVD", Capability::Dvd),
            ("ID_CDROM_BD", Capability::Bluray),
        ]
        .into_iter()
        .filter(|(key, _)| device.property_value(key).is_some_and(|v| v == "1"))
        .map(|(_, cap)| cap)
        .collect();

        drives.push(OpticalDrive {
            path: node.display().to_string(),
            model,
            capabilities,
        });
    }

    drives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(drives)
}

/// Update `known` to `current` and return the add/remove events between them.
fn diff_drives(
    known: &mut HashMap<String, OpticalDrive>,
    current: Vec<OpticalDrive>,
) -> Vec<HardwareEvent> {
    let mut events = Vec::new();

    let mut gone: Vec<String> = known
        .keys()
        .filter(|path| !current.iter().any(|d| &d.path == *path))
        .cloned()
        .collect();
    gone.sort();
    for path in gone {
        known.remove(&path);
        events.push(HardwareEvent::DriveRemoved(path));
    }

    for drive in current {
        if !known.contains_key(&drive.path) {
            known.insert(drive.path.clone(), drive.clone());
            events.push(HardwareEvent::DriveAdded(drive));
        }
    }

    events
}
