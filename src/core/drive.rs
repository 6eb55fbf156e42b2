//! Physical optical drives and their reservation state.
//!
//! The registry is the single point of truth for "who owns this drive".
//! A job must win `reserve` before its runner touches the device and every
//! exit path must `release` it again.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Capability {
    Cd,
    Dvd,
    Bluray,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Drive {
    pub path: String,
    pub model: String,
    pub capabilities: BTreeSet<Capability>,
    pub job_id: Option<String>,
    pub disc_label: Option<String>,
    pub blacklisted: bool,
}

impl Drive {
    pub fn is_available(&self) -> bool {
        self.job_id.is_none() && !self.blacklisted
    }
}

/// Thread-safe drive table. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct DriveRegistry {
    inner: Arc<Mutex<HashMap<String, Drive>>>,
}

impl DriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic elsewhere must not wedge every drive forever.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Drive>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a drive. Re-registering refreshes model and capabilities but
    /// keeps any reservation and the blacklist flag.
    pub fn register(
        &self,
        path: &str,
        model: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Drive {
        let mut drives = self.lock();
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();

        let drive = drives
            .entry(path.to_string())
            .and_modify(|d| {
                d.model = model.to_string();
                d.capabilities = capabilities.clone();
            })
            .or_insert_with(|| {
                info!(drive = %path, model = %model, "Registered drive");
                Drive {
                    path: path.to_string(),
                    model: model.to_string(),
                    capabilities,
                    job_id: None,
                    disc_label: None,
                    blacklisted: false,
                }
            });

        drive.clone()
    }

    pub fn unregister(&self, path: &str) -> Option<Drive> {
        let removed = self.lock().remove(path);
        if removed.is_some() {
            info!(drive = %path, "Unregistered drive");
        }
        removed
    }

    pub fn get(&self, path: &str) -> Option<Drive> {
        self.lock().get(path).cloned()
    }

    /// All drives, sorted by path for stable output.
    pub fn list(&self) -> Vec<Drive> {
        let mut drives: Vec<Drive> = self.lock().values().cloned().collect();
        drives.sort_by(|a, b| a.path.cmp(&b.path));
        drives
    }

    /// Claim a drive for a job. Succeeds only if the drive exists and is
    /// available; check and claim happen under one lock.
    pub fn reserve(&self, path: &str, job_id: &str) -> bool {
        let mut drives = self.lock();
        match drives.get_mut(path) {
            Some(drive) if drive.is_available() => {
                drive.job_id = Some(job_id.to_string());
                debug!(drive = %path, job_id = %job_id, "Drive reserved");
                true
            }
            _ => false,
        }
    }

    /// Clear the holder unconditionally. Safe to call any number of times.
    pub fn release(&self, path: &str) {
        if let Some(drive) = self.lock().get_mut(path) {
            if let Some(job_id) = drive.job_id.take() {
                debug!(drive = %path, job_id = %job_id, "Drive released");
            }
        }
    }

    pub fn holder_of(&self, path: &str) -> Option<String> {
        self.lock().get(path).and_then(|d| d.job_id.clone())
    }

    pub fn set_disc_label(&self, path: &str, label: Option<String>) {
        if let Some(drive) = self.lock().get_mut(path) {
            drive.disc_label = label;
        }
    }

    pub fn blacklist(&self, path: &str) -> bool {
        self.set_blacklisted(path, true)
    }

    pub fn unblacklist(&self, path: &str) -> bool {
        self.set_blacklisted(path, false)
    }

    fn set_blacklisted(&self, path: &str, value: bool) -> bool {
        match self.lock().get_mut(path) {
            Some(drive) => {
                drive.blacklisted = value;
                info!(drive = %path, blacklisted = value, "Drive blacklist updated");
                true
            }
            None => false,
        }
    }
}
