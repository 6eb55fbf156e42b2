//! Linux adapter tests against the host's udev database.
//!
//! Run ignored tests: `cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use ripd::adapters::LinuxAdapter;
use ripd::core::{HardwareAdapter, HardwareEvent};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn has_udev() -> bool {
    Path::new("/run/udev").exists()
}

#[tokio::test]
#[ignore] // needs a udev database
async fn test_list_drives_reports_block_paths() {
    if !has_udev() {
        eprintln!("Skipping: no udev");
        return;
    }

    let adapter = LinuxAdapter::with_defaults();
    let drives = adapter.list_drives().expect("udev enumeration failed");

    for drive in drives {
        assert!(drive.path.starts_with("/dev/"), "unexpected path {}", drive.path);
    }
}

#[tokio::test]
#[ignore] // needs a udev database
async fn test_first_poll_announces_attached_drives() {
    if !has_udev() {
        eprintln!("Skipping: no udev");
        return;
    }

    let adapter = LinuxAdapter::new(Duration::from_millis(200));
    let attached = adapter.list_drives().expect("udev enumeration failed");
    let (tx, mut rx) = mpsc::channel(32);
    adapter.start(tx);

    for _ in 0..attached.len() {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout waiting for event")
            .expect("channel closed");
        assert!(matches!(event, HardwareEvent::DriveAdded(_)));
    }

    adapter.stop();
}
