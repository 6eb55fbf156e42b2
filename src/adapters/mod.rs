use crate::config::AppConfig;
use crate::core::hardware::HardwareAdapter;
use tracing::warn;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{SimulatedAdapter, Simulator};

const SIMULATOR_USAGE: &str =
    "(Simulator) Use: 'add <drive> [model]', 'rm <drive>' or 'insert <drive> <disc_type> <label>'";

pub fn get_adapter(config: &AppConfig) -> Box<dyn HardwareAdapter> {
    if config.simulation {
        let (adapter, controller) = SimulatedAdapter::new();
        std::thread::spawn(move || drive_simulator_from_stdin(controller));
        return Box::new(adapter);
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxAdapter::new(config.drive_poll_interval()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("No hardware adapter for this platform, falling back to the simulator");
        let (adapter, controller) = SimulatedAdapter::new();
        std::thread::spawn(move || drive_simulator_from_stdin(controller));
        Box::new(adapter)
    }
}

fn drive_simulator_from_stdin(controller: Simulator) {
    let stdin = std::io::stdin();
    for line in stdin.lines() {
        let Ok(cmd) = line else {
            break;
        };
        let parts: Vec<&str> = cmd.split_whitespace().collect();

        match parts.as_slice() {
            ["add", drive] => controller.add_drive(drive, "Simulated Drive"),
            ["add", drive, model @ ..] => controller.add_drive(drive, &model.join(" ")),
            ["rm", drive] => controller.remove_drive(drive),
            ["insert", drive, disc_type, label @ ..] if !label.is_empty() => {
                controller.insert_disc(drive, disc_type, &label.join(" "))
            }
            [] => {}
            _ => warn!("{}", SIMULATOR_USAGE),
        }
    }
}
