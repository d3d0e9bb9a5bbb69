//! Two-phase run sequencing: serial cube updates first, then the CAN
//! monitoring/update phase, gated on Phase A success.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cubepilot::batchupdater::config::UpdaterConfig;
use crate::cubepilot::batchupdater::cube::CubeUpdater;
use crate::cubepilot::batchupdater::dronecan::monitor::CanMonitor;
use crate::cubepilot::batchupdater::firmware::FirmwareCatalog;
use crate::cubepilot::batchupdater::progress::ProgressBus;

pub struct BatchUpdater {
    config: UpdaterConfig,
    progress: Arc<ProgressBus>,
    stop: Arc<AtomicBool>,
}

impl BatchUpdater {
    pub fn new(config: UpdaterConfig, progress: Arc<ProgressBus>, stop: Arc<AtomicBool>) -> Self {
        BatchUpdater {
            config,
            progress,
            stop,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Runs both phases; the returned value is the process exit code.
    pub fn run(&self) -> i32 {
        self.progress.console("DroneCAN Batch Firmware Updater");

        let catalog = Arc::new(FirmwareCatalog::new(&self.config.firmware_dir));

        if !self.config.skip_cube_update {
            if let Some(code) = self.run_cube_phase(&catalog) {
                return code;
            }
        } else {
            self.progress
                .console("Cube firmware update phase skipped (--skip-cube-update flag)");
        }

        if self.stopped() {
            return 0;
        }

        self.progress.console("Phase B: DroneCAN Continuous Monitoring");
        self.progress.console("Dynamic Node Allocation Server: Starting...");

        let monitor = CanMonitor::new(
            self.config.clone(),
            self.progress.clone(),
            catalog,
            self.stop.clone(),
        );
        match monitor.run() {
            Ok(()) => 0,
            Err(e) => {
                self.progress
                    .console(format!("DroneCAN monitoring failed: {}", e));
                log::error!("monitoring failed: {}", e);
                1
            }
        }
    }

    /// Phase A. `Some(code)` aborts the run with that exit code.
    fn run_cube_phase(&self, catalog: &Arc<FirmwareCatalog>) -> Option<i32> {
        self.progress.console("Phase A: Cube Firmware Update");

        if !catalog.exists() {
            self.progress.console(format!(
                "Error: firmware directory not found: {}",
                self.config.firmware_dir.display()
            ));
            self.progress
                .console("Create the firmware directory and add APJ files for Cubes");
            return Some(1);
        }

        self.progress.console("Scanning for connected Cube devices...");
        let cube = CubeUpdater::new(
            self.config.clone(),
            self.progress.clone(),
            catalog.clone(),
            self.stop.clone(),
        );

        let devices = cube.detect_devices();
        if devices.is_empty() {
            self.progress.console("No Cube devices detected.");
            return None;
        }
        self.progress
            .console(format!("Found {} Cube device(s)", devices.len()));

        let needing_update = cube.check_firmware_versions(devices);
        if needing_update.is_empty() {
            self.progress.console("All Cube devices are up to date.");
            return None;
        }
        self.progress
            .console(format!("{} Cube(s) will be updated", needing_update.len()));

        let proceed = if self.config.auto_yes {
            self.progress
                .console("Auto-proceeding with updates (-y flag)");
            true
        } else {
            confirm_update(needing_update.len())
        };
        if !proceed {
            self.progress.console("Cube updates skipped by user.");
            return None;
        }

        self.progress.console("Starting Cube firmware updates...");
        if cube.update_devices(&needing_update) {
            self.progress
                .console("All Cube updates completed successfully!");
            None
        } else {
            self.progress
                .console("Some Cube updates failed. Check logs for details.");
            self.progress
                .console("Stopping here. Fix cube update issues before proceeding.");
            Some(1)
        }
    }
}

fn confirm_update(count: usize) -> bool {
    print!("Update {} Cube(s)? (y/N): ", count);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    parse_confirmation(&answer)
}

fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_parsing() {
        assert!(parse_confirmation("y\n"));
        assert!(parse_confirmation("YES\n"));
        assert!(parse_confirmation(" yes "));
        assert!(!parse_confirmation("\n"));
        assert!(!parse_confirmation("n\n"));
        assert!(!parse_confirmation("maybe"));
    }

    #[test]
    fn missing_firmware_directory_fails_phase_a() {
        let config = UpdaterConfig {
            firmware_dir: std::path::PathBuf::from("/nonexistent/firmware-tree"),
            ..Default::default()
        };
        let updater = BatchUpdater::new(
            config,
            Arc::new(ProgressBus::new()),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(updater.run(), 1);
    }
}
