//! Phase A: discover autopilots, pick firmware for each and reflash them
//! in parallel.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::cubepilot::batchupdater::bootloader::{find_bootloader, Uploader, UploaderOptions};
use crate::cubepilot::batchupdater::com::{ports, serial::SerialPortLink};
use crate::cubepilot::batchupdater::config::UpdaterConfig;
use crate::cubepilot::batchupdater::firmware::{
    apj::FirmwareBundle, board_name_for_board_id, FirmwareCatalog,
};
use crate::cubepilot::batchupdater::progress::{DeviceKind, DeviceState, ProgressBus};
use crate::cubepilot::batchupdater::{Error, ProgressUpdate};

/// Rounds of port scanning; reboots cause USB re-enumeration, so one pass
/// is not enough
const DETECTION_ROUNDS: usize = 3;
const ROUND_DELAY: Duration = Duration::from_millis(500);

// CubeRecord -------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CubeRecord {
    pub port: String,
    pub board_type: u32,
    pub board_rev: u32,
    pub board_name: String,
    pub firmware: Option<PathBuf>,
}

impl CubeRecord {
    pub fn device_key(&self) -> String {
        format!("cube_{}", self.port.replace('/', "_"))
    }
}

// CubeUpdater ------------------------------------------------------------------------------------

pub struct CubeUpdater {
    config: UpdaterConfig,
    progress: Arc<ProgressBus>,
    catalog: Arc<FirmwareCatalog>,
    stop: Arc<AtomicBool>,
}

impl CubeUpdater {
    pub fn new(
        config: UpdaterConfig,
        progress: Arc<ProgressBus>,
        catalog: Arc<FirmwareCatalog>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        CubeUpdater {
            config,
            progress,
            catalog,
            stop,
        }
    }

    fn candidate_ports(&self) -> Vec<String> {
        if self.config.ports.is_empty() {
            ports::autopilot_ports()
        } else {
            self.config.ports.clone()
        }
    }

    fn make_uploader(&self, port: &str) -> Uploader<SerialPortLink> {
        let link = SerialPortLink::new(port, self.config.baud_bootloader);
        let mut up = Uploader::new(
            link,
            UploaderOptions {
                baud_bootloader: self.config.baud_bootloader,
                baud_flightstack: self.config.baud_flightstack.clone(),
                ..Default::default()
            },
        );
        up.set_cancel_flag(self.stop.clone());
        up
    }

    /// Scans candidate ports for boards in (or coaxable into) their
    /// bootloader.
    pub fn detect_devices(&self) -> Vec<CubeRecord> {
        let mut devices: Vec<CubeRecord> = Vec::new();

        for round in 0..DETECTION_ROUNDS {
            self.progress.console(format!(
                "Device detection attempt {}/{}",
                round + 1,
                DETECTION_ROUNDS
            ));

            for port in self.candidate_ports() {
                if devices.iter().any(|d| d.port == port) {
                    continue;
                }

                let mut up = self.make_uploader(&port);
                match find_bootloader(&mut up) {
                    Ok(true) => {
                        let board_type = up.board_type();
                        let board_name = board_name_for_board_id(board_type)
                            .map(|name| name.to_string())
                            .unwrap_or_else(|| format!("Unknown_{}", board_type));
                        self.progress
                            .console(format!("Found {} on {}", board_name, port));
                        devices.push(CubeRecord {
                            port: port.clone(),
                            board_type,
                            board_rev: up.board_rev(),
                            board_name,
                            firmware: None,
                        });
                    }
                    Ok(false) => {}
                    Err(Error::Cancelled) => {
                        up.close();
                        return devices;
                    }
                    Err(e) => {
                        log::debug!("{}: {}", port, e);
                    }
                }
                up.close();
            }

            if round + 1 < DETECTION_ROUNDS {
                std::thread::sleep(ROUND_DELAY);
            }
        }

        self.progress
            .console(format!("Total devices detected: {}", devices.len()));
        devices
    }

    /// Matches detected boards against the catalog; boards with firmware
    /// get a progress row and are returned for flashing.
    pub fn check_firmware_versions(&self, devices: Vec<CubeRecord>) -> Vec<CubeRecord> {
        let mut needing_update = Vec::new();

        for mut device in devices {
            match self.catalog.find_cube_firmware(device.board_type) {
                Some(bundle) => {
                    self.progress.console(format!(
                        "{}: firmware {} matches board {}",
                        device.port,
                        bundle.path.display(),
                        device.board_type
                    ));
                    device.firmware = Some(bundle.path.clone());
                    self.progress.add_device(
                        &device.device_key(),
                        &device.board_name,
                        &device.port,
                        DeviceKind::Cube,
                    );
                    needing_update.push(device);
                }
                None => {
                    self.progress.console(format!(
                        "{}: no firmware for board type {}, skipping",
                        device.port, device.board_type
                    ));
                }
            }
        }

        needing_update
    }

    /// Flashes every device on its own thread; true when all succeeded.
    pub fn update_devices(&self, devices: &[CubeRecord]) -> bool {
        if devices.is_empty() {
            return true;
        }

        let results: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = devices
                .iter()
                .map(|device| scope.spawn(move || self.update_single_device(device)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or(false))
                .collect()
        });

        results.iter().all(|&ok| ok)
    }

    fn update_single_device(&self, device: &CubeRecord) -> bool {
        let key = device.device_key();
        match self.flash_device(device, &key) {
            Ok(()) => {
                self.progress
                    .update_device(&key, DeviceState::Complete, 100.0);
                self.progress
                    .console(format!("{}: firmware update completed", device.port));
                true
            }
            Err(e) => {
                let message = e.to_string();
                let short = if message.chars().count() > 50 {
                    let head: String = message.chars().take(50).collect();
                    format!("{}...", head)
                } else {
                    message.clone()
                };
                self.progress
                    .update_device_err(&key, DeviceState::Failed, 0.0, Some(short));
                self.progress
                    .console(format!("{}: update failed - {}", device.port, message));
                false
            }
        }
    }

    fn flash_device(&self, device: &CubeRecord, key: &str) -> crate::cubepilot::batchupdater::Result<()> {
        self.progress
            .update_device(key, DeviceState::Connecting, 0.0);

        let firmware_path = device.firmware.as_ref().ok_or_else(|| {
            Error::BundleParse {
                path: String::new(),
                reason: "no firmware matched".to_string(),
            }
        })?;
        let fw = FirmwareBundle::load(firmware_path)?;

        let mut up = self.make_uploader(&device.port);
        up.set_progress_fn(self.progress_fn(key));

        if !find_bootloader(&mut up)? {
            up.close();
            return Err(Error::ProtocolDesync("bootloader not found".to_string()));
        }

        let result = up.upload(&fw, false, None);
        up.close();
        result
    }

    /// Maps uploader progress onto the unified phase scale:
    /// erase 0-20, program 20-90, verify 95.
    fn progress_fn(
        &self,
        key: &str,
    ) -> Box<dyn Fn(ProgressUpdate) + Send> {
        let progress = self.progress.clone();
        let key = key.to_string();
        Box::new(move |update| match update {
            ProgressUpdate::Message(text) => {
                progress.console(format!("[{}] {}", key, text));
            }
            ProgressUpdate::EraseProgress { percent }
            | ProgressUpdate::ExtfEraseProgress { percent } => {
                progress.update_device(&key, DeviceState::Erasing, (percent * 0.2).min(20.0));
            }
            ProgressUpdate::ProgramProgress { current, total }
            | ProgressUpdate::ExtfProgramProgress { current, total } => {
                let percent = current as f32 / total.max(1) as f32 * 100.0;
                progress.update_device(
                    &key,
                    DeviceState::Uploading,
                    (20.0 + percent * 0.7).min(90.0),
                );
            }
            ProgressUpdate::VerifyProgress { .. } => {
                progress.update_device(&key, DeviceState::Verifying, 95.0);
            }
        })
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use flate2::{write::ZlibEncoder, Compression};
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    fn write_apj(dir: &std::path::Path, name: &str, board_id: u32) {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0u8; 16]).unwrap();
        let image = base64::engine::general_purpose::STANDARD.encode(encoder.finish().unwrap());
        let doc = serde_json::json!({
            "image": image,
            "image_size": 16,
            "board_id": board_id,
            "board_revision": 0,
        });
        std::fs::write(dir.join(name), serde_json::to_string(&doc).unwrap()).unwrap();
    }

    fn updater_with_catalog(dir: &std::path::Path) -> CubeUpdater {
        CubeUpdater::new(
            UpdaterConfig::default(),
            Arc::new(ProgressBus::new()),
            Arc::new(FirmwareCatalog::new(dir)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn record(port: &str, board_type: u32) -> CubeRecord {
        CubeRecord {
            port: port.to_string(),
            board_type,
            board_rev: 0,
            board_name: board_name_for_board_id(board_type)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("Unknown_{}", board_type)),
            firmware: None,
        }
    }

    #[test]
    fn device_key_escapes_path() {
        assert_eq!(
            record("/dev/ttyACM0", 140).device_key(),
            "cube__dev_ttyACM0"
        );
    }

    #[test]
    fn exact_board_id_match() {
        let dir = tempfile::tempdir().unwrap();
        write_apj(dir.path(), "cubeorange.apj", 140);
        let updater = updater_with_catalog(dir.path());

        let matched = updater.check_firmware_versions(vec![record("/dev/ttyACM0", 140)]);
        assert_eq!(matched.len(), 1);
        assert!(matched[0].firmware.is_some());

        // a progress row was created for the device
        let snap = updater.progress.snapshot();
        assert!(snap.devices.contains_key("cube__dev_ttyACM0"));
    }

    #[test]
    fn compatibility_fallback_for_board_33() {
        let dir = tempfile::tempdir().unwrap();
        write_apj(dir.path(), "fmuv3.apj", 9);
        let updater = updater_with_catalog(dir.path());

        let matched = updater.check_firmware_versions(vec![record("/dev/ttyACM1", 33)]);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn unmatched_board_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_apj(dir.path(), "fmuv3.apj", 9);
        let updater = updater_with_catalog(dir.path());

        let matched = updater.check_firmware_versions(vec![record("/dev/ttyACM2", 999)]);
        assert!(matched.is_empty());
        assert!(updater.progress.snapshot().devices.is_empty());
    }

    #[test]
    fn empty_device_list_updates_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_catalog(dir.path());
        assert!(updater.update_devices(&[]));
    }
}
