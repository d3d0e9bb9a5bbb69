//! Per-peer firmware update state machine.
//!
//! One driver runs per peer, on its own thread, and observes the peer
//! purely through NodeStatus modes and debug log lines:
//!
//! ```text
//! Pending -> WaitingOperational -> ForceMaintenance -> BeginUpdate
//!         -> Updating -> BootloaderFlash -> Restart -> Complete
//! ```
//!
//! A peer already running the target version skips straight to the
//! bootloader self-flash; the final restart always happens.

use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::dronecan::messages::node_mode;
use crate::cubepilot::batchupdater::dronecan::registry::BootloaderState;
use crate::cubepilot::batchupdater::progress::{DeviceState, ProgressBus};
use crate::cubepilot::batchupdater::{Error, Result};

// PeerLink ---------------------------------------------------------------------------------------

/// What a driver can observe from its peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Status { mode: u8, vendor_status: u16 },
    Log { text: String },
}

///
/// Seam between the state machine and the CAN node runtime. All sends go
/// out at service priority 30; the driver never blocks the dispatcher.
///
pub trait PeerLink {
    /// Current display key; follows node-id changes mid-update
    fn key(&self) -> String;

    /// RestartNode request with the restart magic number
    fn send_restart(&self);

    /// file.BeginFirmwareUpdate pointing at the served path key
    fn send_begin_update(&self, file_key: &str);

    /// param.GetSet FLASH_BOOTLOADER=1
    fn send_flash_bootloader(&self);

    /// Next event from this peer, waiting at most `timeout`
    fn recv_event(&self, timeout: Duration) -> Option<PeerEvent>;

    /// Publishes the bootloader self-flash outcome
    fn set_bootloader_state(&self, state: BootloaderState);

    /// Cooperative stop flag
    fn stopped(&self) -> bool;

    /// True once the peer has been dropped from the registry (silent for
    /// longer than the staleness window)
    fn vanished(&self) -> bool {
        false
    }
}

// Timings ----------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverTimings {
    pub operational_wait: Duration,
    pub maintenance_timeout: Duration,
    pub restart_interval: Duration,
    pub begin_retry: Duration,
    pub update_timeout: Duration,
    pub bootloader_timeout: Duration,
    pub param_interval: Duration,
    pub poll: Duration,
}

impl Default for DriverTimings {
    fn default() -> Self {
        DriverTimings {
            operational_wait: Duration::from_secs(10),
            maintenance_timeout: Duration::from_secs(30),
            restart_interval: Duration::from_secs(5),
            begin_retry: Duration::from_secs(1),
            update_timeout: Duration::from_secs(1200),
            bootloader_timeout: Duration::from_secs(30),
            param_interval: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }
}

// Update context ---------------------------------------------------------------------------------

pub struct UpdateContext {
    /// Size of the firmware file in bytes, for flash progress scaling
    pub firmware_size: u64,
    /// Version encoded in the firmware file name, if any
    pub target_version: Option<String>,
    /// Peer version captured at discovery
    pub current_version: String,
    /// Wire path key under which the file server offers the image
    pub file_key: String,
    pub timings: DriverTimings,
}

// Driver -----------------------------------------------------------------------------------------

///
/// Runs the whole update sequence for one peer. Progress goes to the bus
/// under the link's (possibly changing) key; errors leave the row to the
/// caller.
///
pub fn run_update<P: PeerLink>(
    link: &P,
    progress: &ProgressBus,
    ctx: &UpdateContext,
) -> Result<()> {
    let timings = &ctx.timings;

    progress.update_device(&link.key(), DeviceState::Connecting, 5.0);
    progress.console(format!("{} starting firmware update", link.key()));

    let operational = wait_for_operational(link, timings)?;
    if !operational {
        progress.console(format!(
            "{} timeout waiting for operational mode, proceeding anyway",
            link.key()
        ));
    }

    let skip_flash = match &ctx.target_version {
        Some(target) if operational && *target == ctx.current_version => {
            progress.console(format!(
                "{} already has target firmware version {}, skipping firmware update",
                link.key(),
                target
            ));
            true
        }
        _ => false,
    };

    if !skip_flash {
        progress.update_device(&link.key(), DeviceState::Preparing, 15.0);
        force_maintenance(link, progress, timings)?;

        progress.update_device(&link.key(), DeviceState::Uploading, 20.0);
        flash_firmware(link, progress, ctx)?;
    }

    progress.update_device(&link.key(), DeviceState::Bootloader, 90.0);
    flash_bootloader(link, progress, timings)?;

    progress.update_device(&link.key(), DeviceState::Restarting, 95.0);
    link.send_restart();
    progress.console(format!("{} restart request sent", link.key()));

    progress.update_device(&link.key(), DeviceState::Complete, 100.0);
    Ok(())
}

fn check_stop<P: PeerLink>(link: &P) -> Result<()> {
    if link.stopped() {
        return Err(Error::Cancelled);
    }
    if link.vanished() {
        return Err(Error::PeerTimeout(link.key()));
    }
    Ok(())
}

/// Waits for the peer to report OPERATIONAL; `Ok(false)` on timeout.
fn wait_for_operational<P: PeerLink>(link: &P, timings: &DriverTimings) -> Result<bool> {
    let deadline = Instant::now() + timings.operational_wait;
    while Instant::now() < deadline {
        check_stop(link)?;
        if let Some(PeerEvent::Status { mode, .. }) = link.recv_event(timings.poll) {
            if mode == node_mode::OPERATIONAL {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Restarts the peer every 5 s until it reports MAINTENANCE; after 30 s
/// the update proceeds best-effort.
fn force_maintenance<P: PeerLink>(
    link: &P,
    progress: &ProgressBus,
    timings: &DriverTimings,
) -> Result<()> {
    let deadline = Instant::now() + timings.maintenance_timeout;
    let mut last_restart: Option<Instant> = None;

    while Instant::now() < deadline {
        check_stop(link)?;

        let due = match last_restart {
            Some(last) => last.elapsed() >= timings.restart_interval,
            None => true,
        };
        if due {
            link.send_restart();
            progress.console(format!("{} sending restart request", link.key()));
            last_restart = Some(Instant::now());
        }

        if let Some(PeerEvent::Status { mode, .. }) = link.recv_event(timings.poll) {
            if mode == node_mode::MAINTENANCE {
                progress.console(format!("{} entered maintenance mode", link.key()));
                return Ok(());
            }
        }
    }

    progress.console(format!(
        "{} timeout waiting for maintenance mode, proceeding anyway",
        link.key()
    ));
    Ok(())
}

/// Requests the firmware update until the peer enters SOFTWARE_UPDATE,
/// then tracks flash progress until it returns to OPERATIONAL.
fn flash_firmware<P: PeerLink>(
    link: &P,
    progress: &ProgressBus,
    ctx: &UpdateContext,
) -> Result<()> {
    let timings = &ctx.timings;
    let firmware_kb = (ctx.firmware_size as f32 / 1024.0).max(0.001);
    let deadline = Instant::now() + timings.update_timeout;

    let mut update_started = false;
    let mut last_request: Option<Instant> = None;
    let mut last_percent = 50.0f32;
    let mut last_kb: u16 = 0;

    loop {
        if Instant::now() >= deadline {
            return Err(Error::UpdateTimeout {
                stage: "updating",
                seconds: timings.update_timeout.as_secs(),
            });
        }
        check_stop(link)?;

        if !update_started {
            let due = match last_request {
                Some(last) => last.elapsed() >= timings.begin_retry,
                None => true,
            };
            if due {
                link.send_begin_update(&ctx.file_key);
                last_request = Some(Instant::now());
            }
        }

        let event = match link.recv_event(timings.poll) {
            Some(event) => event,
            None => continue,
        };
        let (mode, vendor_status) = match event {
            PeerEvent::Status {
                mode,
                vendor_status,
            } => (mode, vendor_status),
            PeerEvent::Log { .. } => continue,
        };

        match mode {
            node_mode::SOFTWARE_UPDATE => {
                if !update_started {
                    update_started = true;
                    progress.console(format!("{} entered firmware update mode", link.key()));
                    progress.update_device(&link.key(), DeviceState::Updating, 50.0);
                } else if vendor_status >= last_kb {
                    // vendor specific status code counts kilobytes flashed
                    let ratio = (vendor_status as f32 / firmware_kb).min(1.0);
                    let percent = 50.0 + ratio * 39.0;
                    if percent > last_percent {
                        last_percent = percent;
                        last_kb = vendor_status;
                        progress.update_device(&link.key(), DeviceState::Updating, percent);
                    }
                }
            }
            node_mode::OPERATIONAL if update_started => {
                progress.console(format!(
                    "{} returned to operational mode, firmware update complete",
                    link.key()
                ));
                return Ok(());
            }
            _ if update_started => {
                // left SOFTWARE_UPDATE but not operational yet: rebooting
                progress.update_device(&link.key(), DeviceState::Verifying, 90.0);
            }
            _ => {}
        }
    }
}

/// Sets FLASH_BOOTLOADER=1 every 5 s and watches the peer's log output
/// for the self-flash verdict.
fn flash_bootloader<P: PeerLink>(
    link: &P,
    progress: &ProgressBus,
    timings: &DriverTimings,
) -> Result<()> {
    let deadline = Instant::now() + timings.bootloader_timeout;
    let mut last_request: Option<Instant> = None;

    while Instant::now() < deadline {
        check_stop(link)?;

        let due = match last_request {
            Some(last) => last.elapsed() >= timings.param_interval,
            None => true,
        };
        if due {
            link.send_flash_bootloader();
            last_request = Some(Instant::now());
        }

        if let Some(PeerEvent::Log { text }) = link.recv_event(timings.poll) {
            progress.console(format!("{} log: {}", link.key(), text.trim()));
            if text.contains("Bootloader unchanged") {
                link.set_bootloader_state(BootloaderState::Unchanged);
                return Ok(());
            }
            if text.contains("Bootloader Flash ok") {
                link.set_bootloader_state(BootloaderState::Updated);
                return Ok(());
            }
        }
    }

    progress.console(format!(
        "{} timeout waiting for bootloader completion",
        link.key()
    ));
    link.set_bootloader_state(BootloaderState::Timeout);
    Ok(())
}

// Tests ------------------------------------------------------------------------------------------
