//! Client side of the PX4 serial bootloader protocol.
//!
//! Every command ends with a single `EOC` byte; every successful response
//! ends with `INSYNC OK`. The client is generic over [`SerialLink`] so the
//! full protocol can be exercised against the scripted simulator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::bootloader::*;
use crate::cubepilot::batchupdater::com::SerialLink;
use crate::cubepilot::batchupdater::dronecan::mavlink::{
    pack_command_long_v1, CommandLong, MAVLINK_REBOOT_ID0, MAVLINK_REBOOT_ID1,
    MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
};
use crate::cubepilot::batchupdater::firmware::{apj::FirmwareBundle, compatible_board};
use crate::cubepilot::batchupdater::{Error, ProgressFn, ProgressUpdate, Result};

const ERASE_TIMEOUT: Duration = Duration::from_secs(20);
// erase usually takes about 9 seconds to complete
const ERASE_EXPECTED: Duration = Duration::from_secs(9);
const EXTF_CRC_TIMEOUT: Duration = Duration::from_secs(10);

// UploaderOptions --------------------------------------------------------------------------------

pub struct UploaderOptions {
    pub baud_bootloader: u32,
    /// Baud rate to negotiate for flashing, bootloader baud if `None`
    pub baud_bootloader_flash: Option<u32>,
    /// Flight stack baud rates tried (and consumed) by `send_reboot`
    pub baud_flightstack: Vec<u32>,
    pub target_system: Option<u8>,
    pub target_component: Option<u8>,
    pub source_system: u8,
    pub source_component: u8,
    pub no_extf: bool,
    pub force_erase: bool,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        UploaderOptions {
            baud_bootloader: 115200,
            baud_bootloader_flash: None,
            baud_flightstack: vec![57600],
            target_system: None,
            target_component: None,
            source_system: 255,
            source_component: 1,
            no_extf: false,
            force_erase: false,
        }
    }
}

// Uploader ---------------------------------------------------------------------------------------

///
/// Uploads a firmware bundle to a board running the serial bootloader.
///
/// One instance owns one serial link for the lifetime of an update
/// attempt. Identification state (`bl_rev`, board type, flash sizes) is
/// populated by [`Uploader::identify`] and consumed by
/// [`Uploader::upload`].
///
pub struct Uploader<L: SerialLink> {
    link: L,
    baud_bootloader: u32,
    baud_bootloader_flash: u32,
    baud_flightstack: Vec<u32>,
    // never rewinds; exhausting the list ends the find-bootloader loop
    baud_flightstack_idx: Option<usize>,
    reboot_frames: Vec<Vec<u8>>,
    no_extf: bool,
    force_erase: bool,
    bl_rev: u32,
    board_type: u32,
    board_rev: u32,
    fw_maxsize: u32,
    extf_maxsize: u32,
    progress: Option<ProgressFn>,
    cancel: Arc<AtomicBool>,
}

impl<L: SerialLink> Uploader<L> {
    pub fn new(link: L, opts: UploaderOptions) -> Self {
        let reboot_frames = match opts.target_system {
            Some(target_system) => {
                let cmd = CommandLong {
                    target_system,
                    target_component: opts.target_component.unwrap_or(1),
                    command: MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
                    confirmation: 1,
                    params: [3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                };
                vec![pack_command_long_v1(
                    0,
                    opts.source_system,
                    opts.source_component,
                    &cmd,
                )]
            }
            None => vec![MAVLINK_REBOOT_ID1.to_vec(), MAVLINK_REBOOT_ID0.to_vec()],
        };

        Uploader {
            link,
            baud_bootloader: opts.baud_bootloader,
            baud_bootloader_flash: opts.baud_bootloader_flash.unwrap_or(opts.baud_bootloader),
            baud_flightstack: opts.baud_flightstack,
            baud_flightstack_idx: None,
            reboot_frames,
            no_extf: opts.no_extf,
            force_erase: opts.force_erase,
            bl_rev: 0,
            board_type: 0,
            board_rev: 0,
            fw_maxsize: 0,
            extf_maxsize: 0,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_progress_fn(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = cancel;
    }

    pub fn bl_rev(&self) -> u32 {
        self.bl_rev
    }

    pub fn board_type(&self) -> u32 {
        self.board_type
    }

    pub fn board_rev(&self) -> u32 {
        self.board_rev
    }

    pub fn fw_maxsize(&self) -> u32 {
        self.fw_maxsize
    }

    pub fn extf_maxsize(&self) -> u32 {
        self.extf_maxsize
    }

    pub fn port_name(&self) -> String {
        self.link.name().to_owned()
    }

    pub fn open(&mut self) -> Result<()> {
        self.link.open()
    }

    pub fn close(&mut self) {
        self.link.close();
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn emit(&self, update: ProgressUpdate) {
        if let Some(progress) = &self.progress {
            progress(update);
        }
    }

    fn message(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{}: {}", self.link.name(), text);
        self.emit(ProgressUpdate::Message(text));
    }

    // Low level ----------------------------------------------------------------------------------

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.link.write_all(data)
    }

    fn recv(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.link.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn recv_u8(&mut self) -> Result<u8> {
        Ok(self.recv(1)?[0])
    }

    fn recv_u32(&mut self) -> Result<u32> {
        let raw = self.recv(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Reads the `INSYNC OK` trailer of a successful command.
    fn get_sync(&mut self) -> Result<()> {
        self.link.flush()?;
        let lead = self.recv_u8()?;
        if lead != INSYNC {
            return Err(Error::ProtocolDesync(format!(
                "unexpected {:#04x} instead of INSYNC",
                lead
            )));
        }
        match self.recv_u8()? {
            OK => Ok(()),
            INVALID => Err(Error::ProtocolDesync(
                "bootloader reports INVALID OPERATION".to_string(),
            )),
            FAILED => Err(Error::ProtocolDesync(
                "bootloader reports OPERATION FAILED".to_string(),
            )),
            other => Err(Error::ProtocolDesync(format!(
                "unexpected {:#04x} instead of OK",
                other
            ))),
        }
    }

    /// Attempts to get back into sync with the bootloader.
    fn sync(&mut self) -> Result<()> {
        self.link.clear_input()?;
        self.send(&[GET_SYNC, EOC])?;
        self.get_sync()
    }

    /// Non-failing sync probe used while polling a long-running command.
    fn try_sync(&mut self) -> Result<bool> {
        self.link.flush()?;
        let lead = match self.recv_u8() {
            Ok(byte) => byte,
            Err(Error::ProtocolTimeout(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if lead != INSYNC {
            return Ok(false);
        }
        match self.recv_u8() {
            Ok(BAD_SILICON_REV) => Err(Error::ProtocolDesync(
                "programming not supported for this version of silicon".to_string(),
            )),
            Ok(OK) => Ok(true),
            Ok(_) => Ok(false),
            Err(Error::ProtocolTimeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // Queries ------------------------------------------------------------------------------------

    fn get_info(&mut self, param: u8) -> Result<u32> {
        self.send(&[GET_DEVICE, param, EOC])?;
        let value = self.recv_u32()?;
        self.get_sync()?;
        Ok(value)
    }

    /// Reads a word from the OTP area.
    pub fn get_otp(&mut self, offset: u32) -> Result<[u8; 4]> {
        let mut cmd = vec![GET_OTP];
        cmd.extend_from_slice(&offset.to_le_bytes());
        cmd.push(EOC);
        self.send(&cmd)?;
        let raw = self.recv(4)?;
        self.get_sync()?;
        Ok([raw[0], raw[1], raw[2], raw[3]])
    }

    /// Reads a word from the serial number area.
    pub fn get_sn(&mut self, offset: u32) -> Result<[u8; 4]> {
        let mut cmd = vec![GET_SN];
        cmd.extend_from_slice(&offset.to_le_bytes());
        cmd.push(EOC);
        self.send(&cmd)?;
        let raw = self.recv(4)?;
        self.get_sync()?;
        Ok([raw[0], raw[1], raw[2], raw[3]])
    }

    pub fn get_chip(&mut self) -> Result<u32> {
        self.send(&[GET_CHIP, EOC])?;
        let value = self.recv_u32()?;
        self.get_sync()?;
        Ok(value)
    }

    /// Chip description, comma-separated (family, revision).
    pub fn get_chip_des(&mut self) -> Result<Vec<String>> {
        self.send(&[GET_CHIP_DES, EOC])?;
        let length = self.recv_u32()? as usize;
        let raw = self.recv(length)?;
        self.get_sync()?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        Ok(text.split(',').map(|s| s.to_string()).collect())
    }

    // Programming --------------------------------------------------------------------------------

    fn erase(&mut self) -> Result<()> {
        self.erase_with_timeout(ERASE_TIMEOUT)
    }

    fn erase_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.force_erase {
            self.message("force erasing full chip");
            self.send(&[CHIP_FULL_ERASE, EOC])?;
        } else {
            self.send(&[CHIP_ERASE, EOC])?;
        }

        // erase is very slow, give it 20s; poll for sync while drawing
        // progress against the ~9s it normally takes
        let start = Instant::now();
        let deadline = start + timeout;
        while Instant::now() < deadline {
            self.check_cancel()?;

            let elapsed = start.elapsed().as_secs_f32();
            let percent = (elapsed / ERASE_EXPECTED.as_secs_f32() * 100.0).min(100.0);
            self.emit(ProgressUpdate::EraseProgress { percent });

            if self.try_sync()? {
                self.emit(ProgressUpdate::EraseProgress { percent: 100.0 });
                return Ok(());
            }
        }

        Err(Error::UpdateTimeout {
            stage: "chip erase",
            seconds: timeout.as_secs(),
        })
    }

    fn program_multi(&mut self, data: &[u8]) -> Result<()> {
        self.send(&[PROG_MULTI, data.len() as u8])?;
        self.send(data)?;
        self.send(&[EOC])?;
        self.get_sync()
    }

    fn program(&mut self, fw: &FirmwareBundle) -> Result<()> {
        let chunks: Vec<&[u8]> = fw.image().chunks(PROG_MULTI_MAX).collect();
        let total = chunks.len();
        for (idx, chunk) in chunks.into_iter().enumerate() {
            self.check_cancel()?;
            self.program_multi(chunk)?;
            self.emit(ProgressUpdate::ProgramProgress {
                current: idx + 1,
                total,
            });
        }
        Ok(())
    }

    fn read_multi(&mut self, length: usize) -> Result<Vec<u8>> {
        self.send(&[READ_MULTI, length as u8, EOC])?;
        self.link.flush()?;
        let data = self.recv(length)?;
        self.get_sync()?;
        Ok(data)
    }

    fn verify_v2(&mut self, fw: &FirmwareBundle) -> Result<()> {
        self.send(&[CHIP_VERIFY, EOC])?;
        self.get_sync()?;

        let chunks: Vec<&[u8]> = fw.image().chunks(READ_MULTI_MAX).collect();
        let total = chunks.len();
        for (idx, expected) in chunks.into_iter().enumerate() {
            self.check_cancel()?;
            let programmed = self.read_multi(expected.len())?;
            if programmed != expected {
                return Err(Error::VerifyFailed(format!(
                    "flash contents mismatch in chunk {}/{}",
                    idx + 1,
                    total
                )));
            }
            self.emit(ProgressUpdate::VerifyProgress {
                percent: (idx + 1) as f32 / total as f32 * 100.0,
            });
        }
        Ok(())
    }

    fn verify_v3(&mut self, fw: &FirmwareBundle) -> Result<()> {
        self.emit(ProgressUpdate::VerifyProgress { percent: 1.0 });
        let expected = fw.crc_image(self.fw_maxsize);
        self.send(&[GET_CRC, EOC])?;
        let reported = self.recv_u32()?;
        self.get_sync()?;
        if reported != expected {
            return Err(Error::VerifyFailed(format!(
                "program CRC failed: expected {:#010x}, got {:#010x}",
                expected, reported
            )));
        }
        self.emit(ProgressUpdate::VerifyProgress { percent: 100.0 });
        Ok(())
    }

    fn set_boot_delay(&mut self, boot_delay: i8) -> Result<()> {
        self.send(&[SET_BOOT_DELAY, boot_delay as u8, EOC])?;
        self.get_sync()
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        let mut cmd = vec![SET_BAUD];
        cmd.extend_from_slice(&baud.to_le_bytes());
        cmd.push(EOC);
        self.send(&cmd)?;
        self.get_sync()
    }

    fn reboot(&mut self) -> Result<()> {
        self.send(&[REBOOT, EOC])?;
        self.link.flush()?;
        // v3+ can report failure if the first word flash fails
        if self.bl_rev >= 3 {
            self.get_sync()?;
        }
        Ok(())
    }

    // External flash -----------------------------------------------------------------------------

    fn erase_extflash(&mut self, size: u32) -> Result<()> {
        let mut cmd = vec![EXTF_ERASE];
        cmd.extend_from_slice(&size.to_le_bytes());
        cmd.push(EOC);
        self.send(&cmd)?;
        self.get_sync()?;

        // the bootloader streams live percentages up to ~90, then goes
        // silent until the final sync
        let mut last_pct = 0u8;
        loop {
            self.check_cancel()?;
            if last_pct < 90 {
                let pct = self.recv_u8()?;
                if pct != last_pct {
                    self.emit(ProgressUpdate::ExtfEraseProgress {
                        percent: pct as f32,
                    });
                    last_pct = pct;
                }
            } else if self.try_sync()? {
                self.emit(ProgressUpdate::ExtfEraseProgress { percent: 100.0 });
                return Ok(());
            }
        }
    }

    fn program_multi_extf(&mut self, data: &[u8]) -> Result<()> {
        self.send(&[EXTF_PROG_MULTI, data.len() as u8])?;
        self.send(data)?;
        self.send(&[EOC])?;
        self.get_sync()
    }

    fn program_extf(&mut self, fw: &FirmwareBundle) -> Result<()> {
        let image = fw.extf_image().unwrap_or(&[]);
        let chunks: Vec<&[u8]> = image.chunks(PROG_MULTI_MAX).collect();
        let total = chunks.len();
        for (idx, chunk) in chunks.into_iter().enumerate() {
            self.check_cancel()?;
            self.program_multi_extf(chunk)?;
            self.emit(ProgressUpdate::ExtfProgramProgress {
                current: idx + 1,
                total,
            });
        }
        Ok(())
    }

    fn verify_extf(&mut self, fw: &FirmwareBundle, size: u32) -> Result<()> {
        self.emit(ProgressUpdate::VerifyProgress { percent: 1.0 });
        let expected = fw.crc_extf(size);

        let mut cmd = vec![EXTF_GET_CRC];
        cmd.extend_from_slice(&size.to_le_bytes());
        cmd.push(EOC);
        self.send(&cmd)?;

        // crc can be slow, give it 10s
        let deadline = Instant::now() + EXTF_CRC_TIMEOUT;
        let reported = loop {
            if Instant::now() >= deadline {
                return Err(Error::UpdateTimeout {
                    stage: "external flash crc",
                    seconds: EXTF_CRC_TIMEOUT.as_secs(),
                });
            }
            self.check_cancel()?;
            match self.recv_u32() {
                Ok(value) => break value,
                Err(Error::ProtocolTimeout(_)) => continue,
                Err(e) => return Err(e),
            }
        };

        self.get_sync()?;
        if reported != expected {
            return Err(Error::VerifyFailed(format!(
                "external flash CRC failed: expected {:#010x}, got {:#010x}",
                expected, reported
            )));
        }
        self.emit(ProgressUpdate::VerifyProgress { percent: 100.0 });
        Ok(())
    }

    // Identification -----------------------------------------------------------------------------

    /// Gets basic data about the board; must leave the link in sync.
    pub fn identify(&mut self) -> Result<()> {
        // make sure we are in sync before starting
        self.sync()?;

        // get the bootloader protocol ID first
        self.bl_rev = self.get_info(INFO_BL_REV)?;
        if self.bl_rev < BL_REV_MIN || self.bl_rev > BL_REV_MAX {
            return Err(Error::UnsupportedBootloader(self.bl_rev));
        }

        self.extf_maxsize = if self.no_extf {
            0
        } else {
            match self.get_info(INFO_EXTF_SIZE) {
                Ok(size) => size,
                Err(_) => {
                    self.message("could not get external flash size, assuming 0");
                    self.sync()?;
                    0
                }
            }
        };

        self.board_type = self.get_info(INFO_BOARD_ID)?;
        self.board_rev = self.get_info(INFO_BOARD_REV)?;
        self.fw_maxsize = self.get_info(INFO_FLASH_SIZE)?;
        Ok(())
    }

    /// Logs what is known about the board: OTP/SN on rev 4+, chip family
    /// and description on rev 5.
    fn describe_board(&mut self) -> Result<()> {
        self.message(format!("bootloader protocol: {}", self.bl_rev));

        if self.bl_rev > 3 {
            let mut otp = Vec::new();
            for offset in (0..32 * 6).step_by(4) {
                otp.extend_from_slice(&self.get_otp(offset)?);
            }
            let id = String::from_utf8_lossy(&otp[0..4]).into_owned();
            self.message(format!("OTP type: {}", id.trim_end_matches('\0')));

            let mut sn = String::new();
            for offset in (0..12).step_by(4) {
                let mut word = self.get_sn(offset)?;
                word.reverse();
                for byte in word {
                    sn.push_str(&format!("{:02x}", byte));
                }
            }
            self.message(format!("serial number: {}", sn));
        }

        if self.bl_rev >= 5 {
            let des = self.get_chip_des()?;
            if des.len() == 2 {
                self.message(format!("chip family {}, revision {}", des[0], des[1]));
            }
            let chip = self.get_chip()?;
            self.message(format!("chip id: {:#010x}", chip));
        }

        let board = crate::cubepilot::batchupdater::firmware::board_name_for_board_id(
            self.board_type,
        )
        .map(|name| format!("{} ({})", self.board_type, name))
        .unwrap_or_else(|| format!("{}", self.board_type));
        self.message(format!(
            "board_type: {}, board_rev: {}, flash size: {}, ext flash size: {}",
            board, self.board_rev, self.fw_maxsize, self.extf_maxsize
        ));
        Ok(())
    }

    // Upload -------------------------------------------------------------------------------------

    /// Uploads the firmware, verifies it and reboots the board.
    pub fn upload(
        &mut self,
        fw: &FirmwareBundle,
        force: bool,
        boot_delay: Option<i8>,
    ) -> Result<()> {
        // make sure we are doing the right thing
        if let Err(e) = check_board_compat(self.board_type, fw.board_id) {
            match &e {
                Error::IncompatibleBoard { .. } if force => {
                    self.message("FORCED WRITE, FLASHING ANYWAY");
                }
                _ => return Err(e),
            }
        } else if self.board_type != fw.board_id {
            self.message(format!(
                "board_type {} accepted via compatibility table for firmware board_id {}",
                self.board_type, fw.board_id
            ));
        }

        self.describe_board()?;

        if self.fw_maxsize < fw.image_size || self.extf_maxsize < fw.extf_image_size {
            return Err(Error::ImageTooLarge);
        }

        if self.baud_bootloader_flash != self.baud_bootloader {
            let baud = self.baud_bootloader_flash;
            self.message(format!("setting baudrate to {}", baud));
            self.set_baud(baud)?;
            self.link.set_baud_rate(baud)?;
            self.sync()?;
        }

        if fw.extf_image_size > 0 {
            self.erase_extflash(fw.extf_image_size)?;
            self.program_extf(fw)?;
            self.verify_extf(fw, fw.extf_image_size)?;
        }

        if fw.image_size > 0 {
            self.erase()?;
            self.program(fw)?;
            if self.bl_rev == 2 {
                self.verify_v2(fw)?;
            } else {
                self.verify_v3(fw)?;
            }
        }

        if let Some(delay) = boot_delay {
            self.set_boot_delay(delay)?;
        }

        self.message("rebooting");
        self.reboot()?;
        self.link.close();
        Ok(())
    }

    // Reboot into bootloader ---------------------------------------------------------------------

    fn next_baud_flightstack(&mut self) -> bool {
        let next = match self.baud_flightstack_idx {
            None => 0,
            Some(idx) => idx + 1,
        };
        if next >= self.baud_flightstack.len() {
            return false;
        }
        self.baud_flightstack_idx = Some(next);
        self.link.set_baud_rate(self.baud_flightstack[next]).is_ok()
    }

    /// Asks a running flight stack to reboot into the bootloader, trying
    /// the next configured baud rate. `false` once the list is exhausted.
    pub fn send_reboot(&mut self) -> bool {
        if !self.next_baud_flightstack() {
            return false;
        }

        let baud = self.baud_flightstack[self.baud_flightstack_idx.unwrap()];
        log::info!(
            "{}: attempting reboot with baudrate={}",
            self.link.name(),
            baud
        );

        let result: Result<()> = (|| {
            self.link.flush()?;
            // try the MAVLink command first
            let frames = self.reboot_frames.clone();
            for frame in &frames {
                self.send(frame)?;
            }
            // then try reboot via the shell
            self.send(NSH_INIT)?;
            self.send(NSH_REBOOT_BL)?;
            self.send(NSH_INIT)?;
            self.send(NSH_REBOOT)?;
            self.link.flush()?;
            Ok(())
        })();
        if let Err(e) = result {
            log::debug!("{}: reboot request failed: {}", self.link.name(), e);
        }

        let _ = self.link.set_baud_rate(self.baud_bootloader);
        true
    }
}

/// Pure board/firmware id compatibility decision used by `upload`.
fn check_board_compat(board_type: u32, fw_board_id: u32) -> Result<()> {
    if board_type == fw_board_id {
        return Ok(());
    }
    if let Some((compat_id, _label)) = compatible_board(board_type) {
        if compat_id == fw_board_id {
            return Ok(());
        }
    }
    Err(Error::IncompatibleBoard {
        board_type,
        board_id: fw_board_id,
    })
}

// find_bootloader --------------------------------------------------------------------------------

///
/// Drives a board into its bootloader and identifies it.
///
/// Alternates identify attempts with reboot requests at the configured
/// flight stack baud rates. `Ok(false)` once the baud list is exhausted
/// without ever reaching a bootloader.
///
pub fn find_bootloader<L: SerialLink>(up: &mut Uploader<L>) -> Result<bool> {
    loop {
        up.check_cancel()?;

        if up.open().is_ok() {
            // port is open, try talking to it
            match up.identify() {
                Ok(()) => {
                    log::info!(
                        "found board {:x},{:x} bootloader rev {:x} on {}",
                        up.board_type(),
                        up.board_rev(),
                        up.bl_rev(),
                        up.port_name()
                    );
                    return Ok(true);
                }
                Err(Error::UnsupportedBootloader(rev)) => {
                    return Err(Error::UnsupportedBootloader(rev));
                }
                Err(e) => {
                    log::debug!("{}: identify failed: {}", up.port_name(), e);
                }
            }
        }

        let reboot_sent = up.send_reboot();

        // wait for the reboot, without this we might run into serial I/O errors
        std::thread::sleep(Duration::from_millis(250));

        // always close the port
        up.close();

        // wait for the close before the next open attempt
        std::thread::sleep(Duration::from_millis(300));

        if !reboot_sent {
            return Ok(false);
        }
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubepilot::batchupdater::com::SerialSim;

    fn sync_ok(sim: &mut SerialSim) {
        sim.push_response(&[INSYNC, OK]);
    }

    fn info_reply(sim: &mut SerialSim, value: u32) {
        sim.push_response(&value.to_le_bytes());
        sync_ok(sim);
    }

    fn script_identify(sim: &mut SerialSim, bl_rev: u32, board_type: u32, fw_maxsize: u32) {
        sync_ok(sim); // initial sync
        info_reply(sim, bl_rev);
        info_reply(sim, 0); // extf size
        info_reply(sim, board_type);
        info_reply(sim, 1); // board rev
        info_reply(sim, fw_maxsize);
    }

    fn identified_uploader(
        bl_rev: u32,
        board_type: u32,
        fw_maxsize: u32,
    ) -> Uploader<SerialSim> {
        let mut sim = SerialSim::new();
        script_identify(&mut sim, bl_rev, board_type, fw_maxsize);
        let mut up = Uploader::new(sim, UploaderOptions::default());
        up.identify().unwrap();
        up
    }

    #[test]
    fn identify_reads_device_info() {
        let up = identified_uploader(3, 140, 0x0020_0000);
        assert_eq!(up.bl_rev(), 3);
        assert_eq!(up.board_type(), 140);
        assert_eq!(up.board_rev(), 1);
        assert_eq!(up.fw_maxsize(), 0x0020_0000);
        assert_eq!(up.extf_maxsize(), 0);
    }

    #[test]
    fn identify_rejects_unsupported_revision() {
        for bl_rev in [1u32, 6] {
            let mut sim = SerialSim::new();
            sync_ok(&mut sim);
            info_reply(&mut sim, bl_rev);
            let mut up = Uploader::new(sim, UploaderOptions::default());
            assert!(matches!(
                up.identify(),
                Err(Error::UnsupportedBootloader(rev)) if rev == bl_rev
            ));
        }
    }

    #[test]
    fn identify_twice_is_idempotent() {
        let mut sim = SerialSim::new();
        script_identify(&mut sim, 3, 140, 0x1000);
        script_identify(&mut sim, 3, 140, 0x1000);
        let mut up = Uploader::new(sim, UploaderOptions::default());
        up.identify().unwrap();
        let first = (up.board_type(), up.board_rev(), up.bl_rev());
        up.identify().unwrap();
        assert_eq!(first, (up.board_type(), up.board_rev(), up.bl_rev()));
    }

    #[test]
    fn sync_sends_get_sync_eoc() {
        let mut sim = SerialSim::new();
        sync_ok(&mut sim);
        let mut up = Uploader::new(sim, UploaderOptions::default());
        up.sync().unwrap();
        assert_eq!(up.link.written(), &[GET_SYNC, EOC]);
    }

    #[test]
    fn get_sync_maps_error_replies() {
        for (reply, needle) in [(INVALID, "INVALID"), (FAILED, "FAILED")] {
            let mut sim = SerialSim::new();
            sim.push_response(&[INSYNC, reply]);
            let mut up = Uploader::new(sim, UploaderOptions::default());
            match up.get_sync() {
                Err(Error::ProtocolDesync(msg)) => assert!(msg.contains(needle)),
                other => panic!("unexpected result: {:?}", other.err()),
            }
        }
    }

    #[test]
    fn program_chunks_at_252_bytes() {
        let mut up = identified_uploader(3, 140, 0x1000);
        up.link.clear_written();

        let image = vec![0xAB; 300];
        let fw = FirmwareBundle::from_raw(140, image, None);

        // two chunks -> two sync replies
        sync_ok(&mut up.link);
        sync_ok(&mut up.link);
        up.program(&fw).unwrap();

        let written = up.link.written();
        // first chunk header
        assert_eq!(written[0], PROG_MULTI);
        assert_eq!(written[1], 252);
        // second chunk header follows first chunk payload + EOC
        let second = 2 + 252 + 1;
        assert_eq!(written[second], PROG_MULTI);
        assert_eq!(written[second + 1], 48);
        assert_eq!(*written.last().unwrap(), EOC);
    }

    #[test]
    fn upload_happy_path_verifies_crc() {
        let mut up = identified_uploader(3, 140, 0x1000);
        up.link.clear_written();

        let fw = FirmwareBundle::from_raw(140, vec![0x5A; 200], None);

        // erase ack, program ack (single chunk), GET_CRC reply, reboot ack
        sync_ok(&mut up.link);
        sync_ok(&mut up.link);
        up.link
            .push_response(&fw.crc_image(0x1000).to_le_bytes());
        sync_ok(&mut up.link);
        sync_ok(&mut up.link);

        up.upload(&fw, false, None).unwrap();
        assert!(!up.link.is_open());
    }

    #[test]
    fn upload_detects_crc_mismatch() {
        let mut up = identified_uploader(3, 140, 0x1000);
        let fw = FirmwareBundle::from_raw(140, vec![0x5A; 200], None);

        sync_ok(&mut up.link);
        sync_ok(&mut up.link);
        let wrong = fw.crc_image(0x1000) ^ 0xDEAD_BEEF;
        up.link.push_response(&wrong.to_le_bytes());
        sync_ok(&mut up.link);

        assert!(matches!(
            up.upload(&fw, false, None),
            Err(Error::VerifyFailed(_))
        ));
    }

    #[test]
    fn upload_rejects_oversized_image() {
        let mut up = identified_uploader(3, 140, 0x80);
        let fw = FirmwareBundle::from_raw(140, vec![0x5A; 256], None);
        assert!(matches!(
            up.upload(&fw, false, None),
            Err(Error::ImageTooLarge)
        ));
    }

    #[test]
    fn board_compat_checks() {
        assert!(check_board_compat(140, 140).is_ok());
        // compatibility table: board 33 accepts firmware built for 9
        assert!(check_board_compat(33, 9).is_ok());
        assert!(matches!(
            check_board_compat(140, 9),
            Err(Error::IncompatibleBoard {
                board_type: 140,
                board_id: 9
            })
        ));
    }

    #[test]
    fn erase_times_out_without_sync() {
        let mut up = identified_uploader(3, 140, 0x1000);
        let result = up.erase_with_timeout(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::UpdateTimeout { .. })));
    }

    #[test]
    fn send_reboot_exhausts_baud_list() {
        let sim = SerialSim::new();
        let mut up = Uploader::new(sim, UploaderOptions::default());

        assert!(up.send_reboot());
        let written = up.link.written();
        // MAVLink frames first, then the shell sequence
        assert!(written.starts_with(&MAVLINK_REBOOT_ID1));
        assert!(written
            .windows(NSH_REBOOT_BL.len())
            .any(|w| w == NSH_REBOOT_BL));
        // bootloader baud restored afterwards
        assert_eq!(up.link.baud(), 115200);

        // single-entry default list: second attempt fails
        assert!(!up.send_reboot());
    }

    #[test]
    fn set_baud_sends_little_endian_rate() {
        let mut sim = SerialSim::new();
        sync_ok(&mut sim);
        let mut up = Uploader::new(sim, UploaderOptions::default());
        up.set_baud(921600).unwrap();
        let mut expected = vec![SET_BAUD];
        expected.extend_from_slice(&921600u32.to_le_bytes());
        expected.push(EOC);
        assert_eq!(up.link.written(), expected.as_slice());
    }

    #[test]
    fn cancelled_upload_stops_early() {
        let mut up = identified_uploader(3, 140, 0x1000);
        let cancel = Arc::new(AtomicBool::new(true));
        up.set_cancel_flag(cancel);
        let fw = FirmwareBundle::from_raw(140, vec![0x5A; 256], None);
        assert!(matches!(up.upload(&fw, false, None), Err(Error::Cancelled)));
    }
}
