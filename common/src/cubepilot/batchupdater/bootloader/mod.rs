pub mod uploader;

pub use uploader::{find_bootloader, Uploader, UploaderOptions};

// Protocol bytes ---------------------------------------------------------------------------------

pub const INSYNC: u8 = 0x12;
pub const EOC: u8 = 0x20;

// reply bytes
pub const OK: u8 = 0x10;
pub const FAILED: u8 = 0x11;
pub const INVALID: u8 = 0x13; // rev3+
pub const BAD_SILICON_REV: u8 = 0x14; // rev5+

// command bytes
pub const GET_SYNC: u8 = 0x21;
pub const GET_DEVICE: u8 = 0x22;
pub const CHIP_ERASE: u8 = 0x23;
pub const CHIP_VERIFY: u8 = 0x24; // rev2 only
pub const PROG_MULTI: u8 = 0x27;
pub const READ_MULTI: u8 = 0x28; // rev2 only
pub const GET_CRC: u8 = 0x29; // rev3+
pub const GET_OTP: u8 = 0x2A; // rev4+, get a word from OTP area
pub const GET_SN: u8 = 0x2B; // rev4+, get a word from SN area
pub const GET_CHIP: u8 = 0x2C; // rev5+, get chip version
pub const SET_BOOT_DELAY: u8 = 0x2D; // rev5+, set boot delay
pub const GET_CHIP_DES: u8 = 0x2E; // rev5+, get chip description in ASCII

pub const REBOOT: u8 = 0x30;
pub const SET_BAUD: u8 = 0x33;

pub const EXTF_ERASE: u8 = 0x34; // erase sectors from external flash
pub const EXTF_PROG_MULTI: u8 = 0x35; // write bytes at external flash program address and increment
pub const EXTF_READ_MULTI: u8 = 0x36; // read bytes at address and increment
pub const EXTF_GET_CRC: u8 = 0x37; // compute & return a CRC of data in external flash

pub const CHIP_FULL_ERASE: u8 = 0x40; // full erase of flash

// GET_DEVICE parameters
pub const INFO_BL_REV: u8 = 0x01; // bootloader protocol revision
pub const INFO_BOARD_ID: u8 = 0x02; // board type
pub const INFO_BOARD_REV: u8 = 0x03; // board revision
pub const INFO_FLASH_SIZE: u8 = 0x04; // max firmware size in bytes
pub const INFO_EXTF_SIZE: u8 = 0x06; // available external flash size

pub const BL_REV_MIN: u32 = 2; // minimum supported bootloader protocol
pub const BL_REV_MAX: u32 = 5; // maximum supported bootloader protocol

// protocol max is 255, must be multiple of 4
pub const PROG_MULTI_MAX: usize = 252;
pub const READ_MULTI_MAX: usize = 252;

// shell reboot sequence for a flight stack console
pub const NSH_INIT: &[u8] = &[0x0D, 0x0D, 0x0D];
pub const NSH_REBOOT_BL: &[u8] = b"reboot -b\n";
pub const NSH_REBOOT: &[u8] = b"reboot\n";
