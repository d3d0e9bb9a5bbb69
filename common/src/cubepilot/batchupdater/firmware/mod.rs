pub mod apj;

use crc::{Algorithm, Crc};
use std::path::{Path, PathBuf};

use crate::cubepilot::batchupdater::firmware::apj::FirmwareBundle;

// Bootloader CRC ---------------------------------------------------------------------------------

/// CRC-32 variant spoken by the PX4 bootloader: reversed polynomial
/// 0xEDB88320, initial state 0, no final XOR (AP_Math crc_crc32).
pub const CRC_32_BOOTLOADER_ALG: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04C11DB7,
    init: 0x00000000,
    refin: true,
    refout: true,
    xorout: 0x00000000,
    check: 0x2DFD2D88,
    residue: 0x00000000,
};

pub const CRC32_BOOTLOADER: Crc<u32> = Crc::<u32>::new(&CRC_32_BOOTLOADER_ALG);

// Board tables -----------------------------------------------------------------------------------

/// Shared board ids with well-known names
const SHARED_BOARD_IDS: &[(u32, &str)] = &[
    (9, "fmuv3"),
    (50, "fmuv5"),
    (140, "CubeOrange"),
    (1063, "CubeOrangePlus"),
];

/// Bootloader board ids whose firmware builds are shared with another board
/// id: {board_type: (firmware board_id, board name)}
const COMPATIBLE_IDS: &[(u32, (u32, &str))] = &[(33, (9, "AUAVX2.1"))];

/// Well-known name for a board id, `None` if it has none.
pub fn board_name_for_board_id(board_id: u32) -> Option<&'static str> {
    SHARED_BOARD_IDS
        .iter()
        .find(|(id, _)| *id == board_id)
        .map(|(_, name)| *name)
}

/// Firmware board id a given board type may be flashed with despite the
/// id mismatch, plus the board's label.
pub fn compatible_board(board_type: u32) -> Option<(u32, &'static str)> {
    COMPATIBLE_IDS
        .iter()
        .find(|(id, _)| *id == board_type)
        .map(|(_, entry)| *entry)
}

// FirmwareCatalog --------------------------------------------------------------------------------

///
/// File-system firmware catalog shared by both update phases.
///
/// Phase A candidates are the `.apj` bundles at the catalog root, matched
/// by `board_id`. Phase B peripherals look up
/// `<root>/<device_name>/firmware_<version>.bin` with a plain
/// `firmware.bin` fallback.
///
pub struct FirmwareCatalog {
    root: PathBuf,
}

impl FirmwareCatalog {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FirmwareCatalog {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// All loadable `.apj` bundles at the catalog root. Bundles that fail
    /// to parse are logged and skipped.
    pub fn cube_bundles(&self) -> Vec<FirmwareBundle> {
        let mut bundles = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return bundles,
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "apj").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match FirmwareBundle::load(&path) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => log::warn!("skipping bundle {}: {}", path.display(), e),
            }
        }
        bundles
    }

    /// Bundle for a cube board type: exact `board_id` match first, then the
    /// compatibility table fallback.
    pub fn find_cube_firmware(&self, board_type: u32) -> Option<FirmwareBundle> {
        let bundles = self.cube_bundles();

        if let Some(pos) = bundles.iter().position(|b| b.board_id == board_type) {
            let mut bundles = bundles;
            return Some(bundles.swap_remove(pos));
        }

        if let Some((fallback_id, label)) = compatible_board(board_type) {
            if let Some(pos) = bundles.iter().position(|b| b.board_id == fallback_id) {
                log::info!(
                    "board {} ({}) is compatible with firmware for board_id={}",
                    board_type,
                    label,
                    fallback_id
                );
                let mut bundles = bundles;
                return Some(bundles.swap_remove(pos));
            }
        }

        None
    }

    /// Firmware binary for a CAN peripheral, versioned name preferred.
    pub fn find_peripheral_firmware(&self, device_name: &str) -> Option<PathBuf> {
        let device_dir = self.root.join(device_name);

        if let Ok(entries) = std::fs::read_dir(&device_dir) {
            let mut versioned: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("firmware_") && n.ends_with(".bin"))
                            .unwrap_or(false)
                })
                .collect();
            versioned.sort();
            if let Some(path) = versioned.into_iter().next() {
                return Some(path);
            }
        }

        let fallback = device_dir.join("firmware.bin");
        if fallback.is_file() {
            return Some(fallback);
        }
        None
    }
}

/// Target version encoded in a peripheral firmware filename:
/// `firmware_<version>.bin` yields `<version>`, anything else `None`.
pub fn version_from_firmware_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let version = name.strip_prefix("firmware_")?.strip_suffix(".bin")?;
    if version.is_empty() {
        None
    } else {
        Some(version.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_crc_matches_reference_table() {
        // reference values computed with the 256-entry table from AP_Math
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(CRC32_BOOTLOADER.checksum(&bytes), 0xA6E6BF30);
        assert_eq!(CRC32_BOOTLOADER.checksum(b"123456789"), 0x2DFD2D88);
    }

    #[test]
    fn board_names() {
        assert_eq!(board_name_for_board_id(140), Some("CubeOrange"));
        assert_eq!(board_name_for_board_id(1063), Some("CubeOrangePlus"));
        assert_eq!(board_name_for_board_id(999), None);
    }

    #[test]
    fn compatibility_table() {
        assert_eq!(compatible_board(33), Some((9, "AUAVX2.1")));
        assert_eq!(compatible_board(140), None);
    }

    #[test]
    fn version_extraction() {
        assert_eq!(
            version_from_firmware_name(Path::new("firmware_1.8.abcd12.bin")),
            Some("1.8.abcd12".to_string())
        );
        assert_eq!(version_from_firmware_name(Path::new("firmware.bin")), None);
        assert_eq!(version_from_firmware_name(Path::new("other.bin")), None);
    }

    #[test]
    fn peripheral_lookup_prefers_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("com.cubepilot.here4");
        std::fs::create_dir_all(&device_dir).unwrap();
        std::fs::write(device_dir.join("firmware.bin"), b"old").unwrap();
        std::fs::write(device_dir.join("firmware_1.8.bin"), b"new").unwrap();

        let catalog = FirmwareCatalog::new(dir.path());
        let found = catalog
            .find_peripheral_firmware("com.cubepilot.here4")
            .unwrap();
        assert!(found.ends_with("firmware_1.8.bin"));
    }

    #[test]
    fn peripheral_lookup_falls_back_to_plain() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("com.cubepilot.here4");
        std::fs::create_dir_all(&device_dir).unwrap();
        std::fs::write(device_dir.join("firmware.bin"), b"fw").unwrap();

        let catalog = FirmwareCatalog::new(dir.path());
        let found = catalog
            .find_peripheral_firmware("com.cubepilot.here4")
            .unwrap();
        assert!(found.ends_with("firmware.bin"));
    }

    #[test]
    fn peripheral_lookup_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FirmwareCatalog::new(dir.path());
        assert!(catalog
            .find_peripheral_firmware("com.cubepilot.nothere")
            .is_none());
    }
}
