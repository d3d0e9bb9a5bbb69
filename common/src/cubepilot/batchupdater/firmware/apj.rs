//! Loader for the vendor `.apj` firmware bundle: a JSON document wrapping
//! a zlib-compressed, base64-encoded raw flash image plus metadata.

use base64::Engine;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::cubepilot::batchupdater::{firmware::CRC32_BOOTLOADER, Error, Result};

/// Padding appended when CRC'ing the image out to the full flash size
const CRC_PAD: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Deserialize)]
struct ApjDocument {
    image: String,
    image_size: u32,
    board_id: u32,
    #[serde(default)]
    board_revision: u32,
    extf_image: Option<String>,
    #[serde(default)]
    extf_image_size: u32,
}

///
/// Decoded firmware bundle, immutable after load.
///
/// Both images are right-padded with 0xFF to a 4-byte multiple so that all
/// programming and CRC operations work on whole words.
///
pub struct FirmwareBundle {
    pub path: PathBuf,
    pub board_id: u32,
    pub board_revision: u32,
    pub image_size: u32,
    pub extf_image_size: u32,
    image: Vec<u8>,
    extf_image: Option<Vec<u8>>,
}

impl FirmwareBundle {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let parse_err = |reason: String| Error::BundleParse {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path)
            .map_err(|e| parse_err(format!("read failed: {}", e)))?;
        let doc: ApjDocument =
            serde_json::from_str(&text).map_err(|e| parse_err(format!("bad JSON: {}", e)))?;

        let image = decode_image(&doc.image).map_err(parse_err)?;
        let extf_image = match &doc.extf_image {
            Some(encoded) => Some(decode_image(encoded).map_err(parse_err)?),
            None => None,
        };

        Ok(FirmwareBundle {
            path: path.to_path_buf(),
            board_id: doc.board_id,
            board_revision: doc.board_revision,
            image_size: doc.image_size,
            extf_image_size: doc.extf_image_size,
            image,
            extf_image,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_raw(board_id: u32, image: Vec<u8>, extf_image: Option<Vec<u8>>) -> Self {
        FirmwareBundle {
            path: PathBuf::from("test.apj"),
            board_id,
            board_revision: 0,
            image_size: image.len() as u32,
            extf_image_size: extf_image.as_ref().map(|i| i.len() as u32).unwrap_or(0),
            image,
            extf_image,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn extf_image(&self) -> Option<&[u8]> {
        self.extf_image.as_deref()
    }

    /// CRC of the image as the bootloader computes it over the whole flash
    /// region: the image bytes followed by 0xFF words out to `pad_len`.
    pub fn crc_image(&self, pad_len: u32) -> u32 {
        let mut digest = CRC32_BOOTLOADER.digest();
        digest.update(&self.image);
        let mut filled = self.image.len() as u32;
        while filled < pad_len {
            digest.update(&CRC_PAD);
            filled += 4;
        }
        digest.finalize()
    }

    /// CRC of the first `size` bytes of the external-flash image.
    pub fn crc_extf(&self, size: u32) -> u32 {
        let image = self.extf_image.as_deref().unwrap_or(&[]);
        let end = (size as usize).min(image.len());
        CRC32_BOOTLOADER.checksum(&image[..end])
    }
}

fn decode_image(encoded: &str) -> std::result::Result<Vec<u8>, String> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("bad base64: {}", e))?;

    let mut image = Vec::new();
    flate2::read::ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut image)
        .map_err(|e| format!("zlib decompression failed: {}", e))?;

    // pad image to 4-byte length
    while image.len() % 4 != 0 {
        image.push(0xFF);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn encode_image(raw: &[u8]) -> String {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let compressed = encoder.finish().unwrap();
        base64::engine::general_purpose::STANDARD.encode(compressed)
    }

    fn write_bundle(dir: &Path, name: &str, raw: &[u8], board_id: u32) -> PathBuf {
        let doc = serde_json::json!({
            "image": encode_image(raw),
            "image_size": raw.len() as u32,
            "board_id": board_id,
            "board_revision": 0,
        });
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn load_pads_image_to_word_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "test.apj", &[1, 2, 3, 4, 5], 140);

        let bundle = FirmwareBundle::load(&path).unwrap();
        assert_eq!(bundle.board_id, 140);
        assert_eq!(bundle.image().len(), 8);
        assert_eq!(&bundle.image()[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(&bundle.image()[5..], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn crc_image_matches_manual_padding() {
        let dir = tempfile::tempdir().unwrap();
        let raw = [0x11u8, 0x22, 0x33, 0x44];
        let path = write_bundle(dir.path(), "test.apj", &raw, 9);
        let bundle = FirmwareBundle::load(&path).unwrap();

        // CRC over image + 0xFF fill out to 16 bytes, computed directly
        let mut padded = raw.to_vec();
        padded.resize(16, 0xFF);
        let expected = CRC32_BOOTLOADER.checksum(&padded);

        assert_eq!(bundle.crc_image(16), expected);
        // deterministic
        assert_eq!(bundle.crc_image(16), bundle.crc_image(16));
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.apj");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FirmwareBundle::load(&path),
            Err(Error::BundleParse { .. })
        ));
    }

    #[test]
    fn bad_base64_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.apj");
        let doc = serde_json::json!({
            "image": "@@not-base64@@",
            "image_size": 4,
            "board_id": 140,
        });
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        assert!(matches!(
            FirmwareBundle::load(&path),
            Err(Error::BundleParse { .. })
        ));
    }

    #[test]
    fn extf_crc_covers_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let raw = [0xA0u8; 8];
        let extf = [0xB0u8; 12];
        let doc = serde_json::json!({
            "image": encode_image(&raw),
            "image_size": raw.len() as u32,
            "board_id": 140,
            "board_revision": 1,
            "extf_image": encode_image(&extf),
            "extf_image_size": extf.len() as u32,
        });
        let path = dir.path().join("extf.apj");
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let bundle = FirmwareBundle::load(&path).unwrap();
        assert_eq!(bundle.crc_extf(8), CRC32_BOOTLOADER.checksum(&extf[..8]));
    }
}
