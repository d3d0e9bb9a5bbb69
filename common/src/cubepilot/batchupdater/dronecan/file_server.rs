//! Serves firmware bytes to peers over the standard file-read service.
//!
//! Peers are handed a short opaque path: the first 7 characters of the
//! base64 encoding of the CRC-32 of the real path bytes. Keeping the wire
//! path short makes the BeginFirmwareUpdate request a single-frame
//! transfer on most setups.

use base64::Engine;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::cubepilot::batchupdater::dronecan::messages::{
    file_error, FileReadRequest, FileReadResponse, FILE_READ_CHUNK,
};

const PATH_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// 7-character hash key peers use to address a served file.
pub fn path_key(path: &str) -> String {
    let crc = PATH_CRC.checksum(path.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(crc.to_le_bytes());
    encoded.chars().take(7).collect()
}

///
/// Hash-keyed map of files served to updating peers.
///
#[derive(Default)]
pub struct FileServer {
    map: HashMap<String, PathBuf>,
}

impl FileServer {
    pub fn new() -> Self {
        FileServer {
            map: HashMap::new(),
        }
    }

    /// Registers a file and returns the key peers should request.
    pub fn add_file(&mut self, path: &Path) -> String {
        let key = path_key(&path.to_string_lossy());
        self.map.insert(key.clone(), path.to_path_buf());
        key
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Answers one read request with up to 256 bytes at the given offset.
    /// A read at or past EOF returns an empty chunk, which peers take as
    /// end of file.
    pub fn handle_read(&self, request: &FileReadRequest) -> FileReadResponse {
        let path = match self.map.get(request.path.trim()) {
            Some(path) => path,
            None => {
                return FileReadResponse {
                    error: file_error::NOT_FOUND,
                    data: Vec::new(),
                }
            }
        };

        match read_chunk(path, request.offset) {
            Ok(data) => FileReadResponse {
                error: file_error::OK,
                data,
            },
            Err(e) => {
                log::warn!("file read failed for {}: {}", path.display(), e);
                FileReadResponse {
                    error: file_error::IO_ERROR,
                    data: Vec::new(),
                }
            }
        }
    }
}

fn read_chunk(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; FILE_READ_CHUNK];
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_key_matches_reference_vectors() {
        // computed with the reference implementation
        assert_eq!(
            path_key("firmware/com.cubepilot.here4/firmware_1.8.abcd12.bin"),
            "8Lxorw="
        );
        assert_eq!(
            path_key("firmware/com.cubepilot.here4/firmware.bin"),
            "gef/kw="
        );
    }

    #[test]
    fn serves_chunks_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        let content: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut server = FileServer::new();
        let key = server.add_file(&path);

        let first = server.handle_read(&FileReadRequest {
            offset: 0,
            path: key.clone(),
        });
        assert_eq!(first.error, file_error::OK);
        assert_eq!(first.data, &content[..256]);

        let middle = server.handle_read(&FileReadRequest {
            offset: 512,
            path: key.clone(),
        });
        assert_eq!(middle.data, &content[512..600]);

        let past_eof = server.handle_read(&FileReadRequest {
            offset: 4096,
            path: key,
        });
        assert_eq!(past_eof.error, file_error::OK);
        assert!(past_eof.data.is_empty());
    }

    #[test]
    fn unknown_key_is_not_found() {
        let server = FileServer::new();
        let resp = server.handle_read(&FileReadRequest {
            offset: 0,
            path: "nothere".to_string(),
        });
        assert_eq!(resp.error, file_error::NOT_FOUND);
    }
}
