//! Hand-written codecs for the UAVCAN v0 message set this tool speaks.
//!
//! Most payloads are byte-aligned and encoded directly; the parameter
//! service packs unions at bit granularity, handled by the small MSB-first
//! bit reader/writer at the bottom.

// Data type identifiers and signatures -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeInfo {
    pub id: u16,
    pub signature: u64,
}

pub const NODE_STATUS: DataTypeInfo = DataTypeInfo {
    id: 341,
    signature: 0x0F08_68D0_C1A7_C6F1,
};

pub const ALLOCATION: DataTypeInfo = DataTypeInfo {
    id: 1,
    signature: 0x0B2A_8126_20A1_1D40,
};

pub const LOG_MESSAGE: DataTypeInfo = DataTypeInfo {
    id: 16383,
    signature: 0xD654_A48E_0C69_D1E8,
};

pub const GET_NODE_INFO: DataTypeInfo = DataTypeInfo {
    id: 1,
    signature: 0xEE46_8A81_21C4_6A9E,
};

pub const RESTART_NODE: DataTypeInfo = DataTypeInfo {
    id: 5,
    signature: 0x569E_0539_4A30_17F0,
};

pub const PARAM_GETSET: DataTypeInfo = DataTypeInfo {
    id: 11,
    signature: 0xA7B6_22F9_39D1_A4D5,
};

pub const BEGIN_FIRMWARE_UPDATE: DataTypeInfo = DataTypeInfo {
    id: 40,
    signature: 0xB7D7_25DF_7272_4126,
};

pub const FILE_READ: DataTypeInfo = DataTypeInfo {
    id: 48,
    signature: 0x8DCD_CA93_9F33_F678,
};

/// Signature for a received message type id, `None` if we do not speak it.
pub fn message_signature(type_id: u16) -> Option<u64> {
    match type_id {
        id if id == NODE_STATUS.id => Some(NODE_STATUS.signature),
        id if id == ALLOCATION.id => Some(ALLOCATION.signature),
        id if id == LOG_MESSAGE.id => Some(LOG_MESSAGE.signature),
        _ => None,
    }
}

/// Signature for a received service type id.
pub fn service_signature(type_id: u8) -> Option<u64> {
    match type_id as u16 {
        id if id == GET_NODE_INFO.id => Some(GET_NODE_INFO.signature),
        id if id == RESTART_NODE.id => Some(RESTART_NODE.signature),
        id if id == PARAM_GETSET.id => Some(PARAM_GETSET.signature),
        id if id == BEGIN_FIRMWARE_UPDATE.id => Some(BEGIN_FIRMWARE_UPDATE.signature),
        id if id == FILE_READ.id => Some(FILE_READ.signature),
        _ => None,
    }
}

// NodeStatus -------------------------------------------------------------------------------------

pub mod node_mode {
    pub const OPERATIONAL: u8 = 0;
    pub const INITIALIZATION: u8 = 1;
    pub const MAINTENANCE: u8 = 2;
    pub const SOFTWARE_UPDATE: u8 = 3;
    pub const OFFLINE: u8 = 7;
}

pub mod node_health {
    pub const OK: u8 = 0;
    pub const WARNING: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const CRITICAL: u8 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub uptime_sec: u32,
    pub health: u8,
    pub mode: u8,
    pub sub_mode: u8,
    pub vendor_specific_status_code: u16,
}

impl NodeStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7);
        out.extend_from_slice(&self.uptime_sec.to_le_bytes());
        out.push((self.health & 0x03) << 6 | (self.mode & 0x07) << 3 | (self.sub_mode & 0x07));
        out.extend_from_slice(&self.vendor_specific_status_code.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<NodeStatus> {
        if payload.len() < 7 {
            return None;
        }
        Some(NodeStatus {
            uptime_sec: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            health: payload[4] >> 6,
            mode: (payload[4] >> 3) & 0x07,
            sub_mode: payload[4] & 0x07,
            vendor_specific_status_code: u16::from_le_bytes([payload[5], payload[6]]),
        })
    }
}

// GetNodeInfo ------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftwareVersion {
    pub major: u8,
    pub minor: u8,
    pub optional_field_flags: u8,
    pub vcs_commit: u32,
    pub image_crc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareVersion {
    pub major: u8,
    pub minor: u8,
    pub unique_id: [u8; 16],
    pub certificate_of_authenticity: Vec<u8>,
}

impl Default for HardwareVersion {
    fn default() -> Self {
        HardwareVersion {
            major: 0,
            minor: 0,
            unique_id: [0; 16],
            certificate_of_authenticity: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub status: NodeStatus,
    pub software_version: SoftwareVersion,
    pub hardware_version: HardwareVersion,
    pub name: String,
}

impl NodeInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.status.encode();
        out.push(self.software_version.major);
        out.push(self.software_version.minor);
        out.push(self.software_version.optional_field_flags);
        out.extend_from_slice(&self.software_version.vcs_commit.to_le_bytes());
        out.extend_from_slice(&self.software_version.image_crc.to_le_bytes());
        out.push(self.hardware_version.major);
        out.push(self.hardware_version.minor);
        out.extend_from_slice(&self.hardware_version.unique_id);
        out.push(self.hardware_version.certificate_of_authenticity.len() as u8);
        out.extend_from_slice(&self.hardware_version.certificate_of_authenticity);
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<NodeInfo> {
        let status = NodeStatus::decode(payload)?;
        let rest = &payload[7..];
        if rest.len() < 15 {
            return None;
        }
        let software_version = SoftwareVersion {
            major: rest[0],
            minor: rest[1],
            optional_field_flags: rest[2],
            vcs_commit: u32::from_le_bytes([rest[3], rest[4], rest[5], rest[6]]),
            image_crc: u64::from_le_bytes([
                rest[7], rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14],
            ]),
        };
        let hw = &rest[15..];
        if hw.len() < 19 {
            return None;
        }
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&hw[2..18]);
        let coa_len = hw[18] as usize;
        let tail = &hw[19..];
        if tail.len() < coa_len {
            return None;
        }
        let hardware_version = HardwareVersion {
            major: hw[0],
            minor: hw[1],
            unique_id,
            certificate_of_authenticity: tail[..coa_len].to_vec(),
        };
        let name = String::from_utf8_lossy(&tail[coa_len..]).into_owned();
        Some(NodeInfo {
            status,
            software_version,
            hardware_version,
            name,
        })
    }
}

// RestartNode ------------------------------------------------------------------------------------

/// uint40 magic number required by RestartNode requests
pub const RESTART_MAGIC_NUMBER: u64 = 0xAC_CE55_1B1E;

pub fn encode_restart_request() -> Vec<u8> {
    RESTART_MAGIC_NUMBER.to_le_bytes()[..5].to_vec()
}

pub fn decode_restart_response(payload: &[u8]) -> Option<bool> {
    payload.first().map(|b| b & 0x80 != 0)
}

#[cfg(test)]
pub fn encode_restart_response(ok: bool) -> Vec<u8> {
    vec![if ok { 0x80 } else { 0x00 }]
}

// Allocation -------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub node_id: u8,
    pub first_part_of_unique_id: bool,
    pub unique_id: Vec<u8>,
}

impl Allocation {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.unique_id.len());
        out.push((self.node_id & 0x7F) << 1 | u8::from(self.first_part_of_unique_id));
        out.extend_from_slice(&self.unique_id);
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Allocation> {
        let head = *payload.first()?;
        Some(Allocation {
            node_id: head >> 1,
            first_part_of_unique_id: head & 0x01 != 0,
            unique_id: payload[1..].to_vec(),
        })
    }
}

// debug.LogMessage -------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: u8,
    pub source: String,
    pub text: String,
}

impl LogMessage {
    pub fn decode(payload: &[u8]) -> Option<LogMessage> {
        let head = *payload.first()?;
        let level = head >> 5;
        let source_len = (head & 0x1F) as usize;
        if payload.len() < 1 + source_len {
            return None;
        }
        Some(LogMessage {
            level,
            source: String::from_utf8_lossy(&payload[1..1 + source_len]).into_owned(),
            text: String::from_utf8_lossy(&payload[1 + source_len..]).into_owned(),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let source = self.source.as_bytes();
        let mut out = vec![(self.level & 0x07) << 5 | (source.len() as u8 & 0x1F)];
        out.extend_from_slice(source);
        out.extend_from_slice(self.text.as_bytes());
        out
    }
}

// param.GetSet -----------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Empty,
    Integer(i64),
    Real(f32),
    Boolean(bool),
    Text(Vec<u8>),
}

impl ParamValue {
    fn write(&self, writer: &mut BitWriter) {
        match self {
            ParamValue::Empty => writer.write_bits(0, 3),
            ParamValue::Integer(value) => {
                writer.write_bits(1, 3);
                writer.write_bytes(&value.to_le_bytes());
            }
            ParamValue::Real(value) => {
                writer.write_bits(2, 3);
                writer.write_bytes(&value.to_le_bytes());
            }
            ParamValue::Boolean(value) => {
                writer.write_bits(3, 3);
                writer.write_bytes(&[u8::from(*value)]);
            }
            ParamValue::Text(bytes) => {
                writer.write_bits(4, 3);
                writer.write_bits(bytes.len() as u64, 8);
                writer.write_bytes(bytes);
            }
        }
    }

    fn read(reader: &mut BitReader) -> Option<ParamValue> {
        match reader.read_bits(3)? {
            0 => Some(ParamValue::Empty),
            1 => {
                let mut raw = [0u8; 8];
                reader.read_bytes(&mut raw)?;
                Some(ParamValue::Integer(i64::from_le_bytes(raw)))
            }
            2 => {
                let mut raw = [0u8; 4];
                reader.read_bytes(&mut raw)?;
                Some(ParamValue::Real(f32::from_le_bytes(raw)))
            }
            3 => {
                let mut raw = [0u8; 1];
                reader.read_bytes(&mut raw)?;
                Some(ParamValue::Boolean(raw[0] != 0))
            }
            4 => {
                let len = reader.read_bits(8)? as usize;
                let mut bytes = vec![0u8; len];
                reader.read_bytes(&mut bytes)?;
                Some(ParamValue::Text(bytes))
            }
            _ => None,
        }
    }
}

/// NumericValue union inside GetSet responses (2-bit tag)
fn read_numeric_value(reader: &mut BitReader) -> Option<()> {
    match reader.read_bits(2)? {
        0 => Some(()),
        1 => {
            let mut raw = [0u8; 8];
            reader.read_bytes(&mut raw)?;
            Some(())
        }
        2 => {
            let mut raw = [0u8; 4];
            reader.read_bytes(&mut raw)?;
            Some(())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGetSetRequest {
    pub index: u16,
    pub value: ParamValue,
    pub name: String,
}

impl ParamGetSetRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BitWriter::new();
        writer.write_bits(self.index as u64, 13);
        self.value.write(&mut writer);
        writer.write_bytes(self.name.as_bytes());
        writer.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGetSetResponse {
    pub value: ParamValue,
    pub default_value: ParamValue,
    pub name: String,
}

impl ParamGetSetResponse {
    pub fn decode(payload: &[u8]) -> Option<ParamGetSetResponse> {
        let mut reader = BitReader::new(payload);
        let value = ParamValue::read(&mut reader)?;
        let default_value = ParamValue::read(&mut reader)?;
        read_numeric_value(&mut reader)?; // max_value
        read_numeric_value(&mut reader)?; // min_value
        let mut name = Vec::new();
        while reader.remaining_bits() >= 8 {
            name.push(reader.read_bits(8)? as u8);
        }
        Some(ParamGetSetResponse {
            value,
            default_value,
            name: String::from_utf8_lossy(&name).into_owned(),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BitWriter::new();
        self.value.write(&mut writer);
        self.default_value.write(&mut writer);
        writer.write_bits(0, 2); // max_value: Empty
        writer.write_bits(0, 2); // min_value: Empty
        writer.write_bytes(self.name.as_bytes());
        writer.finish()
    }
}

// file.BeginFirmwareUpdate -----------------------------------------------------------------------

pub mod begin_update_error {
    pub const OK: u8 = 0;
    pub const INVALID_MODE: u8 = 1;
    pub const IN_PROGRESS: u8 = 2;
    pub const UNKNOWN: u8 = 255;
}

pub fn encode_begin_update_request(source_node_id: u8, path: &str) -> Vec<u8> {
    let mut out = vec![source_node_id];
    out.extend_from_slice(path.as_bytes());
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginUpdateResponse {
    pub error: u8,
    pub optional_error_message: String,
}

impl BeginUpdateResponse {
    pub fn decode(payload: &[u8]) -> Option<BeginUpdateResponse> {
        Some(BeginUpdateResponse {
            error: *payload.first()?,
            optional_error_message: String::from_utf8_lossy(&payload[1..]).into_owned(),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.error];
        out.extend_from_slice(self.optional_error_message.as_bytes());
        out
    }
}

// file.Read --------------------------------------------------------------------------------------

pub mod file_error {
    pub const OK: i16 = 0;
    pub const NOT_FOUND: i16 = 2;
    pub const IO_ERROR: i16 = 5;
}

/// Largest data chunk a file.Read response may carry
pub const FILE_READ_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadRequest {
    pub offset: u64,
    pub path: String,
}

impl FileReadRequest {
    pub fn decode(payload: &[u8]) -> Option<FileReadRequest> {
        if payload.len() < 5 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..5].copy_from_slice(&payload[..5]);
        Some(FileReadRequest {
            offset: u64::from_le_bytes(raw),
            path: String::from_utf8_lossy(&payload[5..]).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.offset.to_le_bytes()[..5].to_vec();
        out.extend_from_slice(self.path.as_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadResponse {
    pub error: i16,
    pub data: Vec<u8>,
}

impl FileReadResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.error.to_le_bytes().to_vec();
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Option<FileReadResponse> {
        if payload.len() < 2 {
            return None;
        }
        Some(FileReadResponse {
            error: i16::from_le_bytes([payload[0], payload[1]]),
            data: payload[2..].to_vec(),
        })
    }
}

// Bit-level packing ------------------------------------------------------------------------------

/// MSB-first bit writer. Multi-byte integers enter as little-endian byte
/// sequences, matching the v0 serialization rules.
struct BitWriter {
    out: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn new() -> Self {
        BitWriter {
            out: Vec::new(),
            bit: 0,
        }
    }

    fn write_bits(&mut self, value: u64, bits: usize) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            if self.bit % 8 == 0 {
                self.out.push(0);
            }
            let byte = self.out.last_mut().unwrap();
            *byte |= (bit as u8) << (7 - (self.bit % 8));
            self.bit += 1;
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_bits(byte as u64, 8);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// MSB-first bit reader over a received payload.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, bit: 0 }
    }

    fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    fn read_bits(&mut self, bits: usize) -> Option<u64> {
        if self.remaining_bits() < bits {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data[self.bit / 8];
            let bit = (byte >> (7 - (self.bit % 8))) & 1;
            value = (value << 1) | bit as u64;
            self.bit += 1;
        }
        Some(value)
    }

    fn read_bytes(&mut self, out: &mut [u8]) -> Option<()> {
        for slot in out.iter_mut() {
            *slot = self.read_bits(8)? as u8;
        }
        Some(())
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_known_bytes() {
        let status = NodeStatus {
            uptime_sec: 1,
            health: node_health::OK,
            mode: node_mode::MAINTENANCE,
            sub_mode: 0,
            vendor_specific_status_code: 0x1234,
        };
        assert_eq!(status.encode(), vec![1, 0, 0, 0, 0x10, 0x34, 0x12]);
        assert_eq!(NodeStatus::decode(&status.encode()), Some(status));
    }

    #[test]
    fn node_status_mode_extraction() {
        let status = NodeStatus {
            uptime_sec: 77,
            health: node_health::WARNING,
            mode: node_mode::SOFTWARE_UPDATE,
            sub_mode: 0,
            vendor_specific_status_code: 512,
        };
        let decoded = NodeStatus::decode(&status.encode()).unwrap();
        assert_eq!(decoded.mode, node_mode::SOFTWARE_UPDATE);
        assert_eq!(decoded.health, node_health::WARNING);
        assert_eq!(decoded.vendor_specific_status_code, 512);
    }

    #[test]
    fn node_info_roundtrip() {
        let info = NodeInfo {
            status: NodeStatus {
                uptime_sec: 42,
                health: 0,
                mode: node_mode::OPERATIONAL,
                sub_mode: 0,
                vendor_specific_status_code: 0,
            },
            software_version: SoftwareVersion {
                major: 1,
                minor: 8,
                optional_field_flags: 1,
                vcs_commit: 0x00AB_CD12,
                image_crc: 0,
            },
            hardware_version: HardwareVersion {
                major: 2,
                minor: 0,
                unique_id: [7; 16],
                certificate_of_authenticity: vec![],
            },
            name: "com.cubepilot.here4".to_string(),
        };
        assert_eq!(NodeInfo::decode(&info.encode()), Some(info));
    }

    #[test]
    fn restart_request_is_five_magic_bytes() {
        let payload = encode_restart_request();
        assert_eq!(payload.len(), 5);
        assert_eq!(payload, vec![0x1E, 0x1B, 0x55, 0xCE, 0xAC]);
    }

    #[test]
    fn restart_response_flag() {
        assert_eq!(decode_restart_response(&encode_restart_response(true)), Some(true));
        assert_eq!(decode_restart_response(&encode_restart_response(false)), Some(false));
    }

    #[test]
    fn allocation_roundtrip() {
        let alloc = Allocation {
            node_id: 125,
            first_part_of_unique_id: false,
            unique_id: (0..16).collect(),
        };
        assert_eq!(Allocation::decode(&alloc.encode()), Some(alloc));
    }

    #[test]
    fn allocation_first_part_flag() {
        let alloc = Allocation {
            node_id: 0,
            first_part_of_unique_id: true,
            unique_id: vec![1, 2, 3, 4, 5, 6],
        };
        let bytes = alloc.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(Allocation::decode(&bytes), Some(alloc));
    }

    #[test]
    fn log_message_roundtrip() {
        let msg = LogMessage {
            level: 2,
            source: "boot".to_string(),
            text: "Bootloader Flash ok".to_string(),
        };
        assert_eq!(LogMessage::decode(&msg.encode()), Some(msg));
    }

    #[test]
    fn param_request_flash_bootloader_bytes() {
        let req = ParamGetSetRequest {
            index: 0,
            value: ParamValue::Integer(1),
            name: "FLASH_BOOTLOADER".to_string(),
        };
        let mut expected = vec![0x00, 0x01, 1, 0, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(b"FLASH_BOOTLOADER");
        assert_eq!(req.encode(), expected);
    }

    #[test]
    fn param_response_roundtrip() {
        let resp = ParamGetSetResponse {
            value: ParamValue::Integer(1),
            default_value: ParamValue::Empty,
            name: "FLASH_BOOTLOADER".to_string(),
        };
        let decoded = ParamGetSetResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.value, ParamValue::Integer(1));
        assert_eq!(decoded.name, "FLASH_BOOTLOADER");
    }

    #[test]
    fn begin_update_request_layout() {
        let payload = encode_begin_update_request(100, "8Lxorw=");
        assert_eq!(payload[0], 100);
        assert_eq!(&payload[1..], b"8Lxorw=");
    }

    #[test]
    fn file_read_request_roundtrip() {
        let req = FileReadRequest {
            offset: 0x01_2345_6789,
            path: "8Lxorw=".to_string(),
        };
        assert_eq!(FileReadRequest::decode(&req.encode()), Some(req));
    }

    #[test]
    fn file_read_response_roundtrip() {
        let resp = FileReadResponse {
            error: file_error::OK,
            data: (0..100).collect(),
        };
        assert_eq!(FileReadResponse::decode(&resp.encode()), Some(resp));
    }
}
