//! Minimal MAVLink codec for the two places this tool needs it: kicking a
//! flight stack into its bootloader (fixed v1 COMMAND_LONG frames) and the
//! CAN-over-MAVLink tunnel spoken by the autopilot's second USB interface
//! (v2 CAN_FRAME + MAV_CMD_CAN_FORWARD).

pub const MAVLINK_V1_MAGIC: u8 = 0xFE;
pub const MAVLINK_V2_MAGIC: u8 = 0xFD;

pub const MSG_ID_COMMAND_LONG: u32 = 76;
pub const MSG_ID_COMMAND_ACK: u32 = 77;
pub const MSG_ID_CAN_FRAME: u32 = 386;

pub const MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN: u16 = 246;
pub const MAV_CMD_CAN_FORWARD: u16 = 32000;

/// Fixed reboot-to-bootloader frame for component id 1 (no target system
/// configured).
pub const MAVLINK_REBOOT_ID1: [u8; 41] = [
    0xFE, 0x21, 0x72, 0xFF, 0x00, 0x4C, 0x00, 0x00, 0x40, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xF6, 0x00, 0x01, 0x00, 0x00, 0x53, 0x6B,
];

/// Fixed reboot-to-bootloader frame for component id 0.
pub const MAVLINK_REBOOT_ID0: [u8; 41] = [
    0xFE, 0x21, 0x45, 0xFF, 0x00, 0x4C, 0x00, 0x00, 0x40, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xF6, 0x00, 0x00, 0x00, 0x00, 0xCC, 0x37,
];

fn crc_extra_for(msgid: u32) -> Option<u8> {
    match msgid {
        MSG_ID_COMMAND_LONG => Some(152),
        MSG_ID_COMMAND_ACK => Some(143),
        MSG_ID_CAN_FRAME => Some(132),
        _ => None,
    }
}

// X.25 checksum ----------------------------------------------------------------------------------

pub fn x25_accumulate(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        let mut tmp = byte ^ (crc & 0xFF) as u8;
        tmp ^= tmp << 4;
        crc = (crc >> 8) ^ ((tmp as u16) << 8) ^ ((tmp as u16) << 3) ^ ((tmp as u16) >> 4);
    }
    crc
}

fn frame_crc(body: &[u8], crc_extra: u8) -> u16 {
    x25_accumulate(x25_accumulate(0xFFFF, body), &[crc_extra])
}

// COMMAND_LONG -----------------------------------------------------------------------------------

pub struct CommandLong {
    pub target_system: u8,
    pub target_component: u8,
    pub command: u16,
    pub confirmation: u8,
    pub params: [f32; 7],
}

impl CommandLong {
    fn payload(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        for (i, p) in self.params.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
        }
        out[28..30].copy_from_slice(&self.command.to_le_bytes());
        out[30] = self.target_system;
        out[31] = self.target_component;
        out[32] = self.confirmation;
        out
    }
}

/// Packs a COMMAND_LONG as a MAVLink v1 frame (used for the bootloader
/// reboot path, where the flight stack may be old enough to only speak v1).
pub fn pack_command_long_v1(seq: u8, sysid: u8, compid: u8, cmd: &CommandLong) -> Vec<u8> {
    let payload = cmd.payload();
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(MAVLINK_V1_MAGIC);
    frame.push(payload.len() as u8);
    frame.push(seq);
    frame.push(sysid);
    frame.push(compid);
    frame.push(MSG_ID_COMMAND_LONG as u8);
    frame.extend_from_slice(&payload);
    let crc = frame_crc(&frame[1..], crc_extra_for(MSG_ID_COMMAND_LONG).unwrap());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn pack_command_long_v2(seq: u8, sysid: u8, compid: u8, cmd: &CommandLong) -> Vec<u8> {
    pack_v2(seq, sysid, compid, MSG_ID_COMMAND_LONG, &cmd.payload())
}

// v2 framing -------------------------------------------------------------------------------------

fn pack_v2(seq: u8, sysid: u8, compid: u8, msgid: u32, payload: &[u8]) -> Vec<u8> {
    // v2 truncates trailing zero payload bytes, keeping at least one
    let mut len = payload.len();
    while len > 1 && payload[len - 1] == 0 {
        len -= 1;
    }

    let mut frame = Vec::with_capacity(12 + len);
    frame.push(MAVLINK_V2_MAGIC);
    frame.push(len as u8);
    frame.push(0); // incompat flags
    frame.push(0); // compat flags
    frame.push(seq);
    frame.push(sysid);
    frame.push(compid);
    frame.extend_from_slice(&msgid.to_le_bytes()[..3]);
    frame.extend_from_slice(&payload[..len]);
    let crc = frame_crc(
        &frame[1..],
        crc_extra_for(msgid).expect("crc extra unknown for packed message"),
    );
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

// CAN_FRAME tunnel -------------------------------------------------------------------------------

/// One tunnelled CAN frame. `id` is the raw 29-bit extended identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelFrame {
    pub bus: u8,
    pub id: u32,
    pub data: Vec<u8>,
}

const CAN_FRAME_PAYLOAD_LEN: usize = 16;

pub fn pack_can_frame(
    seq: u8,
    sysid: u8,
    compid: u8,
    target_system: u8,
    target_component: u8,
    frame: &TunnelFrame,
) -> Vec<u8> {
    let mut payload = [0u8; CAN_FRAME_PAYLOAD_LEN];
    payload[0..4].copy_from_slice(&frame.id.to_le_bytes());
    payload[4] = target_system;
    payload[5] = target_component;
    payload[6] = frame.bus;
    payload[7] = frame.data.len() as u8;
    payload[8..8 + frame.data.len()].copy_from_slice(&frame.data);
    pack_v2(seq, sysid, compid, MSG_ID_CAN_FRAME, &payload)
}

/// Decodes a CAN_FRAME payload (already zero-extended to full length).
pub fn parse_can_frame(payload: &[u8]) -> Option<TunnelFrame> {
    if payload.len() < CAN_FRAME_PAYLOAD_LEN {
        return None;
    }
    let id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let bus = payload[6];
    let len = (payload[7] as usize).min(8);
    Some(TunnelFrame {
        bus,
        id,
        data: payload[8..8 + len].to_vec(),
    })
}

// Parser -----------------------------------------------------------------------------------------

pub struct MavMessage {
    pub msgid: u32,
    pub payload: Vec<u8>,
}

enum ParserState {
    Sync,
    Collect {
        v2: bool,
        header_len: usize,
        total_len: Option<usize>,
    },
}

///
/// Incremental frame parser for the adapter's byte stream.
///
/// Frames with an unknown message id (whose CRC_EXTRA we cannot know) and
/// frames failing the checksum are dropped silently; the tunnel only needs
/// CAN_FRAME and the occasional COMMAND_ACK.
///
pub struct MavParser {
    state: ParserState,
    buf: Vec<u8>,
}

impl Default for MavParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MavParser {
    pub fn new() -> Self {
        MavParser {
            state: ParserState::Sync,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<MavMessage> {
        match self.state {
            ParserState::Sync => {
                if byte == MAVLINK_V1_MAGIC {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.state = ParserState::Collect {
                        v2: false,
                        header_len: 6,
                        total_len: None,
                    };
                } else if byte == MAVLINK_V2_MAGIC {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.state = ParserState::Collect {
                        v2: true,
                        header_len: 10,
                        total_len: None,
                    };
                }
                None
            }
            ParserState::Collect {
                v2,
                header_len,
                total_len,
            } => {
                self.buf.push(byte);

                let total = match total_len {
                    Some(t) => t,
                    None => {
                        if self.buf.len() < header_len {
                            return None;
                        }
                        let payload_len = self.buf[1] as usize;
                        let mut t = header_len + payload_len + 2;
                        if v2 && (self.buf[2] & 0x01) != 0 {
                            t += 13; // signature
                        }
                        self.state = ParserState::Collect {
                            v2,
                            header_len,
                            total_len: Some(t),
                        };
                        t
                    }
                };

                if self.buf.len() < total {
                    return None;
                }

                let msg = self.finish(v2, header_len);
                self.state = ParserState::Sync;
                msg
            }
        }
    }

    fn finish(&mut self, v2: bool, header_len: usize) -> Option<MavMessage> {
        let payload_len = self.buf[1] as usize;
        let msgid = if v2 {
            u32::from_le_bytes([self.buf[7], self.buf[8], self.buf[9], 0])
        } else {
            self.buf[5] as u32
        };

        let extra = crc_extra_for(msgid)?;
        let crc_end = header_len + payload_len;
        let computed = frame_crc(&self.buf[1..crc_end], extra);
        let received = u16::from_le_bytes([self.buf[crc_end], self.buf[crc_end + 1]]);
        if computed != received {
            return None;
        }

        let mut payload = self.buf[header_len..crc_end].to_vec();
        if v2 && msgid == MSG_ID_CAN_FRAME {
            payload.resize(CAN_FRAME_PAYLOAD_LEN, 0);
        }
        Some(MavMessage { msgid, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_reboot_frames_have_valid_checksums() {
        for frame in [&MAVLINK_REBOOT_ID1, &MAVLINK_REBOOT_ID0] {
            let crc = frame_crc(&frame[1..39], 152);
            assert_eq!(crc.to_le_bytes(), [frame[39], frame[40]]);
        }
    }

    #[test]
    fn packed_v1_reboot_matches_fixed_frame() {
        let cmd = CommandLong {
            target_system: 1,
            target_component: 0,
            command: MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
            confirmation: 0,
            params: [3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        };
        let frame = pack_command_long_v1(0x72, 0xFF, 0x00, &cmd);
        assert_eq!(frame.as_slice(), &MAVLINK_REBOOT_ID1[..]);
    }

    #[test]
    fn can_frame_roundtrip_through_parser() {
        let tunnel = TunnelFrame {
            bus: 1,
            id: 0x1E01_5503,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0xC0],
        };
        let bytes = pack_can_frame(7, 255, 1, 1, 0, &tunnel);

        let mut parser = MavParser::new();
        let mut out = None;
        for b in bytes {
            if let Some(msg) = parser.push(b) {
                out = Some(msg);
            }
        }
        let msg = out.expect("no frame parsed");
        assert_eq!(msg.msgid, MSG_ID_CAN_FRAME);
        assert_eq!(parse_can_frame(&msg.payload), Some(tunnel));
    }

    #[test]
    fn parser_rejects_corrupted_frame() {
        let tunnel = TunnelFrame {
            bus: 0,
            id: 0x100,
            data: vec![1, 2, 3],
        };
        let mut bytes = pack_can_frame(0, 255, 1, 1, 0, &tunnel);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut parser = MavParser::new();
        assert!(bytes.into_iter().all(|b| parser.push(b).is_none()));
    }

    #[test]
    fn parser_resyncs_on_garbage() {
        let tunnel = TunnelFrame {
            bus: 0,
            id: 0x42,
            data: vec![9],
        };
        let mut stream = vec![0x00, 0x55, 0xAA];
        stream.extend(pack_can_frame(3, 255, 1, 1, 0, &tunnel));

        let mut parser = MavParser::new();
        let mut found = false;
        for b in stream {
            if parser.push(b).is_some() {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn v2_truncation_zero_extends_on_parse() {
        // trailing zeros in data are truncated on the wire but restored
        let tunnel = TunnelFrame {
            bus: 0,
            id: 0x42,
            data: vec![1, 0, 0, 0, 0, 0, 0, 0],
        };
        let bytes = pack_can_frame(0, 255, 1, 1, 0, &tunnel);

        let mut parser = MavParser::new();
        let mut out = None;
        for b in bytes {
            if let Some(msg) = parser.push(b) {
                out = Some(msg);
            }
        }
        assert_eq!(parse_can_frame(&out.unwrap().payload), Some(tunnel));
    }
}
