//! UAVCAN v0 transfer layer: 29-bit identifier packing, tail bytes and
//! multi-frame (re)assembly with the signature-seeded transfer CRC.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::dronecan::CanFrame;

/// Service requests and responses go out at this priority
pub const PRIORITY_SERVICE: u8 = 30;
/// Periodic broadcasts (NodeStatus, allocation traffic)
pub const PRIORITY_BROADCAST: u8 = 20;

pub const TRANSFER_ID_MASK: u8 = 0x1F;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(2);

// CAN identifier ---------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Message {
        type_id: u16,
        source: u8,
    },
    /// Anonymous broadcast; only the two lowest type id bits survive
    Anonymous {
        discriminator: u16,
        type_id_low: u8,
    },
    Service {
        type_id: u8,
        request: bool,
        dest: u8,
        source: u8,
    },
}

pub fn encode_message_id(priority: u8, type_id: u16, source: u8) -> u32 {
    ((priority as u32 & 0x1F) << 24) | ((type_id as u32) << 8) | (source as u32 & 0x7F)
}

pub fn encode_anonymous_id(priority: u8, discriminator: u16, type_id_low: u8) -> u32 {
    ((priority as u32 & 0x1F) << 24)
        | ((discriminator as u32 & 0x3FFF) << 10)
        | ((type_id_low as u32 & 0x03) << 8)
}

pub fn encode_service_id(priority: u8, type_id: u8, request: bool, dest: u8, source: u8) -> u32 {
    ((priority as u32 & 0x1F) << 24)
        | ((type_id as u32) << 16)
        | ((request as u32) << 15)
        | ((dest as u32 & 0x7F) << 8)
        | 0x80
        | (source as u32 & 0x7F)
}

pub fn decode_can_id(id: u32) -> (u8, TransferKind) {
    let priority = ((id >> 24) & 0x1F) as u8;
    let source = (id & 0x7F) as u8;
    let service = (id & 0x80) != 0;

    let kind = if service {
        TransferKind::Service {
            type_id: ((id >> 16) & 0xFF) as u8,
            request: (id & 0x8000) != 0,
            dest: ((id >> 8) & 0x7F) as u8,
            source,
        }
    } else if source == 0 {
        TransferKind::Anonymous {
            discriminator: ((id >> 10) & 0x3FFF) as u16,
            type_id_low: ((id >> 8) & 0x03) as u8,
        }
    } else {
        TransferKind::Message {
            type_id: ((id >> 8) & 0xFFFF) as u16,
            source,
        }
    };
    (priority, kind)
}

// Tail byte --------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailByte {
    pub start: bool,
    pub end: bool,
    pub toggle: bool,
    pub transfer_id: u8,
}

impl TailByte {
    pub fn from_byte(byte: u8) -> Self {
        TailByte {
            start: byte & 0x80 != 0,
            end: byte & 0x40 != 0,
            toggle: byte & 0x20 != 0,
            transfer_id: byte & TRANSFER_ID_MASK,
        }
    }

    pub fn to_byte(self) -> u8 {
        (u8::from(self.start) << 7)
            | (u8::from(self.end) << 6)
            | (u8::from(self.toggle) << 5)
            | (self.transfer_id & TRANSFER_ID_MASK)
    }
}

// Transfer CRC -----------------------------------------------------------------------------------

/// CRC-16-CCITT-FALSE used for multi-frame transfers, seeded with the
/// 64-bit data type signature (little-endian).
pub fn transfer_crc(signature: u64, payload: &[u8]) -> u16 {
    let mut crc = crc16_ccitt(0xFFFF, &signature.to_le_bytes());
    crc = crc16_ccitt(crc, payload);
    crc
}

fn crc16_ccitt(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

// Disassembly ------------------------------------------------------------------------------------

/// Splits a transfer payload into CAN frames under the given identifier.
pub fn make_frames(can_id: u32, payload: &[u8], transfer_id: u8, signature: u64) -> Vec<CanFrame> {
    let transfer_id = transfer_id & TRANSFER_ID_MASK;

    if payload.len() <= 7 {
        let mut data = payload.to_vec();
        data.push(
            TailByte {
                start: true,
                end: true,
                toggle: false,
                transfer_id,
            }
            .to_byte(),
        );
        return vec![CanFrame::new(can_id, data)];
    }

    let crc = transfer_crc(signature, payload);
    let mut stream = Vec::with_capacity(payload.len() + 2);
    stream.extend_from_slice(&crc.to_le_bytes());
    stream.extend_from_slice(payload);

    let mut frames = Vec::new();
    let chunks: Vec<&[u8]> = stream.chunks(7).collect();
    let last = chunks.len() - 1;
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let mut data = chunk.to_vec();
        data.push(
            TailByte {
                start: idx == 0,
                end: idx == last,
                toggle: idx % 2 == 1,
                transfer_id,
            }
            .to_byte(),
        );
        frames.push(CanFrame::new(can_id, data));
    }
    frames
}

// Reassembly -------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct CompletedTransfer {
    pub priority: u8,
    pub kind: TransferKind,
    pub transfer_id: u8,
    pub payload: Vec<u8>,
}

struct PartialTransfer {
    crc: u16,
    payload: Vec<u8>,
    next_toggle: bool,
    transfer_id: u8,
    updated: Instant,
}

///
/// Reassembles transfers from individual frames. Keyed by the frame
/// identifier, which covers source node, type and (for services) the
/// destination, so interleaved transfers from different peers cannot mix.
///
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<u32, PartialTransfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            partial: HashMap::new(),
        }
    }

    /// Feeds one frame. `signature` is the data type signature for the
    /// frame's type, `None` when the type is unknown (multi-frame
    /// transfers of unknown types are discarded).
    pub fn push(&mut self, frame: &CanFrame, signature: Option<u64>) -> Option<CompletedTransfer> {
        if frame.data.is_empty() {
            return None;
        }

        let (priority, kind) = decode_can_id(frame.id);
        let tail = TailByte::from_byte(*frame.data.last().unwrap());
        let body = &frame.data[..frame.data.len() - 1];

        if tail.start && tail.end {
            self.partial.remove(&frame.id);
            return Some(CompletedTransfer {
                priority,
                kind,
                transfer_id: tail.transfer_id,
                payload: body.to_vec(),
            });
        }

        let signature = signature?;

        if tail.start {
            if tail.toggle || body.len() < 2 {
                return None;
            }
            self.partial.insert(
                frame.id,
                PartialTransfer {
                    crc: u16::from_le_bytes([body[0], body[1]]),
                    payload: body[2..].to_vec(),
                    next_toggle: true,
                    transfer_id: tail.transfer_id,
                    updated: Instant::now(),
                },
            );
            return None;
        }

        let mut partial = self.partial.remove(&frame.id)?;
        if partial.transfer_id != tail.transfer_id || partial.next_toggle != tail.toggle {
            // lost a frame somewhere, drop the transfer
            return None;
        }
        partial.payload.extend_from_slice(body);
        partial.next_toggle = !partial.next_toggle;
        partial.updated = Instant::now();

        if !tail.end {
            self.partial.insert(frame.id, partial);
            return None;
        }

        if transfer_crc(signature, &partial.payload) != partial.crc {
            return None;
        }
        Some(CompletedTransfer {
            priority,
            kind,
            transfer_id: tail.transfer_id,
            payload: partial.payload,
        })
    }

    /// Drops partial transfers that stopped making progress.
    pub fn purge(&mut self) {
        let now = Instant::now();
        self.partial
            .retain(|_, partial| now.duration_since(partial.updated) < TRANSFER_TIMEOUT);
    }
}

// TransferIdCounter ------------------------------------------------------------------------------

/// 5-bit transfer id counters, one per (type, destination) pair.
#[derive(Default)]
pub struct TransferIdCounter {
    counters: HashMap<(u16, u8), u8>,
}

impl TransferIdCounter {
    pub fn new() -> Self {
        TransferIdCounter {
            counters: HashMap::new(),
        }
    }

    pub fn next(&mut self, type_id: u16, dest: u8) -> u8 {
        let counter = self.counters.entry((type_id, dest)).or_insert(0);
        let value = *counter;
        *counter = (*counter + 1) & TRANSFER_ID_MASK;
        value
    }
}

// Tests ------------------------------------------------------------------------------------------
