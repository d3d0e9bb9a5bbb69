//! Serial-tunnelled CAN adapter transport.
//!
//! The adapter is an autopilot USB interface speaking MAVLink: CAN frames
//! travel inside CAN_FRAME messages, and a periodic MAV_CMD_CAN_FORWARD
//! keeps the autopilot forwarding the selected bus to us.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::com::SerialLink;
use crate::cubepilot::batchupdater::dronecan::mavlink::{
    self, CommandLong, MavParser, TunnelFrame, MAV_CMD_CAN_FORWARD, MSG_ID_CAN_FRAME,
};
use crate::cubepilot::batchupdater::dronecan::CanFrame;
use crate::cubepilot::batchupdater::Result;

/// Extended-frame flag on the tunnelled identifier
const FLAG_EFF: u32 = 0x8000_0000;

/// How often the forwarding command is refreshed
const FORWARD_REFRESH: Duration = Duration::from_secs(1);

///
/// One CAN endpoint: (serial port, bus number). Owns the port exclusively.
///
/// `bus` is the 1-based bus number as configured; the tunnel carries the
/// 0-based index.
///
pub struct CanTransport<L: SerialLink> {
    link: L,
    parser: MavParser,
    rx_queue: VecDeque<CanFrame>,
    seq: u8,
    bus: u8,
    source_system: u8,
    source_component: u8,
    target_system: u8,
    last_forward: Option<Instant>,
}

impl<L: SerialLink> CanTransport<L> {
    pub fn new(link: L, bus: u8) -> Self {
        CanTransport {
            link,
            parser: MavParser::new(),
            rx_queue: VecDeque::new(),
            seq: 0,
            bus,
            source_system: 255,
            source_component: 1,
            target_system: 0,
            last_forward: None,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[cfg(test)]
    pub(crate) fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn port_name(&self) -> String {
        self.link.name().to_owned()
    }

    pub fn open(&mut self) -> Result<()> {
        self.link.open()?;
        self.link.clear_input()?;
        self.send_forward_command()
    }

    pub fn close(&mut self) {
        self.link.close();
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Asks the autopilot to forward the configured bus. The command's
    /// param1 carries the 1-based bus number.
    fn send_forward_command(&mut self) -> Result<()> {
        let cmd = CommandLong {
            target_system: self.target_system,
            target_component: 0,
            command: MAV_CMD_CAN_FORWARD,
            confirmation: 0,
            params: [self.bus as f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        };
        let frame =
            mavlink::pack_command_long_v2(self.next_seq(), self.source_system, self.source_component, &cmd);
        self.link.write_all(&frame)?;
        self.last_forward = Some(Instant::now());
        Ok(())
    }

    /// Re-issues the forwarding command when it is about to expire.
    pub fn keepalive(&mut self) -> Result<()> {
        let due = match self.last_forward {
            Some(last) => last.elapsed() >= FORWARD_REFRESH,
            None => true,
        };
        if due {
            self.send_forward_command()?;
        }
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &CanFrame) -> Result<()> {
        let tunnel = TunnelFrame {
            bus: self.bus.saturating_sub(1),
            id: frame.id | FLAG_EFF,
            data: frame.data.clone(),
        };
        let bytes = mavlink::pack_can_frame(
            self.next_seq(),
            self.source_system,
            self.source_component,
            self.target_system,
            0,
            &tunnel,
        );
        self.link.write_all(&bytes)
    }

    /// Next tunnelled CAN frame for our bus, if one arrives within the
    /// link's read timeout.
    pub fn recv_frame(&mut self) -> Result<Option<CanFrame>> {
        if let Some(frame) = self.rx_queue.pop_front() {
            return Ok(Some(frame));
        }

        let mut buf = [0u8; 256];
        let n = self.link.read_available(&mut buf)?;
        for &byte in &buf[..n] {
            if let Some(msg) = self.parser.push(byte) {
                if msg.msgid != MSG_ID_CAN_FRAME {
                    continue;
                }
                if let Some(tunnel) = mavlink::parse_can_frame(&msg.payload) {
                    // only extended frames on our bus are interesting
                    if tunnel.bus != self.bus.saturating_sub(1) || tunnel.id & FLAG_EFF == 0 {
                        continue;
                    }
                    self.rx_queue
                        .push_back(CanFrame::new(tunnel.id & 0x1FFF_FFFF, tunnel.data));
                }
            }
        }

        Ok(self.rx_queue.pop_front())
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubepilot::batchupdater::com::SerialSim;

    #[test]
    fn open_requests_bus_forwarding() {
        let mut transport = CanTransport::new(SerialSim::new(), 2);
        transport.open().unwrap();

        let mut parser = MavParser::new();
        let mut msg = None;
        for &b in transport.link.written() {
            if let Some(m) = parser.push(b) {
                msg = Some(m);
            }
        }
        let msg = msg.expect("no command frame written");
        assert_eq!(msg.msgid, mavlink::MSG_ID_COMMAND_LONG);
        // param1 = bus number, command = CAN_FORWARD
        let param1 = f32::from_le_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]]);
        assert_eq!(param1, 2.0);
        let command = u16::from_le_bytes([msg.payload[28], msg.payload[29]]);
        assert_eq!(command, MAV_CMD_CAN_FORWARD);
    }

    #[test]
    fn frame_roundtrip_through_tunnel() {
        let mut tx = CanTransport::new(SerialSim::new(), 2);
        let frame = CanFrame::new(0x1801_5519, vec![1, 2, 3, 4, 5, 6, 7, 0x85]);
        tx.send_frame(&frame).unwrap();
        let wire = tx.link.written().to_vec();

        let mut sim = SerialSim::new();
        sim.push_response(&wire);
        let mut rx = CanTransport::new(sim, 2);
        let received = rx.recv_frame().unwrap().expect("no frame received");
        assert_eq!(received, frame);
    }

    #[test]
    fn frames_for_other_buses_are_dropped() {
        let mut tx = CanTransport::new(SerialSim::new(), 1);
        let frame = CanFrame::new(0x42, vec![9]);
        tx.send_frame(&frame).unwrap();
        let wire = tx.link.written().to_vec();

        // receiver listens on bus 2, sender tunnelled bus 1
        let mut sim = SerialSim::new();
        sim.push_response(&wire);
        let mut rx = CanTransport::new(sim, 2);
        assert!(rx.recv_frame().unwrap().is_none());
    }
}
