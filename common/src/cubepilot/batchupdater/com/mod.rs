pub mod ports;
pub mod serial;

use crate::cubepilot::batchupdater::{Error, Result};
use std::collections::VecDeque;

// SerialLink Trait -------------------------------------------------------------------------------

///
/// Interface trait for a byte-duplex serial channel.
///
/// Both protocol engines (the bootloader client and the CAN adapter
/// transport) talk through this trait, which keeps them testable against
/// the scripted simulator below. Exactly one owner holds a link for the
/// lifetime of an update attempt.
///
pub trait SerialLink: Send {
    /// Opens (or re-opens) the underlying channel
    fn open(&mut self) -> Result<()>;

    /// Closes the channel; further I/O fails until `open` is called again
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Writes the whole buffer or fails
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Reads exactly `buf.len()` bytes.
    ///
    /// A short read within the link timeout maps to `Error::ProtocolTimeout`.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Reads whatever is available within the link timeout, returning the
    /// number of bytes read. A timeout with no data is `Ok(0)`.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reconfigures the baud rate of the open channel
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Discards any pending input
    fn clear_input(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Locator of the channel for log messages (port path)
    fn name(&self) -> &str;
}

// Serial Simulator for Testing -------------------------------------------------------------------

///
/// Scripted serial endpoint used by protocol tests.
///
/// Response bytes are queued up front; everything the client writes is
/// captured for later inspection.
///
pub struct SerialSim {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    open: bool,
    baud: u32,
    read_error: Option<Error>,
    write_error: Option<Error>,
}

impl Default for SerialSim {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialSim {
    pub fn new() -> Self {
        SerialSim {
            rx: VecDeque::new(),
            tx: Vec::new(),
            open: true,
            baud: 115200,
            read_error: None,
            write_error: None,
        }
    }

    pub fn push_response(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_written(&mut self) {
        self.tx.clear();
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn set_read_error(&mut self, error: Error) {
        self.read_error = Some(error);
    }

    pub fn set_write_error(&mut self, error: Error) {
        self.write_error = Some(error);
    }
}

impl SerialLink for SerialSim {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if let Some(error) = self.write_error.take() {
            return Err(error);
        }
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Some(error) = self.read_error.take() {
            return Err(error);
        }
        if self.rx.len() < buf.len() {
            return Err(Error::ProtocolTimeout(buf.len()));
        }
        for slot in buf.iter_mut() {
            *slot = self.rx.pop_front().unwrap();
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(error) = self.read_error.take() {
            return Err(error);
        }
        let n = self.rx.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        // scripted responses survive input flushes so a whole exchange can
        // be queued up front
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_roundtrip() {
        let mut sim = SerialSim::new();
        sim.push_response(&[0x12, 0x10]);

        sim.write_all(&[0x21, 0x20]).unwrap();
        assert_eq!(sim.written(), &[0x21, 0x20]);

        let mut buf = [0u8; 2];
        sim.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x10]);
    }

    #[test]
    fn sim_read_timeout_when_empty() {
        let mut sim = SerialSim::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            sim.read_exact(&mut buf),
            Err(Error::ProtocolTimeout(1))
        ));
    }

    #[test]
    fn sim_read_available_partial() {
        let mut sim = SerialSim::new();
        sim.push_response(&[1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(sim.read_available(&mut buf).unwrap(), 3);
        assert_eq!(sim.read_available(&mut buf).unwrap(), 0);
    }
}
