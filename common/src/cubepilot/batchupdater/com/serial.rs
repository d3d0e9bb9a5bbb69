use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::{com::SerialLink, Error, Result};

// Serial Port Link -------------------------------------------------------------------------------

/// Short read timeout so protocol loops can poll quickly
pub const RX_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `open` keeps retrying while the OS re-enumerates the device
const OPEN_RETRY_WINDOW: Duration = Duration::from_millis(200);

///
/// Serial link backed by a real host serial port.
///
/// Re-opening after a close is part of the normal bootloader dance (the
/// board drops off the bus while it reboots), so `open` retries for a
/// short window instead of failing on the first attempt.
///
pub struct SerialPortLink {
    port_name: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    pub fn new(port_name: &str, baud: u32) -> Self {
        SerialPortLink {
            port_name: port_name.to_owned(),
            baud,
            timeout: RX_TIMEOUT,
            port: None,
        }
    }

    pub fn with_timeout(port_name: &str, baud: u32, timeout: Duration) -> Self {
        SerialPortLink {
            port_name: port_name.to_owned(),
            baud,
            timeout,
            port: None,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "serial port not open",
            ))
        })
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let deadline = Instant::now() + OPEN_RETRY_WINDOW;
        loop {
            match serialport::new(&self.port_name, self.baud)
                .timeout(self.timeout)
                .open()
            {
                Ok(port) => {
                    self.port = Some(port);
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Serial(e));
                    }
                    // wait for the port to be ready
                    std::thread::sleep(Duration::from_millis(40));
                }
            }
        }
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port_mut()?.write_all(data)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        match self.port_mut()?.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::ProtocolTimeout(wanted))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::ProtocolTimeout(wanted))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port_mut()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port_mut()?.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port_mut()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(Error::Serial)
    }

    fn flush(&mut self) -> Result<()> {
        self.port_mut()?.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}
