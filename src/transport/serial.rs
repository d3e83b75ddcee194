use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, warn};

use super::{closed_error, deadline_passed, Closer, Transport, TransportError, POLL_INTERVAL};
use crate::protocol::PacketReader;

/// Upper bound for a single blocking write
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Time the controller gets to come up after the port opens
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Serial connection to the controller
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    reader_taken: bool,
    closer: Closer,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`, 8N1 without flow control
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let mut port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })?;

        // Boards that reset on DTR need it asserted before they talk
        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!("failed to set DTR on {}: {}", path, e);
        }

        thread::sleep(SETTLE_DELAY);

        debug!("opened {} at {} baud", path, baud_rate);

        Ok(SerialTransport {
            port,
            reader_taken: false,
            closer: Closer::new(),
        })
    }
}

impl Transport for SerialTransport {
    type Reader = SerialReader;

    fn take_reader(&mut self) -> Result<SerialReader, TransportError> {
        if self.reader_taken {
            return Err(TransportError::ReaderTaken);
        }
        let mut port = self.port.try_clone()?;
        // Short slices so a blocked read notices close()
        port.set_timeout(POLL_INTERVAL)?;
        self.reader_taken = true;

        Ok(SerialReader {
            port,
            closer: self.closer.clone(),
            deadline: None,
        })
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(frame).map_err(TransportError::WriteFailed)?;
        // Drain: block until the bytes are out of the host
        self.port.flush().map_err(TransportError::WriteFailed)
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

/// Read half of a [`SerialTransport`]. Blocks until data arrives or the
/// transport is closed.
pub struct SerialReader {
    port: Box<dyn SerialPort>,
    closer: Closer,
    deadline: Option<Instant>,
}

impl Read for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closer.is_closed() {
                return Err(closed_error());
            }
            match self.port.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                    if deadline_passed(self.deadline) {
                        return Err(ErrorKind::TimedOut.into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl PacketReader for SerialReader {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.deadline = timeout.map(|t| Instant::now() + t);
        Ok(())
    }
}
