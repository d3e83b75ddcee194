//! In-process transport: the host end talks to a [`DeviceEnd`] through
//! channels instead of a serial port. Used to run against the device emulator.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{closed_error, deadline_passed, Closer, Transport, TransportError, POLL_INTERVAL};
use crate::protocol::PacketReader;

/// Create a connected host/device pair
pub fn pipe() -> (LoopbackTransport, DeviceEnd) {
    let (host_tx, device_rx) = crossbeam_channel::unbounded();
    let (device_tx, host_rx) = crossbeam_channel::unbounded();
    let closer = Closer::new();

    let transport = LoopbackTransport {
        tx: host_tx,
        reader: Some(LoopbackReader {
            chunks: Chunks::new(host_rx),
            closer: closer.clone(),
            deadline: None,
        }),
        closer,
    };
    let device = DeviceEnd {
        reader: DeviceReader {
            chunks: Chunks::new(device_rx),
        },
        writer: DeviceWriter { tx: device_tx },
    };
    (transport, device)
}

/// Host side of a [`pipe`]
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    reader: Option<LoopbackReader>,
    closer: Closer,
}

impl Transport for LoopbackTransport {
    type Reader = LoopbackReader;

    fn take_reader(&mut self) -> Result<LoopbackReader, TransportError> {
        self.reader.take().ok_or(TransportError::ReaderTaken)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TransportError::WriteFailed(ErrorKind::BrokenPipe.into()))
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

/// Read half of a [`LoopbackTransport`]
pub struct LoopbackReader {
    chunks: Chunks,
    closer: Closer,
    deadline: Option<Instant>,
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closer.is_closed() {
                return Err(closed_error());
            }
            if let Some(n) = self.chunks.copy_pending(buf) {
                return Ok(n);
            }
            match self.chunks.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => self.chunks.refill(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    if deadline_passed(self.deadline) {
                        return Err(ErrorKind::TimedOut.into());
                    }
                }
                // Device end dropped: nothing more will ever arrive
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }
}

impl PacketReader for LoopbackReader {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.deadline = timeout.map(|t| Instant::now() + t);
        Ok(())
    }
}

/// Device side of a [`pipe`]. Reads block until the host writes; a dropped
/// host reads as end of stream.
pub struct DeviceEnd {
    reader: DeviceReader,
    writer: DeviceWriter,
}

impl DeviceEnd {
    pub fn split(self) -> (DeviceReader, DeviceWriter) {
        (self.reader, self.writer)
    }
}

impl Read for DeviceEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for DeviceEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub struct DeviceReader {
    chunks: Chunks,
}

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(n) = self.chunks.copy_pending(buf) {
                return Ok(n);
            }
            match self.chunks.rx.recv() {
                Ok(chunk) => self.chunks.refill(chunk),
                Err(_) => return Ok(0),
            }
        }
    }
}

/// Write half of a [`DeviceEnd`]. Like a serial line nobody listens to,
/// bytes written after the host went away are discarded.
pub struct DeviceWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for DeviceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Byte stream reassembled from channel messages
struct Chunks {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Chunks {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Chunks {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }

    fn copy_pending(&mut self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        let rest = &self.pending[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Some(n)
    }

    fn refill(&mut self, chunk: Vec<u8>) {
        self.pending = chunk;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_cross_in_order() {
        let (mut host, mut device) = pipe();
        let mut reader = host.take_reader().unwrap();

        host.send(&[1, 2, 3]).unwrap();
        host.send(&[4]).unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        device.write_all(&[9, 8]).unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9, 8]);
    }

    #[test]
    fn test_reader_taken_once() {
        let (mut host, _device) = pipe();
        assert!(host.take_reader().is_ok());
        assert!(matches!(host.take_reader(), Err(TransportError::ReaderTaken)));
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (mut host, _device) = pipe();
        let mut reader = host.take_reader().unwrap();
        let closer = host.closer();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        closer.close();

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_read_timeout_expires() {
        let (mut host, _device) = pipe();
        let mut reader = host.take_reader().unwrap();
        reader.set_read_timeout(Some(Duration::from_millis(10))).unwrap();

        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_dropped_peers_read_as_eof() {
        let (mut host, device) = pipe();
        let mut reader = host.take_reader().unwrap();
        drop(device);

        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(host.send(&[1]).is_err());
    }
}
