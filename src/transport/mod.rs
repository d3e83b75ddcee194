//! Byte transports between the daemon and the controller.
//!
//! A transport hands out one read half for the reader task and keeps the
//! write half for the scheduler. Reads block until data arrives; closing the
//! transport through its [`Closer`] makes a blocked read fail within
//! [`POLL_INTERVAL`].

pub mod loopback;
pub mod serial;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::PacketReader;

pub use loopback::{pipe, DeviceEnd, LoopbackTransport};
pub use serial::SerialTransport;

/// How often a blocked read checks whether the transport was closed
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("read half already taken")]
    ReaderTaken,

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// One connection to the controller
pub trait Transport: Send {
    type Reader: PacketReader + Send;

    /// Take the read half. Only the first call succeeds.
    fn take_reader(&mut self) -> Result<Self::Reader, TransportError>;

    /// Write a whole frame and wait until it has left the host
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    fn closer(&self) -> Closer;
}

/// Idempotent close handle shared between a transport and its read half
#[derive(Debug, Clone, Default)]
pub struct Closer {
    closed: Arc<AtomicBool>,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed")
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
