//! Serial protocol between the daemon (host) and the LED controller (device).
//!
//! Every frame is `[type: u8][payload][crc32: u32 LE]` where the CRC-32/IEEE
//! covers the type byte and the payload. Multi-byte integers are little-endian.
//!
//! Host to device ("incoming", from the device's point of view):
//!
//! | tag | packet       | payload              |
//! |-----|--------------|----------------------|
//! | 0   | `Initialize` | `u16` LED count      |
//! | 1   | `Clear`      | none                 |
//! | 2   | `Set`        | `3 * N` pixel bytes  |
//!
//! Device to host ("outgoing"):
//!
//! | tag          | packet  | payload                  |
//! |--------------|---------|--------------------------|
//! | 0            | `Error` | `u16` length + UTF-8     |
//! | 1            | `Log`   | `u16` length + UTF-8     |
//! | 2            | `Ack`   | `u8` incoming packet tag |
//! | `'p'` (0x70) | `Panic` | text up to `\n`, no CRC  |
//!
//! A panicking device just prints `panic: <message>\r\n`, so the panic tag is
//! the first letter of that line.

mod codec;

use std::fmt;
use std::io::{self, Cursor};
use std::time::Duration;

use thiserror::Error;

pub use codec::{
    decode_incoming, decode_outgoing, encode_incoming, encode_incoming_into, encode_outgoing,
    encode_outgoing_into, write_outgoing,
};

use crate::pixel::BYTES_PER_LED;

/// Type tag of a host-to-device packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IncomingPacketType {
    Initialize = 0,
    Clear = 1,
    Set = 2,
}

impl TryFrom<u8> for IncomingPacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        match tag {
            0 => Ok(IncomingPacketType::Initialize),
            1 => Ok(IncomingPacketType::Clear),
            2 => Ok(IncomingPacketType::Set),
            other => Err(other),
        }
    }
}

impl fmt::Display for IncomingPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IncomingPacketType::Initialize => "initialize",
            IncomingPacketType::Clear => "clear",
            IncomingPacketType::Set => "set",
        })
    }
}

/// Host-to-device packet. `Set` borrows its pixel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingPacket<'a> {
    /// Declares the strip length; must precede any `Set`
    Initialize { num_leds: u16 },
    /// Turn every pixel off
    Clear,
    /// Full frame, `3 * num_leds` bytes
    Set { pixels: &'a [u8] },
}

impl IncomingPacket<'_> {
    pub fn packet_type(&self) -> IncomingPacketType {
        match self {
            IncomingPacket::Initialize { .. } => IncomingPacketType::Initialize,
            IncomingPacket::Clear => IncomingPacketType::Clear,
            IncomingPacket::Set { .. } => IncomingPacketType::Set,
        }
    }
}

/// Type tag of a device-to-host packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OutgoingPacketType {
    Error = 0,
    Log = 1,
    Ack = 2,
    Panic = b'p',
}

impl TryFrom<u8> for OutgoingPacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        match tag {
            0 => Ok(OutgoingPacketType::Error),
            1 => Ok(OutgoingPacketType::Log),
            2 => Ok(OutgoingPacketType::Ack),
            b'p' => Ok(OutgoingPacketType::Panic),
            other => Err(other),
        }
    }
}

impl fmt::Display for OutgoingPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutgoingPacketType::Error => "error",
            OutgoingPacketType::Log => "log",
            OutgoingPacketType::Ack => "ack",
            OutgoingPacketType::Panic => "panic",
        })
    }
}

/// Device-to-host packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPacket {
    /// Recoverable fault on the device
    Error { message: String },
    /// Informational message
    Log { message: String },
    /// The device finished applying an incoming packet
    Ack { acknowledged: IncomingPacketType },
    /// The device cannot continue
    Panic { message: String },
}

impl OutgoingPacket {
    pub fn packet_type(&self) -> OutgoingPacketType {
        match self {
            OutgoingPacket::Error { .. } => OutgoingPacketType::Error,
            OutgoingPacket::Log { .. } => OutgoingPacketType::Log,
            OutgoingPacket::Ack { .. } => OutgoingPacketType::Ack,
            OutgoingPacket::Panic { .. } => OutgoingPacketType::Panic,
        }
    }
}

/// State needed to decode incoming packets: the pixel buffer `Set` is read
/// into. Its length must be `3 * num_leds` of the last `Initialize`.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    led_buffer: Vec<u8>,
}

impl ReadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize the pixel buffer after an `Initialize`
    pub fn resize(&mut self, num_leds: u16) {
        self.led_buffer.resize(num_leds as usize * BYTES_PER_LED, 0);
    }

    pub fn num_leds(&self) -> usize {
        self.led_buffer.len() / BYTES_PER_LED
    }
}

/// Byte source for the outgoing-packet decoder.
///
/// Reads normally block until data arrives. Panic lines are read under a
/// temporary timeout because a panicking device may never finish its line.
pub trait PacketReader: io::Read {
    /// Bound subsequent reads by `timeout`; `None` restores blocking reads
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl PacketReader for &[u8] {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl<T: AsRef<[u8]>> PacketReader for Cursor<T> {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl<R: PacketReader + ?Sized> PacketReader for &mut R {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }
}

/// Errors from encoding or decoding frames
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("checksum mismatch: frame carries {received:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { received: u32, computed: u32 },

    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("ack for unknown packet type: {0:#04x}")]
    UnknownAckType(u8),

    #[error("set packet received before initialize")]
    NotInitialized,

    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),

    #[error("panic message must not contain line breaks")]
    InvalidPanicMessage,

    /// The stream ended before a packet started
    #[error("end of stream")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the read loop may simply try again
    pub fn is_transient(&self) -> bool {
        matches!(self, CodecError::EndOfStream)
    }
}
