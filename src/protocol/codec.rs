use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use crc32fast::Hasher;
use tracing::debug;

use super::{
    CodecError, IncomingPacket, IncomingPacketType, OutgoingPacket, OutgoingPacketType,
    PacketReader, ReadContext,
};

/// How long the rest of a panic line may take to arrive
pub const PANIC_LINE_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest panic line accepted, excluding the tag byte
pub const MAX_PANIC_LINE: usize = 512;

const CHECKSUM_LEN: usize = 4;
const PANIC_PREFIX: &str = "panic: ";

/// Encode a host-to-device packet into `out`, replacing its contents
pub fn encode_incoming_into(packet: &IncomingPacket<'_>, out: &mut Vec<u8>) {
    out.clear();
    out.push(packet.packet_type() as u8);

    match packet {
        IncomingPacket::Initialize { num_leds } => out.extend_from_slice(&num_leds.to_le_bytes()),
        IncomingPacket::Clear => {}
        IncomingPacket::Set { pixels } => {
            out.reserve(pixels.len() + CHECKSUM_LEN);
            out.extend_from_slice(pixels);
        }
    }

    append_checksum(out);
}

/// Encode a host-to-device packet into a new buffer
pub fn encode_incoming(packet: &IncomingPacket<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    encode_incoming_into(packet, &mut out);
    out
}

/// Decode one host-to-device packet.
///
/// `Set` pixels are read into the context's buffer and the returned packet
/// borrows them, so decoding a frame does not allocate.
pub fn decode_incoming<'c, R: Read + ?Sized>(
    reader: &mut R,
    ctx: &'c mut ReadContext,
) -> Result<IncomingPacket<'c>, CodecError> {
    let tag = read_tag(reader)?;
    let ptype = IncomingPacketType::try_from(tag).map_err(CodecError::UnknownPacketType)?;
    let mut r = Checksummed::new(reader, tag);

    match ptype {
        IncomingPacketType::Initialize => {
            let num_leds = read_u16(&mut r)?;
            r.verify()?;
            Ok(IncomingPacket::Initialize { num_leds })
        }
        IncomingPacketType::Clear => {
            r.verify()?;
            Ok(IncomingPacket::Clear)
        }
        IncomingPacketType::Set => {
            if ctx.led_buffer.is_empty() {
                return Err(CodecError::NotInitialized);
            }
            r.read_exact(&mut ctx.led_buffer)?;
            r.verify()?;
            Ok(IncomingPacket::Set {
                pixels: &ctx.led_buffer,
            })
        }
    }
}

/// Encode a device-to-host packet into `out`, replacing its contents
pub fn encode_outgoing_into(packet: &OutgoingPacket, out: &mut Vec<u8>) -> Result<(), CodecError> {
    out.clear();

    match packet {
        OutgoingPacket::Panic { message } => {
            if message.contains(['\r', '\n']) {
                return Err(CodecError::InvalidPanicMessage);
            }
            // No checksum: this is what a crashing device prints
            out.extend_from_slice(PANIC_PREFIX.as_bytes());
            out.extend_from_slice(message.as_bytes());
            out.extend_from_slice(b"\r\n");
            return Ok(());
        }
        OutgoingPacket::Error { message } | OutgoingPacket::Log { message } => {
            let len = u16::try_from(message.len())
                .map_err(|_| CodecError::MessageTooLong(message.len()))?;
            out.push(packet.packet_type() as u8);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(message.as_bytes());
        }
        OutgoingPacket::Ack { acknowledged } => {
            out.push(OutgoingPacketType::Ack as u8);
            out.push(*acknowledged as u8);
        }
    }

    append_checksum(out);
    Ok(())
}

/// Encode a device-to-host packet into a new buffer
pub fn encode_outgoing(packet: &OutgoingPacket) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_outgoing_into(packet, &mut out)?;
    Ok(out)
}

pub fn write_outgoing<W: Write + ?Sized>(w: &mut W, packet: &OutgoingPacket) -> Result<(), CodecError> {
    w.write_all(&encode_outgoing(packet)?)?;
    Ok(())
}

/// Decode one device-to-host packet.
///
/// A panic line that never completes still yields a `Panic` with an empty
/// message: the device is gone either way and the caller must not hang on it.
pub fn decode_outgoing<R: PacketReader + ?Sized>(
    reader: &mut R,
) -> Result<OutgoingPacket, CodecError> {
    let tag = read_tag(reader)?;
    let ptype = OutgoingPacketType::try_from(tag).map_err(CodecError::UnknownPacketType)?;

    match ptype {
        OutgoingPacketType::Panic => Ok(read_panic(reader)),
        OutgoingPacketType::Error => {
            let mut r = Checksummed::new(reader, tag);
            let message = read_message(&mut r)?;
            r.verify()?;
            Ok(OutgoingPacket::Error { message })
        }
        OutgoingPacketType::Log => {
            let mut r = Checksummed::new(reader, tag);
            let message = read_message(&mut r)?;
            r.verify()?;
            Ok(OutgoingPacket::Log { message })
        }
        OutgoingPacketType::Ack => {
            let mut r = Checksummed::new(reader, tag);
            let mut raw = [0u8; 1];
            r.read_exact(&mut raw)?;
            r.verify()?;
            let acknowledged =
                IncomingPacketType::try_from(raw[0]).map_err(CodecError::UnknownAckType)?;
            Ok(OutgoingPacket::Ack { acknowledged })
        }
    }
}

fn append_checksum(out: &mut Vec<u8>) {
    let crc = crc32fast::hash(out);
    out.extend_from_slice(&crc.to_le_bytes());
}

/// Read the type byte. A stream that ends here ended between packets.
fn read_tag<R: Read + ?Sized>(reader: &mut R) -> Result<u8, CodecError> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Err(CodecError::EndOfStream),
            Ok(_) => return Ok(tag[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_u16<R: Read + ?Sized>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_message<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    let len = read_u16(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_panic<R: PacketReader + ?Sized>(reader: &mut R) -> OutgoingPacket {
    if let Err(e) = reader.set_read_timeout(Some(PANIC_LINE_TIMEOUT)) {
        debug!("failed to bound panic line read: {}", e);
    }
    let line = read_line(reader);
    if let Err(e) = reader.set_read_timeout(None) {
        debug!("failed to restore blocking reads: {}", e);
    }

    let message = match line {
        Some(rest) => panic_message(&rest),
        None => String::new(),
    };
    OutgoingPacket::Panic { message }
}

/// Read up to and excluding `\n`. `None` if the line never completes.
fn read_line<R: Read + ?Sized>(reader: &mut R) -> Option<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return None,
            Ok(_) if byte[0] == b'\n' => return Some(line),
            Ok(_) if line.len() >= MAX_PANIC_LINE => return None,
            Ok(_) => line.push(byte[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return None,
        }
    }
}

/// `rest` is the panic line after its leading `p`
fn panic_message(rest: &[u8]) -> String {
    let text = String::from_utf8_lossy(rest);
    let text = text.trim_end_matches('\r');
    match text.strip_prefix(&PANIC_PREFIX[1..]) {
        Some(message) => message.to_string(),
        None => format!("p{}", text),
    }
}

/// Reader that feeds every byte it yields into a running CRC
struct Checksummed<'r, R: ?Sized> {
    inner: &'r mut R,
    hasher: Hasher,
}

impl<'r, R: Read + ?Sized> Checksummed<'r, R> {
    fn new(inner: &'r mut R, tag: u8) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&[tag]);
        Checksummed { inner, hasher }
    }

    /// Read the trailing checksum and compare it with what was hashed so far
    fn verify(self) -> Result<(), CodecError> {
        let computed = self.hasher.finalize();
        let mut buf = [0u8; CHECKSUM_LEN];
        self.inner.read_exact(&mut buf)?;
        let received = u32::from_le_bytes(buf);
        if received != computed {
            return Err(CodecError::ChecksumMismatch { received, computed });
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> Read for Checksummed<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
