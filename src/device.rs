//! Software stand-in for the LED controller.
//!
//! Speaks the device side of the protocol: applies incoming packets to an
//! in-memory strip and acknowledges each one. Lets the daemon run end to end
//! without hardware (`--emulate`).

use std::io::{Read, Write};

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use crate::pixel::{PixelBuffer, Rgb};
use crate::pixel_format::ChannelOrder;
use crate::protocol::{
    decode_incoming, write_outgoing, CodecError, IncomingPacket, OutgoingPacket, ReadContext,
};

pub struct Device<R, W> {
    reader: R,
    writer: W,
    ctx: ReadContext,
    strip: PixelBuffer,
    order: ChannelOrder,
    frames: Option<Sender<Vec<Rgb>>>,
}

impl<R: Read, W: Write> Device<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Device {
            reader,
            writer,
            ctx: ReadContext::new(),
            strip: PixelBuffer::new(0),
            order: ChannelOrder::Rgb,
            frames: None,
        }
    }

    /// Channel order the host serializes pixels in
    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    /// Forward a copy of the strip after every applied `Set` or `Clear`
    pub fn with_frame_sink(mut self, frames: Sender<Vec<Rgb>>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Serve packets until the host goes away.
    ///
    /// A corrupt or unknown packet leaves the stream unsynchronized, so the
    /// device panics: it reports the error as a `Panic` line and stops.
    pub fn run(mut self) -> Result<(), CodecError> {
        loop {
            let packet = match decode_incoming(&mut self.reader, &mut self.ctx) {
                Ok(packet) => packet,
                Err(CodecError::EndOfStream) => {
                    debug!("emulator: host closed the stream");
                    return Ok(());
                }
                Err(e) => {
                    warn!("emulator: {}", e);
                    self.send(&OutgoingPacket::Panic {
                        message: e.to_string(),
                    })?;
                    return Err(e);
                }
            };

            let ptype = packet.packet_type();
            trace!("emulator: received {} packet", ptype);

            let reply = match packet {
                IncomingPacket::Initialize { num_leds } if num_leds < 1 => {
                    OutgoingPacket::Error {
                        message: format!("invalid number of LEDs: {}", num_leds),
                    }
                }
                IncomingPacket::Initialize { num_leds } => {
                    self.ctx.resize(num_leds);
                    self.strip = PixelBuffer::new(self.ctx.num_leds());
                    debug!("emulator: strip is {} LEDs", self.strip.len());
                    OutgoingPacket::Ack { acknowledged: ptype }
                }
                IncomingPacket::Clear => {
                    self.strip.clear();
                    self.publish();
                    OutgoingPacket::Ack { acknowledged: ptype }
                }
                IncomingPacket::Set { pixels } => {
                    self.strip.load_channels(self.order, pixels);
                    self.publish();
                    OutgoingPacket::Ack { acknowledged: ptype }
                }
            };
            self.send(&reply)?;
        }
    }

    fn publish(&self) {
        if let Some(frames) = &self.frames {
            let _ = frames.send(self.strip.as_slice().to_vec());
        }
    }

    fn send(&mut self, packet: &OutgoingPacket) -> Result<(), CodecError> {
        write_outgoing(&mut self.writer, packet)?;
        self.writer.flush()?;
        Ok(())
    }
}
