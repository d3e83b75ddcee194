//! Frame scheduler.
//!
//! A run owns three tasks on scoped threads:
//!
//! * the scheduler, which initializes the controller and then composites and
//!   sends a frame per tick, on refresh requests and as acknowledgements
//!   arrive,
//! * the reader, which decodes controller packets and hands them over one at
//!   a time,
//! * the canceller, which closes the transport once the caller cancels or
//!   either of the other tasks stops.
//!
//! With ack pacing at most one `Set` frame is in flight: ticks that arrive
//! while the controller still owes an acknowledgement are skipped, the same
//! way a full frame slot drops stale frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::animation::{
    build_animators, check_supported, refresh_slot, RefreshHandle, RefreshQueuer, TrackedAnimator,
};
use crate::cancel::CancelToken;
use crate::config::{Config, ConfigError, Pacing};
use crate::pixel::PixelBuffer;
use crate::pixel_format::ChannelOrder;
use crate::protocol::{
    decode_outgoing, encode_incoming_into, CodecError, IncomingPacket, IncomingPacketType,
    OutgoingPacket, PacketReader,
};
use crate::transport::{SerialTransport, Transport, TransportError};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Pause after a read that hit end of stream before trying again
const EOF_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to read from controller: {0}")]
    Codec(#[from] CodecError),

    #[error("controller panicked: {0}")]
    DevicePanicked(String),

    #[error("failed to send initialize packet: {0}")]
    InitializeFailed(#[source] TransportError),

    #[error("controller rejected initialize packet: {0}")]
    InitializeRejected(String),

    #[error("controller did not acknowledge initialize packet within {0:?}")]
    InitializeTimeout(Duration),
}

/// Running counters, shared with whoever holds the daemon
#[derive(Debug, Default)]
struct Stats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_acked: AtomicU64,
    ack_timeouts: AtomicU64,
    ticks_suppressed: AtomicU64,
    packets_received: AtomicU64,
    device_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// `Set` frames written to the transport
    pub frames_sent: u64,
    /// Frames whose write failed
    pub frames_dropped: u64,
    /// Acknowledgements received for `Set` frames
    pub frames_acked: u64,
    pub ack_timeouts: u64,
    /// Ticks skipped because a frame was still unacknowledged
    pub ticks_suppressed: u64,
    pub packets_received: u64,
    pub device_errors: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_acked: self.frames_acked.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            ticks_suppressed: self.ticks_suppressed.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct Daemon {
    config: Config,
    refresh: RefreshHandle,
    refresh_rx: Receiver<()>,
    stats: Arc<Stats>,
}

/// Per-run scheduler state
struct Session {
    strip: PixelBuffer,
    order: ChannelOrder,
    pacing: Pacing,
    ack_timeout: Option<Duration>,
    awaiting_ack: bool,
    ack_deadline: Receiver<Instant>,
    /// Serialized strip, reused between frames
    pixels: Vec<u8>,
    /// Encoded packet, reused between frames
    frame: Vec<u8>,
}

impl Session {
    /// Whether a new frame may go out right now
    fn ready(&self) -> bool {
        self.pacing == Pacing::Timer || !self.awaiting_ack
    }

    fn acked(&mut self) {
        self.awaiting_ack = false;
        self.ack_deadline = never();
    }
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        check_supported(&config.leds)?;
        let (refresh, refresh_rx) = refresh_slot();
        Ok(Daemon {
            config,
            refresh,
            refresh_rx,
            stats: Arc::new(Stats::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Open the configured serial port and run until cancelled or a fatal
    /// error occurs
    pub fn run(&self, cancel: &CancelToken) -> Result<(), DaemonError> {
        info!(
            "opening {} at {} baud",
            self.config.device, self.config.baud_rate
        );
        let transport = SerialTransport::open(&self.config.device, self.config.baud_rate)?;
        self.run_with(transport, cancel)
    }

    /// Run over an already open transport.
    ///
    /// Returns `Ok(())` when `cancel` ends the run. Otherwise the first fatal
    /// error from either task is returned once every task has stopped.
    pub fn run_with<T: Transport>(&self, mut transport: T, cancel: &CancelToken) -> Result<(), DaemonError> {
        let animators = build_animators(&self.config.leds, &self.refresh)?;
        let reader = transport.take_reader()?;
        let closer = transport.closer();

        let group = CancelToken::new();
        let failure: Mutex<Option<DaemonError>> = Mutex::new(None);
        let (packets_tx, packets_rx) = crossbeam_channel::bounded(0);

        {
            let group = &group;
            let failure = &failure;
            let fail = move |err: DaemonError| {
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                group.cancel();
            };

            thread::scope(|s| {
                s.spawn(move || {
                    select! {
                        recv(cancel.done()) -> _ => {},
                        recv(group.done()) -> _ => {},
                    }
                    group.cancel();
                    if closer.close() {
                        debug!("transport closed");
                    }
                });

                s.spawn(move || {
                    if let Err(e) = read_packets(reader, &packets_tx, group) {
                        fail(e);
                    }
                });

                s.spawn(move || {
                    if let Err(e) = self.schedule(transport, animators, &packets_rx, group, cancel) {
                        fail(e);
                    }
                    group.cancel();
                });
            });
        }

        match failure.into_inner() {
            Some(e) => {
                error!("daemon stopped: {}", e);
                Err(e)
            }
            None => {
                info!("daemon stopped");
                Ok(())
            }
        }
    }

    fn schedule<T: Transport>(
        &self,
        mut transport: T,
        mut animators: Vec<TrackedAnimator>,
        packets: &Receiver<OutgoingPacket>,
        group: &CancelToken,
        cancel: &CancelToken,
    ) -> Result<(), DaemonError> {
        let num_leds = self.config.num_leds();
        let num_leds = u16::try_from(num_leds).map_err(|_| ConfigError::TooManyLeds {
            count: num_leds,
            max: u16::MAX as usize,
        })?;

        let mut session = Session {
            strip: PixelBuffer::new(num_leds as usize),
            order: self.config.pixel_format,
            pacing: self.config.pacing,
            ack_timeout: self.config.ack_timeout(),
            awaiting_ack: false,
            ack_deadline: never(),
            pixels: Vec::new(),
            frame: Vec::new(),
        };

        if !self.initialize(&mut transport, &mut session, num_leds, packets, group)? {
            return Ok(());
        }
        info!(
            "controller ready: {} LEDs at {} fps, {:?} pacing",
            num_leds, self.config.rate, session.pacing
        );

        let ticker = tick(self.config.refresh_interval());
        let stats_ticker = tick(STATS_INTERVAL);
        let idle = never::<()>();
        let mut last_stats = (Instant::now(), self.stats.snapshot());

        loop {
            // A refresh request stays queued while a frame is in flight
            let refresh = if session.ready() { &self.refresh_rx } else { &idle };
            let ack_deadline = session.ack_deadline.clone();

            select! {
                recv(group.done()) -> _ => break,
                recv(packets) -> msg => match msg {
                    Ok(packet) => self.handle_packet(&mut session, packet)?,
                    // Reader stopped
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if session.ready() {
                        self.send_frame(&mut transport, &mut session, &mut animators);
                    } else {
                        bump(&self.stats.ticks_suppressed);
                        trace!("tick suppressed, frame still unacknowledged");
                    }
                },
                recv(refresh) -> _ => {
                    trace!("refresh requested");
                    self.send_frame(&mut transport, &mut session, &mut animators);
                },
                recv(ack_deadline) -> _ => {
                    bump(&self.stats.ack_timeouts);
                    warn!(
                        "frame not acknowledged within {:?}, resuming",
                        session.ack_timeout.unwrap_or_default()
                    );
                    session.acked();
                },
                recv(stats_ticker) -> _ => {
                    last_stats = self.log_stats(last_stats);
                },
            }
        }

        if self.config.clear_on_exit && cancel.is_cancelled() {
            debug!("clearing LEDs");
            encode_incoming_into(&IncomingPacket::Clear, &mut session.frame);
            if let Err(e) = transport.send(&session.frame) {
                warn!("failed to clear LEDs: {}", e);
            }
        }
        Ok(())
    }

    /// Send the initialize packet and wait for the controller to accept it.
    /// Returns `false` if the run was cancelled first.
    fn initialize<T: Transport>(
        &self,
        transport: &mut T,
        session: &mut Session,
        num_leds: u16,
        packets: &Receiver<OutgoingPacket>,
        group: &CancelToken,
    ) -> Result<bool, DaemonError> {
        debug!("initializing controller with {} LEDs", num_leds);
        encode_incoming_into(&IncomingPacket::Initialize { num_leds }, &mut session.frame);
        transport
            .send(&session.frame)
            .map_err(DaemonError::InitializeFailed)?;

        let timeout = self.config.init_timeout();
        let deadline = after(timeout);
        loop {
            select! {
                recv(group.done()) -> _ => return Ok(false),
                recv(deadline) -> _ => return Err(DaemonError::InitializeTimeout(timeout)),
                recv(packets) -> msg => {
                    let Ok(packet) = msg else {
                        return Ok(false);
                    };
                    bump(&self.stats.packets_received);
                    match packet {
                        OutgoingPacket::Ack { acknowledged: IncomingPacketType::Initialize } => {
                            return Ok(true);
                        }
                        OutgoingPacket::Ack { acknowledged } => {
                            debug!("ignoring {} ack while initializing", acknowledged);
                        }
                        OutgoingPacket::Log { message } => info!("controller: {}", message),
                        OutgoingPacket::Error { message } => {
                            bump(&self.stats.device_errors);
                            return Err(DaemonError::InitializeRejected(message));
                        }
                        OutgoingPacket::Panic { message } => {
                            return Err(DaemonError::DevicePanicked(message));
                        }
                    }
                },
            }
        }
    }

    fn handle_packet(&self, session: &mut Session, packet: OutgoingPacket) -> Result<(), DaemonError> {
        bump(&self.stats.packets_received);
        match packet {
            OutgoingPacket::Ack {
                acknowledged: IncomingPacketType::Set,
            } => {
                bump(&self.stats.frames_acked);
                session.acked();
            }
            OutgoingPacket::Ack { acknowledged } => {
                debug!("controller acknowledged {} packet", acknowledged);
            }
            OutgoingPacket::Log { message } => info!("controller: {}", message),
            OutgoingPacket::Error { message } => {
                bump(&self.stats.device_errors);
                warn!("controller reported an error: {}", message);
            }
            OutgoingPacket::Panic { message } => {
                return Err(DaemonError::DevicePanicked(message));
            }
        }
        Ok(())
    }

    /// Composite every animator into the strip and send it as one `Set` frame.
    /// A failed write drops the frame; the next tick tries again.
    fn send_frame<T: Transport>(
        &self,
        transport: &mut T,
        session: &mut Session,
        animators: &mut [TrackedAnimator],
    ) {
        for tracked in animators.iter_mut() {
            if let Some(view) = session.strip.view_mut(tracked.range.clone()) {
                tracked.animator.draw(view);
            }
        }
        session.strip.write_channels(session.order, &mut session.pixels);
        encode_incoming_into(
            &IncomingPacket::Set {
                pixels: &session.pixels,
            },
            &mut session.frame,
        );

        if tracing::enabled!(tracing::Level::TRACE) {
            let hex: String = session
                .frame
                .iter()
                .take(30)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            trace!("sending {} byte frame: {}", session.frame.len(), hex);
        }

        match transport.send(&session.frame) {
            Ok(()) => {
                bump(&self.stats.frames_sent);
                session.awaiting_ack = true;
                if session.pacing == Pacing::Ack {
                    session.ack_deadline = session.ack_timeout.map(after).unwrap_or_else(never);
                }
            }
            Err(e) => {
                bump(&self.stats.frames_dropped);
                warn!("dropped frame: {}", e);
            }
        }
    }

    fn log_stats(&self, (since, last): (Instant, StatsSnapshot)) -> (Instant, StatsSnapshot) {
        let now = Instant::now();
        let current = self.stats.snapshot();
        let elapsed = now.duration_since(since).as_secs_f64();
        if elapsed > 0.0 {
            let fps = (current.frames_sent - last.frames_sent) as f64 / elapsed;
            debug!(
                "[stats] {:.1} fps, {} acked, {} dropped, {} suppressed, {} ack timeouts",
                fps,
                current.frames_acked - last.frames_acked,
                current.frames_dropped - last.frames_dropped,
                current.ticks_suppressed - last.ticks_suppressed,
                current.ack_timeouts - last.ack_timeouts,
            );
        }
        (now, current)
    }
}

impl RefreshQueuer for Daemon {
    fn queue_refresh(&self) {
        self.refresh.queue_refresh();
    }
}

/// Decode controller packets and pass them to the scheduler until the run is
/// cancelled. Any decode error other than end of stream is fatal: the stream
/// can no longer be trusted to be in sync.
fn read_packets<R: PacketReader>(
    mut reader: R,
    packets: &Sender<OutgoingPacket>,
    group: &CancelToken,
) -> Result<(), DaemonError> {
    while !group.is_cancelled() {
        let packet = match decode_outgoing(&mut reader) {
            Ok(packet) => packet,
            Err(_) if group.is_cancelled() => break,
            Err(e) if e.is_transient() => {
                thread::sleep(EOF_BACKOFF);
                continue;
            }
            Err(e) => {
                if let CodecError::ChecksumMismatch { .. } = e {
                    error!("controller stream out of sync: {}", e);
                }
                return Err(e.into());
            }
        };

        // Whatever follows a panic line is crash output, not packets
        let terminal = if let OutgoingPacket::Panic { message } = &packet {
            error!("controller panicked: {}", message);
            true
        } else {
            false
        };
        trace!("received {} packet", packet.packet_type());

        select! {
            send(packets, packet) -> res => {
                if res.is_err() || terminal {
                    break;
                }
            },
            recv(group.done()) -> _ => break,
        }
    }
    debug!("reader stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedConfig;
    use crate::device::Device;
    use crate::pixel::Rgb;
    use crate::protocol::{decode_incoming, encode_outgoing, write_outgoing, ReadContext};
    use crate::transport::loopback::LoopbackReader;
    use crate::transport::{pipe, DeviceEnd, LoopbackTransport};
    use std::io::Write;
    use std::thread::JoinHandle;

    const RED: Rgb = Rgb::new(255, 0, 0);
    const BLUE: Rgb = Rgb::new(0, 0, 255);

    fn test_config(rate: u32) -> Config {
        Config {
            device: "loopback".into(),
            baud_rate: 115200,
            rate,
            pacing: Pacing::Ack,
            ack_timeout_ms: None,
            init_timeout_ms: 1000,
            pixel_format: ChannelOrder::Rgb,
            clear_on_exit: false,
            leds: vec![
                LedConfig {
                    range: [0, 2],
                    color: Some(RED),
                    snake: None,
                    visualizer: None,
                },
                LedConfig {
                    range: [2, 3],
                    color: Some(BLUE),
                    snake: None,
                    visualizer: None,
                },
            ],
        }
    }

    fn start<T: Transport + 'static>(
        daemon: &Arc<Daemon>,
        transport: T,
    ) -> (CancelToken, Receiver<Result<(), DaemonError>>) {
        let cancel = CancelToken::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let daemon = Arc::clone(daemon);
        let token = cancel.clone();
        thread::spawn(move || {
            let _ = tx.send(daemon.run_with(transport, &token));
        });
        (cancel, rx)
    }

    fn finish(rx: &Receiver<Result<(), DaemonError>>) -> Result<(), DaemonError> {
        rx.recv_timeout(Duration::from_secs(3))
            .expect("daemon did not stop")
    }

    /// Controller that answers each packet with whatever `respond` returns.
    /// Yields the number of `Set` frames seen once the host hangs up.
    fn scripted_device<F>(mut end: DeviceEnd, mut respond: F) -> JoinHandle<usize>
    where
        F: FnMut(&IncomingPacket<'_>) -> Vec<OutgoingPacket> + Send + 'static,
    {
        thread::spawn(move || {
            let mut ctx = ReadContext::new();
            let mut sets = 0;
            loop {
                let packet = match decode_incoming(&mut end, &mut ctx) {
                    Ok(packet) => packet,
                    Err(_) => return sets,
                };
                let replies = respond(&packet);
                let resize = match packet {
                    IncomingPacket::Initialize { num_leds } => Some(num_leds),
                    IncomingPacket::Set { .. } => {
                        sets += 1;
                        None
                    }
                    IncomingPacket::Clear => None,
                };
                if let Some(num_leds) = resize {
                    ctx.resize(num_leds);
                }
                for reply in replies {
                    if write_outgoing(&mut end, &reply).is_err() {
                        return sets;
                    }
                }
            }
        })
    }

    fn ack(packet: &IncomingPacket<'_>) -> OutgoingPacket {
        OutgoingPacket::Ack {
            acknowledged: packet.packet_type(),
        }
    }

    /// Acks initialize, then stays silent
    fn ack_init_only(packet: &IncomingPacket<'_>) -> Vec<OutgoingPacket> {
        match packet {
            IncomingPacket::Initialize { .. } => vec![ack(packet)],
            _ => Vec::new(),
        }
    }

    fn emulator(end: DeviceEnd) -> Receiver<Vec<Rgb>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (reader, writer) = end.split();
        thread::spawn(move || {
            let _ = Device::new(reader, writer).with_frame_sink(tx).run();
        });
        rx
    }

    #[test]
    fn test_unacked_frame_holds_back_ticks() {
        let daemon = Arc::new(Daemon::new(test_config(200)).unwrap());
        let (transport, end) = pipe();
        let device = scripted_device(end, ack_init_only);

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert_eq!(stats.frames_sent, 1);
        assert!(stats.ticks_suppressed > 0);
        assert_eq!(device.join().unwrap(), 1);
    }

    #[test]
    fn test_frames_never_outrun_acks() {
        let daemon = Arc::new(Daemon::new(test_config(500)).unwrap());
        let (transport, end) = pipe();
        let device = scripted_device(end, |packet| {
            if let IncomingPacket::Set { .. } = packet {
                thread::sleep(Duration::from_millis(20));
            }
            vec![ack(packet)]
        });

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert!(stats.frames_sent >= 2);
        assert!(stats.frames_sent <= stats.frames_acked + 1);
        assert!(stats.ticks_suppressed > 0);
        device.join().unwrap();
    }

    #[test]
    fn test_timer_pacing_ignores_acks() {
        let mut config = test_config(200);
        config.pacing = Pacing::Timer;
        let daemon = Arc::new(Daemon::new(config).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, ack_init_only);

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert!(stats.frames_sent >= 3);
        assert_eq!(stats.ticks_suppressed, 0);
    }

    #[test]
    fn test_ack_timeout_resumes_sending() {
        let mut config = test_config(200);
        config.ack_timeout_ms = Some(20);
        let daemon = Arc::new(Daemon::new(config).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, ack_init_only);

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert!(stats.ack_timeouts >= 1);
        assert!(stats.frames_sent >= 2);
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let daemon = Arc::new(Daemon::new(test_config(1)).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, ack_init_only);

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        cancel.cancel();
        finish(&rx).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_composites_animators() {
        let daemon = Arc::new(Daemon::new(test_config(1)).unwrap());
        let (transport, end) = pipe();
        let frames = emulator(end);

        // Ticks are a second apart, so this frame comes from the refresh
        daemon.queue_refresh();
        let (cancel, rx) = start(&daemon, transport);
        let frame = frames
            .recv_timeout(Duration::from_millis(800))
            .expect("no frame before the first tick");
        assert_eq!(frame, vec![RED, RED, BLUE]);

        cancel.cancel();
        finish(&rx).unwrap();
    }

    #[test]
    fn test_clear_on_exit() {
        let mut config = test_config(50);
        config.clear_on_exit = true;
        let daemon = Arc::new(Daemon::new(config).unwrap());
        let (transport, end) = pipe();
        let frames = emulator(end);

        let (cancel, rx) = start(&daemon, transport);
        assert_eq!(
            frames.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![RED, RED, BLUE]
        );
        cancel.cancel();
        finish(&rx).unwrap();

        let cleared = frames
            .iter()
            .any(|frame| frame.iter().all(|&p| p == Rgb::BLACK));
        assert!(cleared);
    }

    #[test]
    fn test_device_panic_is_fatal() {
        let daemon = Arc::new(Daemon::new(test_config(50)).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, |packet| match packet {
            IncomingPacket::Set { .. } => vec![OutgoingPacket::Panic {
                message: "boom".into(),
            }],
            _ => vec![ack(packet)],
        });

        let (_cancel, rx) = start(&daemon, transport);
        match finish(&rx) {
            Err(DaemonError::DevicePanicked(message)) => assert_eq!(message, "boom"),
            other => panic!("expected a device panic, got {:?}", other),
        }
    }

    #[test]
    fn test_output_after_panic_line_is_ignored() {
        let daemon = Arc::new(Daemon::new(test_config(50)).unwrap());
        let (transport, mut end) = pipe();
        thread::spawn(move || {
            let mut ctx = ReadContext::new();
            if decode_incoming(&mut end, &mut ctx).is_err() {
                return;
            }
            ctx.resize(3);
            let init = OutgoingPacket::Ack {
                acknowledged: IncomingPacketType::Initialize,
            };
            if write_outgoing(&mut end, &init).is_err() {
                return;
            }

            if decode_incoming(&mut end, &mut ctx).is_err() {
                return;
            }
            let _ = end.write_all(b"panic: index out of range\r\n[tinygo: panic at /src/main.go:42]\r\n");
            // Keep the line open like a rebooting board would
            thread::sleep(Duration::from_millis(500));
        });

        let (_cancel, rx) = start(&daemon, transport);
        match finish(&rx) {
            Err(DaemonError::DevicePanicked(message)) => {
                assert_eq!(message, "index out of range")
            }
            other => panic!("expected a device panic, got {:?}", other),
        }
    }

    #[test]
    fn test_device_error_is_recoverable() {
        let daemon = Arc::new(Daemon::new(test_config(100)).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, |packet| match packet {
            IncomingPacket::Set { .. } => vec![
                OutgoingPacket::Error {
                    message: "hiccup".into(),
                },
                ack(packet),
            ],
            _ => vec![ack(packet)],
        });

        let (cancel, rx) = start(&daemon, transport);
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert!(stats.device_errors >= 1);
        assert!(stats.frames_sent >= 2);
    }

    #[test]
    fn test_initialize_rejected() {
        let daemon = Arc::new(Daemon::new(test_config(50)).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, |_| {
            vec![OutgoingPacket::Error {
                message: "no strip attached".into(),
            }]
        });

        let (_cancel, rx) = start(&daemon, transport);
        match finish(&rx) {
            Err(DaemonError::InitializeRejected(message)) => {
                assert_eq!(message, "no strip attached")
            }
            other => panic!("expected a rejected initialize, got {:?}", other),
        }
        assert_eq!(daemon.stats().frames_sent, 0);
    }

    #[test]
    fn test_initialize_timeout() {
        let mut config = test_config(50);
        config.init_timeout_ms = 50;
        let daemon = Arc::new(Daemon::new(config).unwrap());
        let (transport, end) = pipe();
        let _device = scripted_device(end, |_| Vec::new());

        let (_cancel, rx) = start(&daemon, transport);
        assert!(matches!(
            finish(&rx),
            Err(DaemonError::InitializeTimeout(_))
        ));
    }

    #[test]
    fn test_corrupt_ack_is_fatal() {
        let daemon = Arc::new(Daemon::new(test_config(50)).unwrap());
        let (transport, mut end) = pipe();
        thread::spawn(move || {
            let mut ctx = ReadContext::new();
            if decode_incoming(&mut end, &mut ctx).is_err() {
                return;
            }
            ctx.resize(3);
            let init = encode_outgoing(&OutgoingPacket::Ack {
                acknowledged: IncomingPacketType::Initialize,
            })
            .unwrap();
            let _ = end.write_all(&init);

            if decode_incoming(&mut end, &mut ctx).is_err() {
                return;
            }
            let mut bad = encode_outgoing(&OutgoingPacket::Ack {
                acknowledged: IncomingPacketType::Set,
            })
            .unwrap();
            let last = bad.len() - 1;
            bad[last] ^= 0x01;
            let _ = end.write_all(&bad);
        });

        let (_cancel, rx) = start(&daemon, transport);
        assert!(matches!(
            finish(&rx),
            Err(DaemonError::Codec(CodecError::ChecksumMismatch { .. }))
        ));
    }

    /// Loopback that fails every second `Set` write
    struct FlakyTransport {
        inner: LoopbackTransport,
        sends: usize,
    }

    impl Transport for FlakyTransport {
        type Reader = LoopbackReader;

        fn take_reader(&mut self) -> Result<LoopbackReader, TransportError> {
            self.inner.take_reader()
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            self.sends += 1;
            if self.sends > 1 && self.sends % 2 == 0 {
                return Err(TransportError::WriteFailed(std::io::ErrorKind::TimedOut.into()));
            }
            self.inner.send(frame)
        }

        fn closer(&self) -> crate::transport::Closer {
            self.inner.closer()
        }
    }

    #[test]
    fn test_write_failure_drops_frame() {
        let daemon = Arc::new(Daemon::new(test_config(100)).unwrap());
        let (inner, end) = pipe();
        let _device = scripted_device(end, |packet| vec![ack(packet)]);

        let (cancel, rx) = start(&daemon, FlakyTransport { inner, sends: 0 });
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
        finish(&rx).unwrap();

        let stats = daemon.stats();
        assert!(stats.frames_dropped >= 1);
        assert!(stats.frames_sent >= 1);
    }

    #[test]
    fn test_visualizer_config_rejected() {
        let mut config = test_config(50);
        config.leds[0].color = None;
        config.leds[0].visualizer = Some(crate::config::VisualizerConfig {
            kind: crate::config::VisualizerKind::Meter,
        });
        // Rejected up front, before any port would be opened
        let err = Daemon::new(config).err().unwrap();
        assert!(matches!(
            err,
            DaemonError::Config(ConfigError::UnsupportedAnimation(_))
        ));
    }
}
