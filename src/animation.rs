use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::config::{ConfigError, Content, LedConfig, SnakeConfig, VisualizerConfig};
use crate::pixel::Rgb;

/// Content generator bound to one LED range
pub trait Animator: Send {
    /// Draw the current frame into `view`, which covers exactly this
    /// animator's range. Runs on the scheduler thread and must not block.
    fn draw(&mut self, view: &mut [Rgb]);
}

/// Lets animations ask for a frame outside the regular ticks
pub trait RefreshQueuer {
    /// Request a refresh. Dropped if one is already pending.
    fn queue_refresh(&self);
}

/// Cloneable sender side of the refresh slot
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: Sender<()>,
}

impl RefreshQueuer for RefreshHandle {
    fn queue_refresh(&self) {
        // Full slot: a refresh is already pending
        let _ = self.tx.try_send(());
    }
}

/// Single-slot refresh signal: any number of requests collapse into one
pub fn refresh_slot() -> (RefreshHandle, Receiver<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (RefreshHandle { tx }, rx)
}

/// An animator together with the LEDs it owns
pub struct TrackedAnimator {
    pub range: Range<usize>,
    pub animator: Box<dyn Animator>,
}

/// Reject content this build cannot animate, without starting anything
pub fn check_supported(leds: &[LedConfig]) -> Result<(), ConfigError> {
    for led in leds {
        if let Some(Content::Visualizer(cfg)) = led.content()? {
            return Err(unsupported_visualizer(cfg));
        }
    }
    Ok(())
}

fn unsupported_visualizer(cfg: &VisualizerConfig) -> ConfigError {
    ConfigError::UnsupportedAnimation(format!("{} visualizer", cfg.kind))
}

/// Build one animator per configured range. Ranges without content get none.
pub fn build_animators(
    leds: &[LedConfig],
    refresh: &RefreshHandle,
) -> Result<Vec<TrackedAnimator>, ConfigError> {
    let mut animators = Vec::new();

    for led in leds {
        let animator: Box<dyn Animator> = match led.content()? {
            None => continue,
            Some(Content::Color(color)) => Box::new(StaticColor::new(color)),
            Some(Content::Snake(cfg)) => Box::new(Snake::new(cfg, refresh.clone())),
            Some(Content::Visualizer(cfg)) => return Err(unsupported_visualizer(cfg)),
        };

        debug!("registered animator for LEDs {:?}", led.range);
        animators.push(TrackedAnimator {
            range: led.led_range(),
            animator,
        });
    }

    Ok(animators)
}

/// Fills its range with one color
pub struct StaticColor {
    color: Rgb,
}

impl StaticColor {
    pub fn new(color: Rgb) -> Self {
        StaticColor { color }
    }
}

impl Animator for StaticColor {
    fn draw(&mut self, view: &mut [Rgb]) {
        view.fill(self.color);
    }
}

/// Repeating pattern of colored chunks crawling along its range, one LED per
/// step. A stepping thread advances it and queues a refresh after each step.
pub struct Snake {
    pattern: Vec<Rgb>,
    step: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    stepper: Option<JoinHandle<()>>,
}

impl Snake {
    pub fn new<Q>(cfg: &SnakeConfig, refresh: Q) -> Self
    where
        Q: RefreshQueuer + Send + 'static,
    {
        let pattern: Vec<Rgb> = cfg
            .chunks
            .iter()
            .flat_map(|chunk| std::iter::repeat(chunk.color).take(chunk.length))
            .collect();

        let step = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let speed = Duration::from_millis(cfg.speed_ms);

        let stepper = {
            let step = Arc::clone(&step);
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_stepper(speed, step, stop, refresh))
        };

        Snake {
            pattern,
            step,
            stop,
            stepper: Some(stepper),
        }
    }
}

fn run_stepper<Q: RefreshQueuer>(
    speed: Duration,
    step: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    refresh: Q,
) {
    loop {
        let next = Instant::now() + speed;
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            thread::park_timeout(next - now);
        }
        step.fetch_add(1, Ordering::Relaxed);
        refresh.queue_refresh();
    }
}

impl Animator for Snake {
    fn draw(&mut self, view: &mut [Rgb]) {
        let n = self.pattern.len();
        if n == 0 {
            return;
        }
        let shift = self.step.load(Ordering::Relaxed) % n;
        for (i, pixel) in view.iter_mut().enumerate() {
            *pixel = self.pattern[(i + n - shift) % n];
        }
    }
}

impl Drop for Snake {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stepper.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SnakeChunk, VisualizerKind};

    const RED: Rgb = Rgb::new(255, 0, 0);
    const BLUE: Rgb = Rgb::new(0, 0, 255);

    fn led(range: [usize; 2]) -> LedConfig {
        LedConfig {
            range,
            color: None,
            snake: None,
            visualizer: None,
        }
    }

    fn snake_config(speed_ms: u64) -> SnakeConfig {
        SnakeConfig {
            chunks: vec![
                SnakeChunk { color: RED, length: 2 },
                SnakeChunk { color: BLUE, length: 1 },
            ],
            speed_ms,
        }
    }

    #[test]
    fn test_concurrent_refreshes_coalesce() {
        let (handle, rx) = refresh_slot();
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        handle.queue_refresh();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(rx.try_iter().count(), 1);
        // Slot is free again once observed
        handle.queue_refresh();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_refresh_after_receiver_dropped() {
        let (handle, rx) = refresh_slot();
        drop(rx);
        handle.queue_refresh();
    }

    #[test]
    fn test_static_color_fills_view() {
        let mut view = [Rgb::BLACK; 3];
        StaticColor::new(BLUE).draw(&mut view);
        assert_eq!(view, [BLUE; 3]);
    }

    #[test]
    fn test_snake_pattern_shifts() {
        let (handle, _rx) = refresh_slot();
        // Slow enough that the stepper never fires during the test
        let mut snake = Snake::new(&snake_config(60_000), handle);

        let mut view = [Rgb::BLACK; 5];
        snake.draw(&mut view);
        assert_eq!(view, [RED, RED, BLUE, RED, RED]);

        snake.step.store(1, Ordering::Relaxed);
        snake.draw(&mut view);
        assert_eq!(view, [BLUE, RED, RED, BLUE, RED]);
    }

    #[test]
    fn test_snake_queues_refresh() {
        let (handle, rx) = refresh_slot();
        let snake = Snake::new(&snake_config(5), handle);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("snake never asked for a refresh");
        assert!(snake.step.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_snake_drop_stops_stepper() {
        let (handle, _rx) = refresh_slot();
        let snake = Snake::new(&snake_config(60_000), handle);
        let started = Instant::now();
        drop(snake);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_factory_maps_contents() {
        let (handle, _rx) = refresh_slot();
        let mut color = led([0, 2]);
        color.color = Some(RED);
        let mut snake = led([2, 5]);
        snake.snake = Some(snake_config(60_000));
        let dark = led([5, 8]);

        let animators = build_animators(&[color, snake, dark], &handle).unwrap();
        let ranges: Vec<_> = animators.iter().map(|a| a.range.clone()).collect();
        assert_eq!(ranges, vec![0..2, 2..5]);
    }

    #[test]
    fn test_factory_rejects_visualizer() {
        let (handle, _rx) = refresh_slot();
        let mut vis = led([0, 10]);
        vis.visualizer = Some(VisualizerConfig {
            kind: VisualizerKind::Glowing,
        });
        let err = build_animators(&[vis.clone()], &handle).err().unwrap();
        assert!(matches!(err, ConfigError::UnsupportedAnimation(_)));
        assert!(matches!(
            check_supported(&[led([10, 20]), vis]),
            Err(ConfigError::UnsupportedAnimation(_))
        ));
    }
}
