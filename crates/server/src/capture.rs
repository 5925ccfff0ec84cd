//! Raw frame types and the bounded queue between a capture backend and the
//! encode pipeline.
//!
//! The queue never blocks the producer: when it is full the frame being
//! pushed is discarded, so the consumer always works on the frames that were
//! already waiting and a stalled encoder cannot back up into capture.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Frames buffered between capture and encode.
pub const FRAME_QUEUE_CAPACITY: usize = 4;

const BYTES_PER_PIXEL: usize = 4; // BGRx

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Anything that can flow through a frame queue into an encode pipeline.
/// A change in [`RawFrame::format`] forces the codec to be rebuilt.
pub trait RawFrame: Send + 'static {
    type Format: Copy + PartialEq + Debug + Send + Sync + 'static;

    fn format(&self) -> Self::Format;
}

/// One captured screen image, tightly packed BGRx.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub geometry: Geometry,
    pub data: Bytes,
}

impl RawFrame for VideoFrame {
    type Format = Geometry;

    fn format(&self) -> Geometry {
        self.geometry
    }
}

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub format: AudioFormat,
    pub samples: Vec<i16>,
}

impl RawFrame for AudioFrame {
    type Format = AudioFormat;

    fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Create a bounded drop-newest frame queue.
pub fn frame_queue<F>(capacity: usize) -> (FrameSender<F>, FrameReceiver<F>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        FrameSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        FrameReceiver { rx },
    )
}

/// Producer half of a frame queue.
pub struct FrameSender<F> {
    tx: mpsc::Sender<F>,
    dropped: Arc<AtomicU64>,
}

impl<F> FrameSender<F> {
    /// Offer a frame without waiting. Returns false if it was discarded
    /// because the queue is full or the consumer is gone.
    pub fn push(&self, frame: F) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_multiple_of(100) {
                    debug!(dropped, "Frame queue full, dropping newest frame");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Frames discarded so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a frame queue.
pub struct FrameReceiver<F> {
    rx: mpsc::Receiver<F>,
}

impl<F> FrameReceiver<F> {
    /// Wait for the next frame. `None` once the producer has stopped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<F> {
        self.rx.recv().await
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// A capture backend producing frames of type `F`.
pub trait CaptureSource<F: RawFrame>: Send {
    /// Begin producing frames into the queue.
    fn start(&mut self) -> Result<()>;

    /// Stop producing. The queue closes once buffered frames are drained.
    fn stop(&mut self) -> Result<()>;

    /// Consumer end of the frame queue. Handed out once.
    fn take_frames(&mut self) -> Option<FrameReceiver<F>>;
}

type Generator<F> = Box<dyn FnMut(u64) -> F + Send>;

/// Clock-driven source that synthesizes frames on a fixed period.
pub struct SyntheticSource<F> {
    name: &'static str,
    period: Duration,
    generate: Option<Generator<F>>,
    sender: Option<FrameSender<F>>,
    receiver: Option<FrameReceiver<F>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<F: RawFrame> SyntheticSource<F> {
    pub fn new(name: &'static str, period: Duration, generate: Generator<F>) -> Self {
        let (sender, receiver) = frame_queue(FRAME_QUEUE_CAPACITY);
        Self {
            name,
            period,
            generate: Some(generate),
            sender: Some(sender),
            receiver: Some(receiver),
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

impl<F: RawFrame> CaptureSource<F> for SyntheticSource<F> {
    fn start(&mut self) -> Result<()> {
        let (Some(sender), Some(mut generate)) = (self.sender.take(), self.generate.take()) else {
            bail!("{} source already started", self.name);
        };
        let cancel = self.cancel.clone();
        let period = self.period;
        let name = self.name;
        info!(source = name, period_ms = period.as_millis() as u64, "Capture started");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if sender.is_closed() {
                            break;
                        }
                        sender.push(generate(seq));
                        seq += 1;
                    }
                }
            }
            debug!(source = name, produced = seq, dropped = sender.dropped(), "Capture loop exited");
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        // Never started: close the queue so the consumer sees end-of-stream.
        self.sender.take();
        if self.task.take().is_some() {
            info!(source = self.name, "Capture stopped");
        }
        Ok(())
    }

    fn take_frames(&mut self) -> Option<FrameReceiver<F>> {
        self.receiver.take()
    }
}

impl<F> Drop for SyntheticSource<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Moving vertical colour bars.
pub fn test_pattern(geometry: Geometry, framerate: u32) -> SyntheticSource<VideoFrame> {
    let period = Duration::from_secs(1) / framerate.max(1);
    SyntheticSource::new(
        "test-pattern",
        period,
        Box::new(move |seq| VideoFrame {
            geometry,
            data: color_bars(geometry, seq),
        }),
    )
}

const BARS: [[u8; 4]; 8] = [
    [255, 255, 255, 0], // white
    [0, 255, 255, 0],   // yellow
    [255, 255, 0, 0],   // cyan
    [0, 255, 0, 0],     // green
    [255, 0, 255, 0],   // magenta
    [0, 0, 255, 0],     // red
    [255, 0, 0, 0],     // blue
    [0, 0, 0, 0],       // black
];

fn color_bars(geometry: Geometry, seq: u64) -> Bytes {
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let bar_width = (width / BARS.len()).max(1);
    let shift = (seq as usize * 4) % width.max(1);

    let mut row = Vec::with_capacity(width * BYTES_PER_PIXEL);
    for x in 0..width {
        let bar = ((x + shift) / bar_width) % BARS.len();
        row.extend_from_slice(&BARS[bar]);
    }
    let mut data = Vec::with_capacity(row.len() * height);
    for _ in 0..height {
        data.extend_from_slice(&row);
    }
    Bytes::from(data)
}

/// Duration of one synthesized audio frame.
pub const AUDIO_FRAME_MS: u32 = 20;

/// Continuous 440 Hz sine.
pub fn tone(format: AudioFormat) -> SyntheticSource<AudioFrame> {
    let samples_per_frame = (format.sample_rate * AUDIO_FRAME_MS / 1000) as u64;
    let channels = format.channels.max(1) as usize;
    SyntheticSource::new(
        "tone",
        Duration::from_millis(AUDIO_FRAME_MS as u64),
        Box::new(move |seq| {
            let start = seq * samples_per_frame;
            let mut samples = Vec::with_capacity(samples_per_frame as usize * channels);
            for n in start..start + samples_per_frame {
                let t = n as f64 / format.sample_rate as f64;
                let value = (t * 440.0 * std::f64::consts::TAU).sin() * 0.2 * i16::MAX as f64;
                for _ in 0..channels {
                    samples.push(value as i16);
                }
            }
            AudioFrame { format, samples }
        }),
    )
}
