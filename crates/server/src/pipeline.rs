//! Pull-based encode pipeline: raw frames in, compressed access units out.
//!
//! The codec instance is bound to the format of the frames it was built for.
//! When a frame arrives with a different format (for video, a new geometry)
//! the old instance is closed and a fresh one is built before the frame is
//! encoded. Periodic keyframes are off; the only keyframes after the first
//! are the ones requested through [`KeyframeControl`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{FrameReceiver, RawFrame};

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedUnit {
    pub data: Bytes,
    /// Decodable without any earlier unit
    pub keyframe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub bitrate_kbps: u32,
    pub framerate: u32,
}

/// A codec instance configured for one frame format.
pub trait Codec<F: RawFrame>: Send {
    /// Feed one frame. Returns every unit that became available, which may be
    /// none while the codec is buffering. May block.
    fn encode(&mut self, frame: &F, force_keyframe: bool) -> Result<Vec<EncodedUnit>>;

    fn close(&mut self) -> Result<()>;
}

/// Builds codec instances for a pipeline.
pub trait CodecFactory<F: RawFrame>: Send + Sync {
    /// Fail early if no instance could ever be built (missing encoder).
    fn probe(&self) -> Result<()>;

    fn build(&self, format: F::Format, params: &EncoderParams) -> Result<Box<dyn Codec<F>>>;
}

/// Shared "next unit must be a keyframe" flag.
#[derive(Debug, Clone, Default)]
pub struct KeyframeControl(Arc<AtomicBool>);

impl KeyframeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub struct EncodePipeline<F: RawFrame> {
    frames: FrameReceiver<F>,
    factory: Arc<dyn CodecFactory<F>>,
    params: EncoderParams,
    codec: Option<Bound<F>>,
    in_flight: Option<InFlight<F>>,
    pending: VecDeque<EncodedUnit>,
    keyframe: KeyframeControl,
    rebuilds: u64,
}

struct Bound<F: RawFrame> {
    format: F::Format,
    codec: Box<dyn Codec<F>>,
}

/// An encode running on the blocking pool. It owns the codec until joined,
/// so it outlives a dropped `read` and is collected by the next `read` or
/// by `close`.
struct InFlight<F: RawFrame> {
    handle: JoinHandle<(Bound<F>, Result<Vec<EncodedUnit>>)>,
    force: bool,
}

impl<F: RawFrame> EncodePipeline<F> {
    /// Bind a pipeline to a frame queue. Fails if the factory cannot produce
    /// codecs at all.
    pub fn new(
        frames: FrameReceiver<F>,
        factory: Arc<dyn CodecFactory<F>>,
        params: EncoderParams,
    ) -> Result<Self> {
        factory.probe().context("Codec unavailable")?;
        Ok(Self {
            frames,
            factory,
            params,
            codec: None,
            in_flight: None,
            pending: VecDeque::new(),
            keyframe: KeyframeControl::new(),
            rebuilds: 0,
        })
    }

    pub fn keyframe_control(&self) -> KeyframeControl {
        self.keyframe.clone()
    }

    /// Number of codec instances built so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Next compressed unit. `Ok(None)` once the frame source has ended.
    ///
    /// Cancel-safe: an encode interrupted by dropping this future is resumed
    /// by the next call.
    pub async fn read(&mut self) -> Result<Option<EncodedUnit>> {
        loop {
            if let Some(task) = self.in_flight.as_mut() {
                let joined = (&mut task.handle).await;
                let force = task.force;
                self.in_flight = None;
                let (bound, result) = joined.context("Encoder task panicked")?;
                self.codec = Some(bound);

                let units = result.context("Encode failed")?;
                if force && !units.iter().any(|u| u.keyframe) {
                    // The forced frame is still inside the codec.
                    self.keyframe.force();
                }
                self.pending.extend(units);
            }

            if self.keyframe.is_pending() && self.pending.iter().any(|u| !u.keyframe) {
                let before = self.pending.len();
                self.pending.retain(|u| u.keyframe);
                debug!(
                    discarded = before - self.pending.len(),
                    "Dropping buffered units ahead of forced keyframe"
                );
            }
            if let Some(unit) = self.pending.pop_front() {
                return Ok(Some(unit));
            }

            let Some(frame) = self.frames.recv().await else {
                return Ok(None);
            };

            let format = frame.format();
            if self.codec.as_ref().is_none_or(|b| b.format != format) {
                self.rebind(format)?;
            }
            let Some(mut bound) = self.codec.take() else {
                anyhow::bail!("Codec missing after rebuild");
            };

            let force = self.keyframe.take();
            let handle = tokio::task::spawn_blocking(move || {
                let result = bound.codec.encode(&frame, force);
                (bound, result)
            });
            self.in_flight = Some(InFlight { handle, force });
        }
    }

    fn rebind(&mut self, format: F::Format) -> Result<()> {
        if let Some(mut old) = self.codec.take() {
            info!(old = ?old.format, new = ?format, "Frame format changed, rebuilding codec");
            if let Err(e) = old.codec.close() {
                warn!("Failed to close stale codec: {e:#}");
            }
        }
        // Output of the stale instance is not decodable against the new one.
        self.pending.clear();

        let codec = self
            .factory
            .build(format, &self.params)
            .with_context(|| format!("Failed to build codec for {format:?}"))?;
        self.rebuilds += 1;
        // A fresh instance starts with a keyframe; drop any stale request.
        self.keyframe.take();
        self.codec = Some(Bound { format, codec });
        Ok(())
    }

    /// Wait for any running encode, then close the codec. Its output is
    /// discarded.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.in_flight.take() {
            match task.handle.await {
                Ok((bound, _)) => self.codec = Some(bound),
                Err(e) => warn!("Encoder task panicked: {e}"),
            }
        }
        self.pending.clear();
        match self.codec.take() {
            Some(mut bound) => bound.codec.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::{FRAME_QUEUE_CAPACITY, FrameSender, Geometry, VideoFrame, frame_queue};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every build and encode. Emits one unit per frame, a keyframe
    /// for the first frame of an instance or when forced.
    #[derive(Default)]
    pub(crate) struct FakeFactory {
        pub builds: Mutex<Vec<Geometry>>,
        pub closes: Arc<Mutex<u32>>,
        pub fail_probe: bool,
    }

    pub(crate) struct FakeCodec {
        geometry: Geometry,
        frames: u64,
        closes: Arc<Mutex<u32>>,
    }

    impl Codec<VideoFrame> for FakeCodec {
        fn encode(&mut self, frame: &VideoFrame, force: bool) -> Result<Vec<EncodedUnit>> {
            assert_eq!(frame.geometry, self.geometry, "codec fed a foreign geometry");
            let keyframe = self.frames == 0 || force;
            self.frames += 1;
            Ok(vec![EncodedUnit {
                data: frame.data.clone(),
                keyframe,
            }])
        }

        fn close(&mut self) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    impl CodecFactory<VideoFrame> for FakeFactory {
        fn probe(&self) -> Result<()> {
            if self.fail_probe {
                anyhow::bail!("no encoder installed");
            }
            Ok(())
        }

        fn build(&self, geometry: Geometry, _: &EncoderParams) -> Result<Box<dyn Codec<VideoFrame>>> {
            self.builds.lock().unwrap().push(geometry);
            Ok(Box::new(FakeCodec {
                geometry,
                frames: 0,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    const PARAMS: EncoderParams = EncoderParams {
        bitrate_kbps: 1000,
        framerate: 30,
    };

    fn frame(width: u32, height: u32, tag: u8) -> VideoFrame {
        VideoFrame {
            geometry: Geometry::new(width, height),
            data: Bytes::from(vec![tag]),
        }
    }

    fn pipeline(factory: Arc<FakeFactory>) -> (FrameSender<VideoFrame>, EncodePipeline<VideoFrame>) {
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let pipeline = EncodePipeline::new(rx, factory, PARAMS).unwrap();
        (tx, pipeline)
    }

    #[tokio::test]
    async fn rebuilds_once_per_geometry_change() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut pipeline) = pipeline(Arc::clone(&factory));

        let sizes = [(640, 480), (640, 480), (800, 600), (800, 600), (640, 480)];
        for (i, (w, h)) in sizes.iter().enumerate() {
            assert!(tx.push(frame(*w, *h, i as u8)));
            let unit = pipeline.read().await.unwrap().unwrap();
            assert_eq!(unit.data[0], i as u8);
        }

        assert_eq!(pipeline.rebuilds(), 3);
        assert_eq!(
            *factory.builds.lock().unwrap(),
            vec![
                Geometry::new(640, 480),
                Geometry::new(800, 600),
                Geometry::new(640, 480)
            ]
        );
        assert_eq!(*factory.closes.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn identical_geometry_never_rebuilds() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut pipeline) = pipeline(Arc::clone(&factory));
        for i in 0..10 {
            tx.push(frame(320, 240, i));
            let unit = pipeline.read().await.unwrap().unwrap();
            assert_eq!(unit.keyframe, i == 0);
        }
        assert_eq!(pipeline.rebuilds(), 1);
    }

    #[tokio::test]
    async fn forced_keyframe_marks_next_unit() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut pipeline) = pipeline(factory);
        let control = pipeline.keyframe_control();

        tx.push(frame(320, 240, 0));
        pipeline.read().await.unwrap();
        tx.push(frame(320, 240, 1));
        assert!(!pipeline.read().await.unwrap().unwrap().keyframe);

        control.force();
        tx.push(frame(320, 240, 2));
        assert!(pipeline.read().await.unwrap().unwrap().keyframe);
        assert!(!control.is_pending());

        tx.push(frame(320, 240, 3));
        assert!(!pipeline.read().await.unwrap().unwrap().keyframe);
    }

    #[tokio::test]
    async fn source_end_is_end_of_stream() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut pipeline) = pipeline(factory);
        tx.push(frame(16, 16, 0));
        drop(tx);
        assert!(pipeline.read().await.unwrap().is_some());
        assert!(pipeline.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn probe_failure_fails_construction() {
        let factory = Arc::new(FakeFactory {
            fail_probe: true,
            ..Default::default()
        });
        let (_tx, rx) = frame_queue::<VideoFrame>(FRAME_QUEUE_CAPACITY);
        let err = EncodePipeline::new(rx, factory, PARAMS).err().unwrap();
        assert!(format!("{err:#}").contains("no encoder installed"));
    }

    /// Emits two units per frame so a forced keyframe can find stale ones queued.
    struct Bursty;

    impl Codec<VideoFrame> for Bursty {
        fn encode(&mut self, frame: &VideoFrame, force: bool) -> Result<Vec<EncodedUnit>> {
            Ok(vec![
                EncodedUnit {
                    data: frame.data.clone(),
                    keyframe: force,
                },
                EncodedUnit {
                    data: frame.data.clone(),
                    keyframe: false,
                },
            ])
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct BurstyFactory;

    impl CodecFactory<VideoFrame> for BurstyFactory {
        fn probe(&self) -> Result<()> {
            Ok(())
        }
        fn build(&self, _: Geometry, _: &EncoderParams) -> Result<Box<dyn Codec<VideoFrame>>> {
            Ok(Box::new(Bursty))
        }
    }

    #[tokio::test]
    async fn forced_keyframe_skips_buffered_delta_units() {
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let mut pipeline = EncodePipeline::new(rx, Arc::new(BurstyFactory), PARAMS).unwrap();
        tx.push(frame(16, 16, 0));
        tx.push(frame(16, 16, 1));
        let first = pipeline.read().await.unwrap().unwrap();
        assert_eq!(first.data[0], 0);

        pipeline.keyframe_control().force();
        let next = pipeline.read().await.unwrap().unwrap();
        assert!(next.keyframe);
        assert_eq!(next.data[0], 1);
    }

    #[tokio::test]
    async fn close_closes_codec() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut pipeline) = pipeline(Arc::clone(&factory));
        tx.push(frame(16, 16, 0));
        pipeline.read().await.unwrap();
        pipeline.close().await.unwrap();
        assert_eq!(*factory.closes.lock().unwrap(), 1);
        pipeline.close().await.unwrap();
        assert_eq!(*factory.closes.lock().unwrap(), 1);
    }

    /// Takes `delay` per frame, like a hardware encoder under load.
    struct SlowCodec {
        delay: Duration,
        closes: Arc<Mutex<u32>>,
    }

    impl Codec<VideoFrame> for SlowCodec {
        fn encode(&mut self, frame: &VideoFrame, _force: bool) -> Result<Vec<EncodedUnit>> {
            std::thread::sleep(self.delay);
            Ok(vec![EncodedUnit {
                data: frame.data.clone(),
                keyframe: true,
            }])
        }

        fn close(&mut self) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct SlowFactory {
        closes: Arc<Mutex<u32>>,
    }

    impl CodecFactory<VideoFrame> for SlowFactory {
        fn probe(&self) -> Result<()> {
            Ok(())
        }
        fn build(&self, _: Geometry, _: &EncoderParams) -> Result<Box<dyn Codec<VideoFrame>>> {
            Ok(Box::new(SlowCodec {
                delay: Duration::from_millis(300),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn slow_pipeline() -> (FrameSender<VideoFrame>, EncodePipeline<VideoFrame>, Arc<Mutex<u32>>) {
        let closes = Arc::new(Mutex::new(0));
        let factory = Arc::new(SlowFactory {
            closes: Arc::clone(&closes),
        });
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let pipeline = EncodePipeline::new(rx, factory, PARAMS).unwrap();
        (tx, pipeline, closes)
    }

    #[tokio::test]
    async fn close_after_interrupted_read_closes_codec() {
        let (tx, mut pipeline, closes) = slow_pipeline();
        tx.push(frame(16, 16, 0));

        let interrupted = tokio::time::timeout(Duration::from_millis(50), pipeline.read()).await;
        assert!(interrupted.is_err(), "encode should still be running");

        pipeline.close().await.unwrap();
        assert_eq!(*closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn interrupted_read_resumes_the_same_frame() {
        let (tx, mut pipeline, closes) = slow_pipeline();
        tx.push(frame(16, 16, 7));

        assert!(
            tokio::time::timeout(Duration::from_millis(50), pipeline.read())
                .await
                .is_err()
        );
        let unit = pipeline.read().await.unwrap().unwrap();
        assert_eq!(unit.data[0], 7);
        assert_eq!(pipeline.rebuilds(), 1);
        assert_eq!(*closes.lock().unwrap(), 0);
    }
}
