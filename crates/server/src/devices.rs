use std::sync::Arc;

use anyhow::{Context, Result, bail};
use periscope_protocol::PeriscopeConfig;
use tracing::{info, warn};

use crate::capture::{self, AudioFormat, AudioFrame, CaptureSource, Geometry, VideoFrame};
use crate::input::{Keyboard, LoggingKeyboard, LoggingMouse, Mouse};

pub type VideoSource = Box<dyn CaptureSource<VideoFrame>>;
pub type AudioSource = Box<dyn CaptureSource<AudioFrame>>;

/// Audio format produced by every bundled audio source.
pub const AUDIO_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48_000,
    channels: 2,
};

/// Per-platform source of capture and input devices. One instance is built
/// at startup and every session acquires its own devices from it.
pub trait DeviceFactory: Send + Sync {
    fn video_source(&self) -> Result<VideoSource>;
    /// `None` when audio is disabled or unsupported.
    fn audio_source(&self) -> Result<Option<AudioSource>>;
    fn keyboard(&self) -> Result<Option<Box<dyn Keyboard>>>;
    fn mouse(&self) -> Result<Option<Box<dyn Mouse>>>;
}

/// Devices held by one session.
pub struct Devices {
    pub video: VideoSource,
    pub audio: Option<AudioSource>,
    pub keyboard: Option<Box<dyn Keyboard>>,
    pub mouse: Option<Box<dyn Mouse>>,
}

impl Devices {
    /// Acquire everything a session needs. On failure, devices acquired so
    /// far are released before the error is returned.
    pub fn acquire(factory: &dyn DeviceFactory) -> Result<Self> {
        let video = factory.video_source().context("Failed to open video source")?;
        let audio = factory.audio_source().context("Failed to open audio source")?;
        let keyboard = factory.keyboard().context("Failed to open keyboard")?;
        let mouse = factory.mouse().context("Failed to open mouse")?;
        Ok(Self {
            video,
            audio,
            keyboard,
            mouse,
        })
    }

    pub fn start_capture(&mut self) -> Result<()> {
        self.video.start().context("Failed to start video capture")?;
        if let Some(audio) = self.audio.as_mut() {
            audio.start().context("Failed to start audio capture")?;
        }
        Ok(())
    }

    /// Stop every source. Each stop is attempted even if an earlier one fails.
    pub fn stop_capture(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Err(e) = self.video.stop() {
            warn!("Failed to stop video capture: {e:#}");
            first_err.get_or_insert(e);
        }
        if let Some(audio) = self.audio.as_mut()
            && let Err(e) = audio.stop()
        {
            warn!("Failed to stop audio capture: {e:#}");
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Test-pattern video, a sine tone, and logging input sinks.
pub struct SyntheticDevices {
    geometry: Geometry,
    framerate: u32,
    audio: bool,
}

impl SyntheticDevices {
    pub fn new(geometry: Geometry, framerate: u32, audio: bool) -> Self {
        Self {
            geometry,
            framerate,
            audio,
        }
    }
}

impl DeviceFactory for SyntheticDevices {
    fn video_source(&self) -> Result<VideoSource> {
        Ok(Box::new(capture::test_pattern(self.geometry, self.framerate)))
    }

    fn audio_source(&self) -> Result<Option<AudioSource>> {
        if !self.audio {
            return Ok(None);
        }
        Ok(Some(Box::new(capture::tone(AUDIO_FORMAT))))
    }

    fn keyboard(&self) -> Result<Option<Box<dyn Keyboard>>> {
        Ok(Some(Box::new(LoggingKeyboard::default())))
    }

    fn mouse(&self) -> Result<Option<Box<dyn Mouse>>> {
        Ok(Some(Box::new(LoggingMouse::default())))
    }
}

/// Select the device backend named by `[capture].backend`.
pub fn platform_devices(config: &PeriscopeConfig) -> Result<Arc<dyn DeviceFactory>> {
    match config.capture.backend.as_str() {
        "test-pattern" => {
            let geometry = Geometry::new(config.capture.width, config.capture.height);
            info!(%geometry, audio = config.audio.enabled, "Using test-pattern devices");
            Ok(Arc::new(SyntheticDevices::new(
                geometry,
                config.video.framerate,
                config.audio.enabled,
            )))
        }
        other => bail!("Unknown capture backend '{other}'"),
    }
}
