use std::sync::OnceLock;

use anyhow::{Context, bail};
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSrc};
use tracing::{debug, info, warn};

use crate::capture::{AudioFormat, AudioFrame, Geometry, VideoFrame};
use crate::h264;
use crate::pipeline::{Codec, CodecFactory, EncodedUnit, EncoderParams};

/// Opus frame duration used for every audio unit.
const OPUS_FRAME_MS: u32 = 20;
/// Largest Opus packet we accept from the encoder.
const OPUS_MAX_PACKET: usize = 4000;
/// Upper bound on how long one encode call waits for the first sample.
const MAX_SAMPLE_WAIT_MS: u64 = 50;

/// Detected encoder family, selects the pipeline shape and properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    Nvidia,
    VaApi,
    Software,
}

/// Builds GStreamer H.264 encoders, one per frame geometry.
pub struct GstH264Factory {
    preferred: Option<String>,
    detected: OnceLock<(EncoderType, String)>,
}

impl GstH264Factory {
    pub fn new(preferred: Option<String>) -> Self {
        Self {
            preferred,
            detected: OnceLock::new(),
        }
    }

    fn encoder(&self) -> anyhow::Result<(EncoderType, String)> {
        if let Some(found) = self.detected.get() {
            return Ok(found.clone());
        }
        gst::init().context("Failed to initialize GStreamer")?;
        let found = detect_encoder(self.preferred.as_deref())?;
        Ok(self.detected.get_or_init(|| found).clone())
    }
}

impl CodecFactory<VideoFrame> for GstH264Factory {
    fn probe(&self) -> anyhow::Result<()> {
        self.encoder().map(|_| ())
    }

    fn build(
        &self,
        geometry: Geometry,
        params: &EncoderParams,
    ) -> anyhow::Result<Box<dyn Codec<VideoFrame>>> {
        let (encoder_type, name) = self.encoder()?;
        Ok(Box::new(GstH264Codec::new(
            encoder_type,
            &name,
            geometry,
            params,
        )?))
    }
}

pub struct GstH264Codec {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    frame_duration: ClockTime,
    sample_wait: ClockTime,
    frames: u64,
}

impl GstH264Codec {
    fn new(
        encoder_type: EncoderType,
        encoder_name: &str,
        geometry: Geometry,
        params: &EncoderParams,
    ) -> anyhow::Result<Self> {
        let Geometry { width, height } = geometry;
        let framerate = params.framerate.max(1);
        info!(
            ?encoder_type,
            encoder_name,
            width,
            height,
            framerate,
            bitrate = params.bitrate_kbps,
            "Creating H.264 encoder pipeline"
        );

        let pipeline = gst::Pipeline::new();

        // nvh264enc takes BGRA directly and converts on the GPU; the padding
        // byte is ignored either way.
        let format = match encoder_type {
            EncoderType::Nvidia => "BGRA",
            _ => "BGRx",
        };
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", format)
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(framerate as i32, 1))
            .build();

        let appsrc = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // The frame queue upstream already bounds memory; never block here.
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        let encoder = build_encoder_element(encoder_type, encoder_name, params.bitrate_kbps)?;

        // Constrained baseline matches the profile registered in the SDP.
        let profile_caps = gst::Caps::builder("video/x-h264")
            .field("profile", "constrained-baseline")
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &profile_caps)
            .build()
            .context("Failed to create profile capsfilter")?;

        // Inline SPS/PPS with every keyframe so a forced IDR is decodable alone.
        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .context("Failed to create h264parse")?;

        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .name("parse-caps")
            .property("caps", &parse_caps)
            .build()
            .context("Failed to create h264parse output capsfilter")?;

        let appsink = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("max-buffers", 8u32)
            .property("drop", false)
            .build()
            .context("Failed to create appsink")?
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let mut chain: Vec<gst::Element> = vec![appsrc.clone().upcast()];
        if encoder_type != EncoderType::Nvidia {
            chain.push(
                ElementFactory::make("videoconvert")
                    .build()
                    .context("Failed to create videoconvert")?,
            );
        }
        chain.push(encoder);
        if encoder_type != EncoderType::Nvidia {
            chain.push(capsfilter);
        }
        chain.push(parser);
        chain.push(parse_capsfilter);
        chain.push(appsink.clone().upcast());

        pipeline
            .add_many(chain.iter())
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many(chain.iter()).context("Failed to link pipeline elements")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing")?;

        let frame_duration = ClockTime::from_nseconds(1_000_000_000 / framerate as u64);
        let sample_wait = ClockTime::from_mseconds(
            (2 * 1000 / framerate as u64).min(MAX_SAMPLE_WAIT_MS),
        );
        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            frame_duration,
            sample_wait,
            frames: 0,
        })
    }

    fn check_bus(&self) -> anyhow::Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) =
            bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning])
        {
            match msg.view() {
                gst::MessageView::Error(err) => bail!(
                    "GStreamer pipeline error from {:?}: {} ({:?})",
                    err.src().map(|s| s.name().to_string()),
                    err.error(),
                    err.debug()
                ),
                gst::MessageView::Warning(w) => warn!(
                    source = ?w.src().map(|s| s.name().to_string()),
                    warning = %w.error(),
                    "GStreamer pipeline warning"
                ),
                _ => {}
            }
        }
        Ok(())
    }

    fn to_unit(sample: &gst::Sample) -> anyhow::Result<EncodedUnit> {
        let buffer = sample.buffer().context("Sample without buffer")?;
        let map = buffer
            .map_readable()
            .map_err(|_| anyhow::anyhow!("Failed to map encoded buffer"))?;
        let data = Bytes::copy_from_slice(map.as_slice());
        let keyframe =
            !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) || h264::contains_idr(&data);
        Ok(EncodedUnit { data, keyframe })
    }
}

impl Codec<VideoFrame> for GstH264Codec {
    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_keyframe: bool,
    ) -> anyhow::Result<Vec<EncodedUnit>> {
        if force_keyframe {
            // Travels upstream from the sink to the encoder.
            let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !self.appsink.send_event(event) {
                warn!("Encoder did not accept force-key-unit event");
            }
            debug!("Forced IDR keyframe");
        }

        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(self.frame_duration * self.frames);
            buffer.set_duration(self.frame_duration);
        }
        self.frames += 1;
        self.appsrc
            .push_buffer(buffer)
            .context("Failed to push buffer to appsrc")?;
        self.check_bus()?;

        let mut units = Vec::new();
        let mut wait = self.sample_wait;
        while let Some(sample) = self.appsink.try_pull_sample(wait) {
            units.push(Self::to_unit(&sample)?);
            wait = ClockTime::ZERO;
        }
        Ok(units)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let _ = self.appsrc.end_of_stream();
        self.pipeline
            .set_state(gst::State::Null)
            .context("Failed to stop encoder pipeline")?;
        debug!(frames = self.frames, "Encoder pipeline stopped");
        Ok(())
    }
}

impl Drop for GstH264Codec {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Instantiating proves the plugin and its driver are both usable; a
/// registry lookup only proves the plugin file exists.
fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

fn detect_encoder(preferred: Option<&str>) -> anyhow::Result<(EncoderType, String)> {
    if let Some(pref) = preferred {
        let enc_type = encoder_type_for(pref)?;
        if can_instantiate(pref) {
            info!(encoder = pref, "Using preferred encoder from config");
            return Ok((enc_type, pref.to_string()));
        }
        warn!(
            encoder = pref,
            "Preferred encoder not available, falling back to auto-detect"
        );
    }

    let candidates = [
        (EncoderType::Nvidia, "nvh264enc"),
        (EncoderType::VaApi, "vah264enc"),
        (EncoderType::Software, "x264enc"),
    ];
    for (enc_type, name) in &candidates {
        if can_instantiate(name) {
            info!(encoder = name, "Found working encoder");
            return Ok((*enc_type, name.to_string()));
        }
        debug!(encoder = name, "Encoder not available, trying next");
    }

    bail!("No H.264 encoder found. Install gstreamer plugins (good/bad/ugly).")
}

fn encoder_type_for(name: &str) -> anyhow::Result<EncoderType> {
    match name {
        "nvh264enc" => Ok(EncoderType::Nvidia),
        "vah264enc" => Ok(EncoderType::VaApi),
        "x264enc" => Ok(EncoderType::Software),
        _ => bail!("Unknown encoder: {name}. Use nvh264enc, vah264enc, or x264enc."),
    }
}

/// Keyframes are only produced on demand, so each family gets the longest
/// GOP it supports.
fn build_encoder_element(
    encoder_type: EncoderType,
    name: &str,
    bitrate: u32,
) -> anyhow::Result<gst::Element> {
    let elem = match encoder_type {
        EncoderType::Nvidia => ElementFactory::make(name)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", bitrate)
            .property("gop-size", -1i32)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create nvh264enc")?,
        EncoderType::VaApi => ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("target-usage", 7u32)
            .property("key-int-max", 1024u32)
            .build()
            .context("Failed to create vah264enc")?,
        EncoderType::Software => ElementFactory::make(name)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate)
            .property("key-int-max", i32::MAX as u32)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create x264enc")?,
    };
    Ok(elem)
}

/// Builds Opus encoders. libopus is linked in, so probing always succeeds.
pub struct OpusFactory {
    bitrate_kbps: u32,
}

impl OpusFactory {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self { bitrate_kbps }
    }
}

impl CodecFactory<AudioFrame> for OpusFactory {
    fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn build(
        &self,
        format: AudioFormat,
        _params: &EncoderParams,
    ) -> anyhow::Result<Box<dyn Codec<AudioFrame>>> {
        Ok(Box::new(OpusCodec::new(format, self.bitrate_kbps)?))
    }
}

/// Accumulates PCM and emits one Opus packet per full 20 ms.
pub struct OpusCodec {
    encoder: OpusEncoder,
    frame_len: usize,
    pcm: Vec<i16>,
    out: Vec<u8>,
}

impl OpusCodec {
    pub fn new(format: AudioFormat, bitrate_kbps: u32) -> anyhow::Result<Self> {
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => bail!("Unsupported channel count: {other}"),
        };
        let sample_rate = match format.sample_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            12000 => SampleRate::Hz12000,
            8000 => SampleRate::Hz8000,
            other => bail!("Unsupported sample rate for Opus: {other}"),
        };

        let mut encoder = OpusEncoder::new(sample_rate, channels, Application::LowDelay)
            .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond((bitrate_kbps * 1000) as i32))
            .map_err(|e| anyhow::anyhow!("Failed to set Opus bitrate: {e:?}"))?;

        let frame_len =
            (format.sample_rate * OPUS_FRAME_MS / 1000) as usize * format.channels as usize;
        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            bitrate_kbps,
            "Opus encoder initialized"
        );
        Ok(Self {
            encoder,
            frame_len,
            pcm: Vec::with_capacity(frame_len * 2),
            out: vec![0u8; OPUS_MAX_PACKET],
        })
    }
}

impl Codec<AudioFrame> for OpusCodec {
    fn encode(&mut self, frame: &AudioFrame, _force: bool) -> anyhow::Result<Vec<EncodedUnit>> {
        self.pcm.extend_from_slice(&frame.samples);
        let mut units = Vec::new();
        let mut offset = 0;
        while self.pcm.len() - offset >= self.frame_len {
            let chunk = &self.pcm[offset..offset + self.frame_len];
            let len = self
                .encoder
                .encode(chunk, &mut self.out)
                .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
            units.push(EncodedUnit {
                data: Bytes::copy_from_slice(&self.out[..len]),
                // Every Opus packet decodes on its own.
                keyframe: true,
            });
            offset += self.frame_len;
        }
        self.pcm.drain(..offset);
        Ok(units)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.pcm.clear();
        Ok(())
    }
}
