//! RTP media senders.
//!
//! Each sender owns one encode pipeline and one outbound track. Once started
//! it runs two tasks: the send loop packetizes every unit the pipeline yields
//! and writes the packets to the track, and the feedback loop drains RTCP
//! from the transport, forcing a keyframe on PLI or FIR.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::codecs::opus::OpusPayloader;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::{Packetizer, Payloader, new_packetizer};
use webrtc::rtp::sequence::new_random_sequencer;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::capture::{AudioFrame, VideoFrame};
use crate::pipeline::{EncodePipeline, EncodedUnit, KeyframeControl};

/// Largest RTP packet the packetizer emits.
pub const RTP_MTU: usize = 1400;

const STREAM_ID: &str = "periscope";

pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Codec parameters a sender registers with the media engine.
#[derive(Debug, Clone)]
pub struct CodecSpec {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub capability: RTCRtpCodecCapability,
    /// Retransmission stream payload type, bound to `payload_type` via `apt`
    pub rtx_payload_type: Option<u8>,
}

impl CodecSpec {
    /// H.264 constrained baseline, packetization mode 1, with RTX.
    pub fn h264() -> Self {
        let feedback = [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
            .into_iter()
            .map(|(typ, parameter)| RTCPFeedback {
                typ: typ.to_string(),
                parameter: parameter.to_string(),
            })
            .collect();
        Self {
            kind: MediaKind::Video,
            payload_type: 102,
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: feedback,
            },
            rtx_payload_type: Some(121),
        }
    }

    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            payload_type: 111,
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            rtx_payload_type: None,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.capability.clock_rate
    }

    fn codec_type(&self) -> RTPCodecType {
        match self.kind {
            MediaKind::Video => RTPCodecType::Video,
            MediaKind::Audio => RTPCodecType::Audio,
        }
    }

    /// Add this codec (and its RTX companion) to `engine`. Must happen
    /// before the peer connection is built.
    pub fn register(&self, engine: &mut MediaEngine) -> Result<()> {
        engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: self.capability.clone(),
                    payload_type: self.payload_type,
                    ..Default::default()
                },
                self.codec_type(),
            )
            .with_context(|| format!("Failed to register {} codec", self.capability.mime_type))?;

        if let Some(rtx) = self.rtx_payload_type {
            engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: format!("{}/rtx", self.kind.as_str()),
                            clock_rate: self.capability.clock_rate,
                            channels: 0,
                            sdp_fmtp_line: format!("apt={}", self.payload_type),
                            rtcp_feedback: vec![],
                        },
                        payload_type: rtx,
                        ..Default::default()
                    },
                    self.codec_type(),
                )
                .context("Failed to register RTX codec")?;
        }
        Ok(())
    }

    fn payloader(&self) -> Box<dyn Payloader + Send + Sync> {
        match self.kind {
            MediaKind::Video => Box::new(H264Payloader::default()),
            MediaKind::Audio => Box::new(OpusPayloader),
        }
    }
}

/// Encode pipeline feeding a sender.
pub enum SenderSource {
    Video(EncodePipeline<VideoFrame>),
    Audio(EncodePipeline<AudioFrame>),
}

impl SenderSource {
    async fn read(&mut self) -> Result<Option<EncodedUnit>> {
        match self {
            SenderSource::Video(p) => p.read().await,
            SenderSource::Audio(p) => p.read().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SenderSource::Video(p) => p.close().await,
            SenderSource::Audio(p) => p.close().await,
        }
    }

    fn keyframe_control(&self) -> KeyframeControl {
        match self {
            SenderSource::Video(p) => p.keyframe_control(),
            SenderSource::Audio(p) => p.keyframe_control(),
        }
    }
}

/// Destination for serialized RTP.
pub trait PacketWriter: Send + Sync + 'static {
    fn write_packet(&self, packet: &Packet) -> impl Future<Output = Result<()>> + Send;
}

impl PacketWriter for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        TrackLocalWriter::write_rtp(self, packet)
            .await
            .context("Failed to write RTP packet")?;
        Ok(())
    }
}

/// Reverse channel carrying RTCP reports for one sender.
pub trait FeedbackSource: Send + Sync + 'static {
    fn read_feedback(&self) -> impl Future<Output = Result<RtcpPackets>> + Send;
}

impl FeedbackSource for RTCRtpSender {
    async fn read_feedback(&self) -> Result<RtcpPackets> {
        let (packets, _attributes) = self.read_rtcp().await.context("RTCP read failed")?;
        Ok(packets)
    }
}

/// RTP timestamp increment for `elapsed` wall-clock time.
pub fn rtp_samples(elapsed: Duration, clock_rate: u32) -> u32 {
    (elapsed.as_secs_f64() * clock_rate as f64) as u32
}

/// Force a keyframe if any report is a PLI or FIR. Returns whether one was.
pub fn handle_feedback(packets: &RtcpPackets, keyframe: &KeyframeControl) -> bool {
    use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

    let mut requested = false;
    for pkt in packets {
        let pkt_any = pkt.as_any();
        if pkt_any.is::<PictureLossIndication>() || pkt_any.is::<FullIntraRequest>() {
            requested = true;
        }
    }
    if requested {
        debug!("Received PLI/FIR keyframe request");
        keyframe.force();
    }
    requested
}

/// Packetize and write units until the pipeline ends, a write fails, or
/// `cancel` fires. Hands the source back so the caller can close it.
pub async fn run_send_loop<P, W>(
    mut source: SenderSource,
    mut packetizer: P,
    writer: Arc<W>,
    clock_rate: u32,
    cancel: CancellationToken,
) -> SenderSource
where
    P: Packetizer + Send,
    W: PacketWriter,
{
    let mut last_read = Instant::now();
    let mut units = 0u64;
    'units: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = source.read() => read,
        };
        let unit = match read {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                debug!(units, "Encode pipeline ended");
                break;
            }
            Err(e) => {
                warn!(units, "Encode pipeline read failed: {e:#}");
                break;
            }
        };

        let now = Instant::now();
        let samples = rtp_samples(now - last_read, clock_rate);
        last_read = now;

        let packets = match packetizer.packetize(&unit.data, samples) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Packetization failed: {e}");
                break;
            }
        };
        for packet in &packets {
            if let Err(e) = writer.write_packet(packet).await {
                warn!("{e:#}");
                break 'units;
            }
        }
        units += 1;
    }
    source
}

/// Read RTCP until the transport closes or `cancel` fires.
pub async fn run_feedback_loop<S: FeedbackSource>(
    source: Arc<S>,
    keyframe: KeyframeControl,
    cancel: CancellationToken,
) {
    let mut requests = 0u64;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = source.read_feedback() => read,
        };
        match read {
            Ok(packets) => {
                if handle_feedback(&packets, &keyframe) {
                    requests += 1;
                }
            }
            Err(e) => {
                debug!("Feedback loop ended: {e:#}");
                break;
            }
        }
    }
    debug!(requests, "Feedback loop exited");
}

pub struct MediaSender {
    spec: CodecSpec,
    source: Option<SenderSource>,
    keyframe: KeyframeControl,
    track: Arc<TrackLocalStaticRTP>,
    rtp_sender: Option<Arc<RTCRtpSender>>,
    cancel: CancellationToken,
    send_task: Option<JoinHandle<SenderSource>>,
    feedback_task: Option<JoinHandle<()>>,
}

impl MediaSender {
    pub fn new(spec: CodecSpec, source: SenderSource) -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            spec.capability.clone(),
            spec.kind.as_str().to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            keyframe: source.keyframe_control(),
            spec,
            source: Some(source),
            track,
            rtp_sender: None,
            cancel: CancellationToken::new(),
            send_task: None,
            feedback_task: None,
        }
    }

    pub fn video(pipeline: EncodePipeline<VideoFrame>) -> Self {
        Self::new(CodecSpec::h264(), SenderSource::Video(pipeline))
    }

    pub fn audio(pipeline: EncodePipeline<AudioFrame>) -> Self {
        Self::new(CodecSpec::opus(), SenderSource::Audio(pipeline))
    }

    pub fn kind(&self) -> MediaKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &CodecSpec {
        &self.spec
    }

    pub fn keyframe_control(&self) -> KeyframeControl {
        self.keyframe.clone()
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Attach the transport sender returned by `add_track`. Its RTCP is read
    /// once the sender starts.
    pub fn attach(&mut self, rtp_sender: Arc<RTCRtpSender>) {
        self.rtp_sender = Some(rtp_sender);
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.send_task.is_some()
    }

    /// Launch the send and feedback loops. Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        self.start_with(Arc::clone(&self.track))
    }

    /// Like [`start`](Self::start), writing packets to `writer` instead of
    /// the track.
    #[cfg(test)]
    pub fn start_with_writer<W: PacketWriter>(&mut self, writer: Arc<W>) -> Result<()> {
        self.start_with(writer)
    }

    fn start_with<W: PacketWriter>(&mut self, writer: Arc<W>) -> Result<()> {
        if self.send_task.is_some() {
            return Ok(());
        }
        let source = self
            .source
            .take()
            .with_context(|| format!("{} sender already closed", self.spec.kind.as_str()))?;

        let ssrc = rand::random::<u32>();
        let packetizer = new_packetizer(
            RTP_MTU,
            self.spec.payload_type,
            ssrc,
            self.spec.payloader(),
            Box::new(new_random_sequencer()),
            self.spec.clock_rate(),
        );

        self.send_task = Some(tokio::spawn(run_send_loop(
            source,
            packetizer,
            writer,
            self.spec.clock_rate(),
            self.cancel.child_token(),
        )));

        if let Some(rtp_sender) = &self.rtp_sender {
            self.feedback_task = Some(tokio::spawn(run_feedback_loop(
                Arc::clone(rtp_sender),
                self.keyframe.clone(),
                self.cancel.child_token(),
            )));
        }

        info!(
            kind = self.spec.kind.as_str(),
            ssrc,
            payload_type = self.spec.payload_type,
            "Media sender started"
        );
        Ok(())
    }

    /// Stop both loops, close the pipeline, and stop the transport sender.
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        let mut first_err: Option<anyhow::Error> = None;

        let source = match self.send_task.take() {
            Some(task) => match task.await {
                Ok(source) => Some(source),
                Err(e) => {
                    first_err.get_or_insert(anyhow::anyhow!("Send loop panicked: {e}"));
                    None
                }
            },
            None => self.source.take(),
        };
        if let Some(mut source) = source
            && let Err(e) = source.close().await
        {
            warn!(kind = self.spec.kind.as_str(), "Failed to close encoder: {e:#}");
            first_err.get_or_insert(e);
        }

        if let Some(task) = self.feedback_task.take() {
            let _ = task.await;
        }

        if let Some(rtp_sender) = self.rtp_sender.take()
            && let Err(e) = rtp_sender.stop().await
        {
            warn!(kind = self.spec.kind.as_str(), "Failed to stop RTP sender: {e}");
            first_err.get_or_insert(e.into());
        }

        debug!(kind = self.spec.kind.as_str(), "Media sender closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::{FRAME_QUEUE_CAPACITY, Geometry, VideoFrame, frame_queue};
    use crate::pipeline::EncoderParams;
    use crate::pipeline::tests::FakeFactory;
    use bytes::Bytes;
    use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use rtcp::receiver_report::ReceiverReport;
    use std::sync::Mutex;

    const PARAMS: EncoderParams = EncoderParams {
        bitrate_kbps: 1000,
        framerate: 30,
    };

    /// Collects every packet a send loop writes.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub packets: Mutex<Vec<Packet>>,
    }

    impl Recorder {
        pub fn len(&self) -> usize {
            self.packets.lock().unwrap().len()
        }
    }

    impl PacketWriter for Recorder {
        async fn write_packet(&self, packet: &Packet) -> Result<()> {
            self.packets.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    fn idr(len: usize) -> Bytes {
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.resize(len, 0x11);
        Bytes::from(data)
    }

    fn video_frame(data: Bytes) -> VideoFrame {
        VideoFrame {
            geometry: Geometry::new(64, 64),
            data,
        }
    }

    fn pli() -> Box<dyn rtcp::packet::Packet + Send + Sync> {
        Box::new(PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 2,
        })
    }

    #[test]
    fn samples_follow_clock_rate() {
        assert_eq!(rtp_samples(Duration::from_millis(20), 48_000), 960);
        assert_eq!(rtp_samples(Duration::from_millis(100), 90_000), 9_000);
        assert_eq!(rtp_samples(Duration::ZERO, 90_000), 0);
    }

    #[test]
    fn codecs_register_with_media_engine() {
        let mut engine = MediaEngine::default();
        CodecSpec::h264().register(&mut engine).unwrap();
        CodecSpec::opus().register(&mut engine).unwrap();
    }

    #[test]
    fn codec_specs() {
        let video = CodecSpec::h264();
        assert_eq!(video.payload_type, 102);
        assert_eq!(video.rtx_payload_type, Some(121));
        assert_eq!(video.clock_rate(), 90_000);
        assert!(
            video
                .capability
                .rtcp_feedback
                .iter()
                .any(|f| f.typ == "nack" && f.parameter == "pli")
        );
        let audio = CodecSpec::opus();
        assert_eq!(audio.clock_rate(), 48_000);
        assert_eq!(audio.capability.channels, 2);
    }

    #[test]
    fn pli_and_fir_force_keyframe() {
        let control = KeyframeControl::new();
        let ignored: RtcpPackets = vec![Box::new(ReceiverReport::default())];
        assert!(!handle_feedback(&ignored, &control));
        assert!(!control.is_pending());

        assert!(handle_feedback(&vec![pli()], &control));
        assert!(control.is_pending());

        let control = KeyframeControl::new();
        let fir: RtcpPackets = vec![
            Box::new(ReceiverReport::default()),
            Box::new(FullIntraRequest {
                sender_ssrc: 1,
                media_ssrc: 2,
                fir: vec![],
            }),
        ];
        assert!(handle_feedback(&fir, &control));
        assert!(control.is_pending());
    }

    #[tokio::test]
    async fn pli_makes_next_unit_a_keyframe() {
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let mut pipeline =
            EncodePipeline::new(rx, Arc::new(FakeFactory::default()), PARAMS).unwrap();
        tx.push(video_frame(idr(10)));
        tx.push(video_frame(idr(10)));
        assert!(pipeline.read().await.unwrap().unwrap().keyframe);
        assert!(!pipeline.read().await.unwrap().unwrap().keyframe);

        handle_feedback(&vec![pli()], &pipeline.keyframe_control());
        tx.push(video_frame(idr(10)));
        assert!(pipeline.read().await.unwrap().unwrap().keyframe);
    }

    struct ScriptedFeedback {
        reports: Mutex<Vec<RtcpPackets>>,
    }

    impl FeedbackSource for ScriptedFeedback {
        async fn read_feedback(&self) -> Result<RtcpPackets> {
            match self.reports.lock().unwrap().pop() {
                Some(packets) => Ok(packets),
                None => anyhow::bail!("transport closed"),
            }
        }
    }

    #[tokio::test]
    async fn feedback_loop_forces_keyframe_then_exits() {
        let source = Arc::new(ScriptedFeedback {
            reports: Mutex::new(vec![vec![pli()], vec![Box::new(ReceiverReport::default())]]),
        });
        let control = KeyframeControl::new();
        run_feedback_loop(source, control.clone(), CancellationToken::new()).await;
        assert!(control.is_pending());
    }

    #[tokio::test]
    async fn send_loop_packetizes_in_order() {
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let pipeline =
            EncodePipeline::new(rx, Arc::new(FakeFactory::default()), PARAMS).unwrap();
        tx.push(video_frame(idr(3000)));
        tx.push(video_frame(idr(500)));
        drop(tx);

        let spec = CodecSpec::h264();
        let packetizer = new_packetizer(
            RTP_MTU,
            spec.payload_type,
            0xDEADBEEF,
            spec.payloader(),
            Box::new(new_random_sequencer()),
            spec.clock_rate(),
        );
        let recorder = Arc::new(Recorder::default());
        let source = run_send_loop(
            SenderSource::Video(pipeline),
            packetizer,
            Arc::clone(&recorder),
            spec.clock_rate(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(source, SenderSource::Video(_)));

        let packets = recorder.packets.lock().unwrap();
        // 3000 bytes needs fragmenting; 500 fits one packet.
        assert!(packets.len() >= 4, "got {} packets", packets.len());
        for pair in packets.windows(2) {
            assert_eq!(
                pair[1].header.sequence_number,
                pair[0].header.sequence_number.wrapping_add(1)
            );
        }
        assert!(packets.iter().all(|p| p.header.ssrc == 0xDEADBEEF));
        assert!(packets.iter().all(|p| p.header.payload_type == 102));
        assert!(packets.iter().all(|p| p.payload.len() <= RTP_MTU));

        let last = packets.last().unwrap();
        assert!(last.header.marker);
        let first_unit_ts = packets[0].header.timestamp;
        let first_unit_len = packets
            .iter()
            .take_while(|p| p.header.timestamp == first_unit_ts)
            .count();
        assert!(packets[first_unit_len - 1].header.marker);
    }

    #[tokio::test]
    async fn send_loop_stops_on_cancel() {
        let (_tx, rx) = frame_queue::<VideoFrame>(FRAME_QUEUE_CAPACITY);
        let pipeline =
            EncodePipeline::new(rx, Arc::new(FakeFactory::default()), PARAMS).unwrap();
        let spec = CodecSpec::h264();
        let packetizer = new_packetizer(
            RTP_MTU,
            spec.payload_type,
            1,
            spec.payloader(),
            Box::new(new_random_sequencer()),
            spec.clock_rate(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = tokio::time::timeout(
            Duration::from_secs(2),
            run_send_loop(
                SenderSource::Video(pipeline),
                packetizer,
                Arc::new(Recorder::default()),
                spec.clock_rate(),
                cancel,
            ),
        )
        .await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_close_closes_pipeline() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let pipeline = EncodePipeline::new(rx, Arc::clone(&factory) as _, PARAMS).unwrap();
        let mut sender = MediaSender::video(pipeline);
        assert_eq!(sender.kind(), MediaKind::Video);

        sender.start().unwrap();
        sender.start().unwrap();
        assert!(sender.is_started());

        tx.push(video_frame(idr(100)));
        // Give the send loop a chance to build the codec.
        for _ in 0..50 {
            if !factory.builds.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        sender.close().await.unwrap();
        assert!(sender.start().is_err());
        let builds = factory.builds.lock().unwrap().len() as u32;
        assert_eq!(*factory.closes.lock().unwrap(), builds);
    }

    #[tokio::test]
    async fn close_without_start_closes_pipeline() {
        let (_tx, rx) = frame_queue::<VideoFrame>(FRAME_QUEUE_CAPACITY);
        let pipeline =
            EncodePipeline::new(rx, Arc::new(FakeFactory::default()), PARAMS).unwrap();
        let mut sender = MediaSender::video(pipeline);
        sender.close().await.unwrap();
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn timestamps_follow_wall_clock_between_reads() {
        let (tx, rx) = frame_queue(FRAME_QUEUE_CAPACITY);
        let pipeline =
            EncodePipeline::new(rx, Arc::new(FakeFactory::default()), PARAMS).unwrap();
        let spec = CodecSpec::h264();
        let packetizer = new_packetizer(
            RTP_MTU,
            spec.payload_type,
            7,
            spec.payloader(),
            Box::new(new_random_sequencer()),
            spec.clock_rate(),
        );
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(run_send_loop(
            SenderSource::Video(pipeline),
            packetizer,
            Arc::clone(&recorder),
            spec.clock_rate(),
            CancellationToken::new(),
        ));

        // Irregular spacing; a nominal 30 fps clock would advance 3000 per unit.
        for gap_ms in [100, 250, 50] {
            tx.push(video_frame(idr(100)));
            tokio::time::sleep(Duration::from_millis(gap_ms)).await;
        }
        tx.push(video_frame(idr(100)));
        drop(tx);
        task.await.unwrap();

        let packets = recorder.packets.lock().unwrap();
        assert_eq!(packets.len(), 4, "one packet per small unit");
        let deltas: Vec<u32> = packets
            .windows(2)
            .map(|pair| pair[1].header.timestamp.wrapping_sub(pair[0].header.timestamp))
            .collect();

        let near = |expected: u32| {
            let tolerance = expected * 2 / 5;
            deltas
                .iter()
                .any(|d| d.abs_diff(expected) <= tolerance)
        };
        assert!(near(9_000), "no ~100 ms step in {deltas:?}");
        assert!(near(22_500), "no ~250 ms step in {deltas:?}");
        assert!(deltas.iter().all(|d| *d != 3_000), "fixed frame step in {deltas:?}");
    }
}
