//! Per-connection session lifecycle.
//!
//! A connection starts unauthenticated. Every message other than a valid
//! `auth` is answered with `auth_failure`, and no device is touched until a
//! token verifies. The session then acquires its devices, builds the
//! encode pipelines and senders, sends the offer and starts capture. From
//! there a single task dispatches client messages and peer-connection events
//! until the client hangs up, the peer fails fatally, or the session is
//! terminated through the registry.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use periscope_protocol::{Decoded, Message, SessionInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::capture::{AudioFrame, VideoFrame};
use crate::channel::MessageChannel;
use crate::devices::{DeviceFactory, Devices};
use crate::negotiation::{Negotiation, NegotiationFactory, PeerEvent};
use crate::pipeline::{CodecFactory, EncodePipeline, EncoderParams};
use crate::registry::{RegistryError, SessionRegistry};
use crate::sender::MediaSender;

/// Reply to any message received before authentication.
pub const NOT_AUTHENTICATED: &str = "session is not authenticated yet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Negotiating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingAuth => "awaiting_auth",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Process-wide collaborators shared by every session.
pub struct SessionContext<N> {
    pub authenticator: Arc<Authenticator>,
    pub registry: Arc<SessionRegistry>,
    pub devices: Arc<dyn DeviceFactory>,
    pub video_codec: Arc<dyn CodecFactory<VideoFrame>>,
    pub audio_codec: Arc<dyn CodecFactory<AudioFrame>>,
    pub video_params: EncoderParams,
    pub audio_params: EncoderParams,
    pub negotiations: N,
}

/// Run a connection from first message to teardown.
pub async fn serve<C, N>(ctx: Arc<SessionContext<N>>, mut channel: C)
where
    C: MessageChannel,
    N: NegotiationFactory,
{
    let username = match await_auth(&mut channel, &ctx.authenticator).await {
        Ok(Some(username)) => username,
        Ok(None) => {
            debug!("Channel closed before authentication");
            let _ = channel.close().await;
            return;
        }
        Err(e) => {
            warn!("Channel failed before authentication: {e:#}");
            let _ = channel.close().await;
            return;
        }
    };

    let session = match Session::establish(&ctx, channel, username.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%username, "Failed to establish session: {e:#}");
            return;
        }
    };
    if let Err(e) = session.run().await {
        warn!("Session ended with error: {e:#}");
    }
}

/// Read until a valid `auth` arrives. Returns the authenticated user, or
/// `None` if the client hung up first.
pub async fn await_auth<C: MessageChannel>(
    channel: &mut C,
    authenticator: &Authenticator,
) -> Result<Option<String>> {
    loop {
        let Some(decoded) = channel.recv().await? else {
            return Ok(None);
        };
        let error = match decoded {
            Decoded::Message(Message::Auth { token }) => {
                match authenticator.validate_token(&token) {
                    Ok(username) => {
                        info!(%username, "Session authenticated");
                        return Ok(Some(username));
                    }
                    Err(e) => {
                        warn!(target: "audit", "Session token rejected: {e}");
                        e.to_string()
                    }
                }
            }
            other => {
                debug!(kind = decoded_kind(&other), "Message before authentication");
                NOT_AUTHENTICATED.to_string()
            }
        };
        channel.send(&Message::AuthFailure { error }).await?;
    }
}

fn decoded_kind(decoded: &Decoded) -> &str {
    match decoded {
        Decoded::Message(msg) => msg.kind(),
        Decoded::Unrecognized(value) => value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<untyped>"),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Session<C, N> {
    id: Uuid,
    username: String,
    state: SessionState,
    channel: C,
    negotiation: N,
    devices: Devices,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl<C: MessageChannel, N: Negotiation> Session<C, N> {
    /// Acquire devices, wire the senders into a negotiation, send the offer,
    /// start capture and register. On failure everything acquired so far is
    /// released, the channel is closed and nothing is registered.
    pub async fn establish<F>(
        ctx: &SessionContext<F>,
        mut channel: C,
        username: String,
    ) -> Result<Self>
    where
        F: NegotiationFactory<Negotiation = N>,
    {
        match Self::prepare(ctx, &mut channel, &username).await {
            Ok((negotiation, devices, events)) => {
                let session = Self {
                    id: Uuid::new_v4(),
                    username,
                    state: SessionState::Negotiating,
                    channel,
                    negotiation,
                    devices,
                    events,
                    cancel: CancellationToken::new(),
                    registry: Arc::clone(&ctx.registry),
                };
                session.register().await
            }
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn prepare<F>(
        ctx: &SessionContext<F>,
        channel: &mut C,
        username: &str,
    ) -> Result<(N, Devices, mpsc::UnboundedReceiver<PeerEvent>)>
    where
        F: NegotiationFactory<Negotiation = N>,
    {
        if !ctx.registry.has_capacity().await {
            return Err(RegistryError::Full(ctx.registry.max_sessions()).into());
        }

        let mut devices = Devices::acquire(ctx.devices.as_ref())?;
        let mut senders = Vec::with_capacity(2);

        let frames = devices
            .video
            .take_frames()
            .context("Video source has no frame queue")?;
        let pipeline = EncodePipeline::new(frames, Arc::clone(&ctx.video_codec), ctx.video_params)
            .context("Failed to build video pipeline")?;
        senders.push(MediaSender::video(pipeline));

        if let Some(audio) = devices.audio.as_mut() {
            let frames = audio.take_frames().context("Audio source has no frame queue")?;
            let pipeline =
                EncodePipeline::new(frames, Arc::clone(&ctx.audio_codec), ctx.audio_params)
                    .context("Failed to build audio pipeline")?;
            senders.push(MediaSender::audio(pipeline));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut negotiation = ctx
            .negotiations
            .create(senders, events_tx)
            .await
            .context("Failed to create peer connection")?;

        let offered = async {
            let sdp = negotiation.offer().await?;
            channel
                .send(&Message::Offer {
                    sdp,
                    ice_servers: negotiation.ice_servers(),
                })
                .await?;
            devices.start_capture()
        }
        .await;

        if let Err(e) = offered {
            let _ = devices.stop_capture();
            let _ = negotiation.close().await;
            return Err(e);
        }
        info!(%username, "Offer sent, capture started");
        Ok((negotiation, devices, events))
    }

    async fn register(mut self) -> Result<Self> {
        let info = SessionInfo {
            id: self.id,
            username: self.username.clone(),
            state: self.state.as_str().to_string(),
            created_at: unix_now(),
        };
        if let Err(e) = self.registry.insert(info, self.cancel.clone()).await {
            let _ = self.devices.stop_capture();
            let _ = self.negotiation.close().await;
            let _ = self.channel.close().await;
            self.state = SessionState::Closed;
            return Err(e.into());
        }
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Dispatch until the client hangs up or the session is terminated,
    /// then tear down.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.dispatch_loop().await;
        if let Err(e) = &outcome {
            warn!(session_id = %self.id, "Session failed: {e:#}");
        }
        let closed = self.close().await;
        outcome.and(closed)
    }

    async fn dispatch_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(session_id = %self.id, "Session terminated");
                    return Ok(());
                }
                Some(event) = self.events.recv() => self.handle_peer_event(event).await?,
                received = self.channel.recv() => match received {
                    Ok(Some(decoded)) => self.dispatch(decoded).await?,
                    Ok(None) => {
                        info!(session_id = %self.id, "Client disconnected");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(session_id = %self.id, "Channel read failed: {e:#}");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.registry.set_state(self.id, state.as_str()).await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Connected => {
                self.negotiation
                    .start_senders()
                    .context("Failed to start media senders")?;
                if self.state != SessionState::Active {
                    info!(session_id = %self.id, "Peer connected, streaming");
                    self.set_state(SessionState::Active).await;
                }
            }
            other => debug!(session_id = %self.id, event = ?other, "Peer state observed"),
        }
        Ok(())
    }

    async fn dispatch(&mut self, decoded: Decoded) -> Result<()> {
        let message = match decoded {
            Decoded::Message(message) => message,
            unrecognized @ Decoded::Unrecognized(_) => {
                let kind = decoded_kind(&unrecognized);
                debug!(session_id = %self.id, kind, "Ignoring unrecognized message");
                return Ok(());
            }
        };

        match message {
            Message::Answer { sdp } => self.negotiation.set_answer(sdp).await?,
            Message::IceCandidate { candidate } => {
                self.negotiation.add_ice_candidate(candidate).await?
            }
            Message::Keyboard { event } => match self.devices.keyboard.as_mut() {
                Some(keyboard) => {
                    if let Err(e) = keyboard.key(&event) {
                        warn!(session_id = %self.id, "Key injection failed: {e:#}");
                    }
                }
                None => debug!(session_id = %self.id, "No keyboard, dropping key event"),
            },
            Message::MouseMove { x, y } => {
                if let Some(mouse) = self.devices.mouse.as_mut()
                    && let Err(e) = mouse.move_to(x, y)
                {
                    warn!(session_id = %self.id, "Mouse move failed: {e:#}");
                }
            }
            Message::MouseButton { button, x, y, down } => {
                if let Some(mouse) = self.devices.mouse.as_mut()
                    && let Err(e) = mouse.button(button, x, y, down)
                {
                    warn!(session_id = %self.id, "Mouse button failed: {e:#}");
                }
            }
            Message::MouseWheel {
                delta_x,
                delta_y,
                delta_z,
            } => {
                if let Some(mouse) = self.devices.mouse.as_mut()
                    && let Err(e) = mouse.wheel(delta_x, delta_y, delta_z)
                {
                    warn!(session_id = %self.id, "Mouse wheel failed: {e:#}");
                }
            }
            other @ (Message::Auth { .. } | Message::AuthFailure { .. } | Message::Offer { .. }) => {
                debug!(session_id = %self.id, kind = other.kind(), "Ignoring unexpected message");
            }
        }
        Ok(())
    }

    /// Tear down: channel, capture, then negotiation (senders and peer
    /// connection), and finally the registry entry. Each step runs even if an
    /// earlier one fails. Closing twice is an error.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            bail!("session {} already closed", self.id);
        }
        self.set_state(SessionState::Closing).await;
        self.cancel.cancel();
        let mut first_err: Option<anyhow::Error> = None;

        if let Err(e) = self.channel.close().await {
            warn!(session_id = %self.id, "Failed to close channel: {e:#}");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.devices.stop_capture() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.negotiation.close().await {
            warn!(session_id = %self.id, "Failed to close negotiation: {e:#}");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.registry.remove(self.id).await {
            first_err.get_or_insert(e.into());
        }

        self.state = SessionState::Closed;
        info!(session_id = %self.id, username = %self.username, "Session closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::static_authenticator;
    use crate::capture::Geometry;
    use crate::channel::tests::{Client, MemoryChannel, memory_channel};
    use crate::devices::{AudioSource, SyntheticDevices, VideoSource};
    use crate::encoder::OpusFactory;
    use crate::input::{Keyboard, LoggingMouse, Mouse};
    use crate::pipeline::tests::FakeFactory;
    use crate::sender::tests::Recorder;
    use periscope_protocol::{IceCandidate, IceServerInfo, KeyEvent, KeyLocation};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    async fn wait_for(log: &Log, entry: &str) {
        for _ in 0..200 {
            if entries(log).iter().any(|e| e == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{entry} never logged; got {:?}", entries(log));
    }

    struct RecordingKeyboard(Log);

    impl Keyboard for RecordingKeyboard {
        fn key(&mut self, event: &KeyEvent) -> Result<()> {
            self.0.lock().unwrap().push(format!("key:{}", event.code));
            Ok(())
        }
    }

    /// Synthetic devices that log every acquisition.
    struct RecordingDevices {
        inner: SyntheticDevices,
        log: Log,
        fail: bool,
    }

    impl DeviceFactory for RecordingDevices {
        fn video_source(&self) -> Result<VideoSource> {
            self.log.lock().unwrap().push("video_source".into());
            if self.fail {
                bail!("display unavailable");
            }
            self.inner.video_source()
        }
        fn audio_source(&self) -> Result<Option<AudioSource>> {
            self.log.lock().unwrap().push("audio_source".into());
            self.inner.audio_source()
        }
        fn keyboard(&self) -> Result<Option<Box<dyn Keyboard>>> {
            self.log.lock().unwrap().push("keyboard".into());
            Ok(Some(Box::new(RecordingKeyboard(Arc::clone(&self.log)))))
        }
        fn mouse(&self) -> Result<Option<Box<dyn Mouse>>> {
            self.log.lock().unwrap().push("mouse".into());
            Ok(Some(Box::new(LoggingMouse::default())))
        }
    }

    /// Negotiation without a transport. Started senders write their RTP to
    /// a shared [`Recorder`].
    struct FakeNegotiation {
        log: Log,
        senders: Vec<MediaSender>,
        writer: Arc<Recorder>,
    }

    impl Negotiation for FakeNegotiation {
        async fn offer(&mut self) -> Result<String> {
            self.log.lock().unwrap().push("offer".into());
            Ok("v=0\r\nfake-offer\r\n".into())
        }
        async fn set_answer(&mut self, sdp: String) -> Result<()> {
            if sdp == "reject" {
                bail!("bad answer");
            }
            self.log.lock().unwrap().push(format!("answer:{sdp}"));
            Ok(())
        }
        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }
        fn start_senders(&mut self) -> Result<()> {
            for sender in &mut self.senders {
                sender.start_with_writer(Arc::clone(&self.writer))?;
            }
            self.log.lock().unwrap().push("start_senders".into());
            Ok(())
        }
        fn ice_servers(&self) -> Vec<IceServerInfo> {
            vec![IceServerInfo {
                urls: vec!["stun:stun.example.com:3478".into()],
                username: None,
                credential: None,
            }]
        }
        async fn close(&mut self) -> Result<()> {
            for sender in &mut self.senders {
                sender.close().await?;
            }
            self.log.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    struct FakeNegotiations {
        log: Log,
        events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
        packets: Arc<Recorder>,
    }

    impl FakeNegotiations {
        fn fire(&self, event: PeerEvent) {
            let events = self.events.lock().unwrap();
            events.as_ref().expect("no negotiation created").send(event).unwrap();
        }
    }

    impl NegotiationFactory for FakeNegotiations {
        type Negotiation = FakeNegotiation;

        async fn create(
            &self,
            senders: Vec<MediaSender>,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<FakeNegotiation> {
            *self.events.lock().unwrap() = Some(events);
            Ok(FakeNegotiation {
                log: Arc::clone(&self.log),
                senders,
                writer: Arc::clone(&self.packets),
            })
        }
    }

    struct Harness {
        ctx: Arc<SessionContext<FakeNegotiations>>,
        log: Log,
    }

    fn harness(max_sessions: usize, fail_devices: bool) -> Harness {
        let log: Log = Arc::default();
        let devices = RecordingDevices {
            inner: SyntheticDevices::new(Geometry::new(16, 16), 30, false),
            log: Arc::clone(&log),
            fail: fail_devices,
        };
        let params = EncoderParams {
            bitrate_kbps: 1000,
            framerate: 30,
        };
        let ctx = SessionContext {
            authenticator: Arc::new(static_authenticator()),
            registry: Arc::new(SessionRegistry::new(max_sessions)),
            devices: Arc::new(devices),
            video_codec: Arc::new(FakeFactory::default()),
            audio_codec: Arc::new(OpusFactory::new(64)),
            video_params: params,
            audio_params: params,
            negotiations: FakeNegotiations {
                log: Arc::clone(&log),
                events: Mutex::new(None),
                packets: Arc::default(),
            },
        };
        Harness {
            ctx: Arc::new(ctx),
            log,
        }
    }

    fn token() -> String {
        static_authenticator()
            .authenticate("alice", "wonderland")
            .unwrap()
    }

    fn key_event() -> Message {
        Message::Keyboard {
            event: KeyEvent {
                key: "a".into(),
                code: "KeyA".into(),
                location: KeyLocation::Standard,
                key_down: true,
            },
        }
    }

    fn spawn_session(h: &Harness) -> (Client, tokio::task::JoinHandle<()>) {
        let (channel, client): (MemoryChannel, Client) = memory_channel();
        let task = tokio::spawn(serve(Arc::clone(&h.ctx), channel));
        (client, task)
    }

    async fn next(client: &mut Client) -> Message {
        tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for server")
            .expect("server hung up")
    }

    async fn registered(registry: &SessionRegistry) -> Uuid {
        for _ in 0..200 {
            if let Some(info) = registry.list().await.first() {
                return info.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never registered");
    }

    #[tokio::test]
    async fn input_before_auth_is_rejected_and_never_forwarded() {
        let h = harness(4, false);
        let (mut client, task) = spawn_session(&h);

        client.send(&key_event());
        client.send(&Message::MouseMove { x: 1, y: 1 });
        client.send_raw(r#"{"type":"clipboard","text":"x"}"#);
        for _ in 0..3 {
            assert_eq!(
                next(&mut client).await,
                Message::AuthFailure {
                    error: NOT_AUTHENTICATED.into()
                }
            );
        }
        assert!(client.try_recv().is_none());
        assert!(entries(&h.log).is_empty(), "devices touched before auth");

        client.hang_up();
        task.await.unwrap();
        assert!(entries(&h.log).is_empty());
        assert!(h.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn bad_tokens_get_reasons_then_auth_proceeds() {
        let h = harness(4, false);
        let (mut client, task) = spawn_session(&h);

        client.send(&Message::Auth {
            token: "garbage".into(),
        });
        let Message::AuthFailure { error } = next(&mut client).await else {
            panic!("expected auth_failure");
        };
        assert!(error.starts_with("invalid token"), "{error}");

        let expired = static_authenticator()
            .authenticate_at("alice", "wonderland", 1_000_000)
            .unwrap();
        client.send(&Message::Auth { token: expired });
        assert_eq!(
            next(&mut client).await,
            Message::AuthFailure {
                error: "token is expired".into()
            }
        );
        assert!(entries(&h.log).is_empty());

        client.send(&Message::Auth { token: token() });
        assert!(matches!(next(&mut client).await, Message::Offer { .. }));

        client.hang_up();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn full_handshake_then_streaming_then_hangup() {
        let h = harness(4, false);
        let (mut client, task) = spawn_session(&h);

        client.send(&Message::Auth { token: token() });
        let Message::Offer { sdp, ice_servers } = next(&mut client).await else {
            panic!("first reply after auth must be the offer");
        };
        assert!(sdp.contains("fake-offer"));
        assert_eq!(ice_servers.len(), 1);
        assert_eq!(
            entries(&h.log),
            vec!["video_source", "audio_source", "keyboard", "mouse", "offer"]
        );

        client.send(&Message::Answer { sdp: "answer-sdp".into() });
        client.send(&Message::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".into()),
                username_fragment: None,
            },
        });
        wait_for(&h.log, "candidate:candidate:1").await;

        let sessions = h.ctx.registry.list().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].username, "alice");
        assert_eq!(sessions[0].state, "negotiating");

        // Capture runs during negotiation, but nothing is sent before the
        // peer connects.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ctx.negotiations.packets.len(), 0);

        h.ctx.negotiations.fire(PeerEvent::Connected);
        wait_for(&h.log, "start_senders").await;
        for _ in 0..200 {
            if h.ctx.negotiations.packets.len() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.ctx.negotiations.packets.len() > 0, "no RTP after connect");
        let log = entries(&h.log);
        let answer = log.iter().position(|e| e == "answer:answer-sdp").unwrap();
        let candidate = log.iter().position(|e| e == "candidate:candidate:1").unwrap();
        assert!(answer < candidate);

        for _ in 0..100 {
            if h.ctx.registry.list().await[0].state == "active" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.ctx.registry.list().await[0].state, "active");

        client.send(&key_event());
        wait_for(&h.log, "key:KeyA").await;

        client.hang_up();
        task.await.unwrap();
        assert_eq!(entries(&h.log).last().map(String::as_str), Some("close"));
        assert!(h.ctx.registry.is_empty().await);
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn device_failure_aborts_without_registering() {
        let h = harness(4, true);
        let (mut client, task) = spawn_session(&h);
        client.send(&Message::Auth { token: token() });
        task.await.unwrap();
        assert_eq!(entries(&h.log), vec!["video_source"]);
        assert!(h.ctx.registry.is_empty().await);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_registry_rejects_before_acquiring_devices() {
        let h = harness(0, false);
        let (channel, _client) = memory_channel();
        let err = Session::<MemoryChannel, FakeNegotiation>::establish(&h.ctx, channel, "alice".into())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::Full(0))
        );
        assert!(entries(&h.log).is_empty());
    }

    #[tokio::test]
    async fn terminate_closes_session() {
        let h = harness(4, false);
        let (mut client, task) = spawn_session(&h);
        client.send(&Message::Auth { token: token() });
        assert!(matches!(next(&mut client).await, Message::Offer { .. }));

        let id = registered(&h.ctx.registry).await;
        h.ctx.registry.terminate(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.ctx.registry.is_empty().await);
        assert!(entries(&h.log).contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn rejected_answer_tears_session_down() {
        let h = harness(4, false);
        let (mut client, task) = spawn_session(&h);
        client.send(&Message::Auth { token: token() });
        assert!(matches!(next(&mut client).await, Message::Offer { .. }));

        client.send(&Message::Answer { sdp: "reject".into() });
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn unrecognized_and_unexpected_messages_are_ignored() {
        let h = harness(4, false);
        let (channel, mut client) = memory_channel();
        let session = Session::<MemoryChannel, FakeNegotiation>::establish(&h.ctx, channel, "alice".into())
            .await
            .unwrap();
        assert!(matches!(next(&mut client).await, Message::Offer { .. }));

        client.send_raw(r#"{"type":"clipboard","text":"x"}"#);
        client.send(&Message::Auth { token: token() });
        client.send(&Message::MouseWheel {
            delta_x: 0.0,
            delta_y: 1.0,
            delta_z: 0.0,
        });
        client.send(&key_event());
        client.hang_up();

        session.run().await.unwrap();
        assert!(entries(&h.log).contains(&"key:KeyA".to_string()));
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_twice_is_an_error() {
        let h = harness(4, false);
        let (channel, _client) = memory_channel();
        let mut session = Session::<MemoryChannel, FakeNegotiation>::establish(&h.ctx, channel, "alice".into())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(h.ctx.registry.get(session.id()).await.is_ok());

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(h.ctx.registry.get(session.id()).await.is_err());
        assert!(session.close().await.is_err());
    }
}
