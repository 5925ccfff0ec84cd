use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use periscope_protocol::{IceCandidate, IceConfig, IceServerInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::sender::{MediaKind, MediaSender};

/// Connection-state changes worth telling the owning session about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerEvent {
    fn from_state(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::Connected => Some(PeerEvent::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerEvent::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerEvent::Failed),
            RTCPeerConnectionState::Closed => Some(PeerEvent::Closed),
            _ => None,
        }
    }
}

/// Offer/answer exchange for one session, owning that session's senders.
pub trait Negotiation: Send + 'static {
    /// Attach every sender's track, build the local offer and wait (bounded)
    /// for ICE gathering. Returns the complete SDP.
    fn offer(&mut self) -> impl Future<Output = Result<String>> + Send;

    fn set_answer(&mut self, sdp: String) -> impl Future<Output = Result<()>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start every attached sender. Repeated calls are no-ops.
    fn start_senders(&mut self) -> Result<()>;

    /// ICE servers the client should use, sent along with the offer.
    fn ice_servers(&self) -> Vec<IceServerInfo>;

    /// Stop every sender, then close the peer connection.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

pub trait NegotiationFactory: Send + Sync + 'static {
    type Negotiation: Negotiation;

    /// Build a negotiation around `senders`. State changes are delivered on
    /// `events`.
    fn create(
        &self,
        senders: Vec<MediaSender>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> impl Future<Output = Result<Self::Negotiation>> + Send;
}

/// ICE server list from config: one STUN entry and, if configured, one TURN
/// entry carrying the credentials.
pub fn ice_server_list(config: &IceConfig) -> Vec<IceServerInfo> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: config.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone(),
            credential: config.turn_credential.clone(),
        });
    }
    servers
}

/// Builds [`PeerCoordinator`]s from the `[ice]` config section.
#[derive(Debug, Clone)]
pub struct PeerNegotiatorFactory {
    ice: IceConfig,
}

impl PeerNegotiatorFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

impl NegotiationFactory for PeerNegotiatorFactory {
    type Negotiation = PeerCoordinator;

    async fn create(
        &self,
        senders: Vec<MediaSender>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<PeerCoordinator> {
        PeerCoordinator::new(&self.ice, senders, events).await
    }
}

/// [`Negotiation`] over a webrtc peer connection.
pub struct PeerCoordinator {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Vec<MediaSender>,
    ice_servers: Vec<IceServerInfo>,
    gather_timeout: Duration,
    tracks_attached: bool,
}

impl PeerCoordinator {
    pub async fn new(
        ice: &IceConfig,
        mut senders: Vec<MediaSender>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        // Audio is offered first, then video.
        senders.sort_by_key(|s| match s.kind() {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
        });

        let mut media_engine = MediaEngine::default();
        for sender in &senders {
            sender.spec().register(&mut media_engine)?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_server_list(ice);
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        // Runs on the transport's own task; hand the change to the session.
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    warn!(?state, "Peer connection state changed");
                }
                _ => info!(?state, "Peer connection state changed"),
            }
            if let Some(event) = PeerEvent::from_state(state) {
                let _ = events.send(event);
            }
            Box::pin(async {})
        }));

        Ok(Self {
            peer_connection,
            senders,
            ice_servers,
            gather_timeout: Duration::from_secs(ice.gather_timeout_secs),
            tracks_attached: false,
        })
    }

    async fn attach_tracks(&mut self) -> Result<()> {
        if self.tracks_attached {
            return Ok(());
        }
        for sender in &mut self.senders {
            let rtp_sender = self
                .peer_connection
                .add_track(sender.track())
                .await
                .with_context(|| format!("Failed to add {} track", sender.kind().as_str()))?;
            sender.attach(rtp_sender);
            debug!(kind = sender.kind().as_str(), "Track attached");
        }
        self.tracks_attached = true;
        Ok(())
    }
}

impl Negotiation for PeerCoordinator {
    async fn offer(&mut self) -> Result<String> {
        self.attach_tracks().await?;

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set local description")?;

        if tokio::time::timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.gather_timeout.as_secs(),
                "ICE gathering incomplete, sending offer with candidates so far"
            );
        }

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("No local description after offer")?;
        debug!(len = local.sdp.len(), "Local offer ready");
        Ok(local.sdp)
    }

    async fn set_answer(&mut self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).context("Invalid SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        info!("Remote answer applied");
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        debug!("Remote ICE candidate added");
        Ok(())
    }

    fn start_senders(&mut self) -> Result<()> {
        for sender in &mut self.senders {
            sender.start()?;
        }
        Ok(())
    }

    fn ice_servers(&self) -> Vec<IceServerInfo> {
        self.ice_servers.clone()
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        for sender in &mut self.senders {
            if let Err(e) = sender.close().await {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {e}");
            first_err.get_or_insert(anyhow::Error::new(e).context("Failed to close peer connection"));
        }
        info!("Peer connection closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
