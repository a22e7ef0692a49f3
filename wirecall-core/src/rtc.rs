//! webrtc-crate negotiation backend
//!
//! Implements [`NegotiationBackend`] over `RTCPeerConnection`, translating
//! between the engine's negotiation types and the webrtc crate's. Connection
//! callbacks are bridged onto a broadcast channel so the coordinator can
//! consume them as a plain event stream.

use crate::media::{MediaError, VideoSender};
use crate::peer::{NegotiationBackend, NegotiationError, NegotiationFactory, PeerEvent};
use crate::types::{
    IceCandidateInit, IceState, MediaKind, PeerConnectionState, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Configuration for the webrtc backend
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

fn backend_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Backend(e.to_string())
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

/// Sender wrapper exposing track hot-swap
///
/// [`VideoSender::replace_track`] maps straight onto
/// `RTCRtpSender::replace_track`, which swaps the outbound source without a
/// renegotiation round-trip.
pub struct RtcVideoSender {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl VideoSender for RtcVideoSender {
    async fn replace_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), MediaError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track;
        self.sender
            .replace_track(Some(local))
            .await
            .map_err(|e| MediaError::ReplaceFailed(e.to_string()))
    }
}

/// [`NegotiationBackend`] over an `RTCPeerConnection`
pub struct RtcBackend {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<PeerEvent>,
}

impl RtcBackend {
    /// Build a peer connection and wire its callbacks to the event stream
    pub async fn new(config: &RtcConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(backend_err)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(backend_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(backend_err)?);
        let (events, _) = broadcast::channel(64);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(json) = candidate.to_json() {
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidateInit {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::ConnectionStateChanged(map_connection_state(
                    state,
                )));
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::IceStateChanged(map_ice_state(state)));
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let _ = tx.send(PeerEvent::TrackReceived {
                    track_id: track.id(),
                    kind,
                });
            })
        }));

        Ok(Self { pc, events })
    }
}

#[async_trait]
impl NegotiationBackend for RtcBackend {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(backend_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(backend_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(backend_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(backend_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc_desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| NegotiationError::RemoteDescriptionRejected(e.to_string()))?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| NegotiationError::RemoteDescriptionRejected(e.to_string()))
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateInit,
    ) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(backend_err)
    }

    async fn add_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Arc<dyn VideoSender>, NegotiationError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track;
        let sender = self.pc.add_track(local).await.map_err(backend_err)?;
        Ok(Arc::new(RtcVideoSender { sender }))
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(backend_err)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

/// Factory producing [`RtcBackend`] instances
pub struct RtcFactory {
    config: RtcConfig,
}

impl RtcFactory {
    /// Create a factory with the given configuration
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

impl Default for RtcFactory {
    fn default() -> Self {
        Self::new(RtcConfig::default())
    }
}

#[async_trait]
impl NegotiationFactory for RtcFactory {
    async fn create(&self) -> Result<Arc<dyn NegotiationBackend>, NegotiationError> {
        Ok(Arc::new(RtcBackend::new(&self.config).await?))
    }
}
