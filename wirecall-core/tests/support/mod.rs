//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use wirecall_core::{
    CallSession, CallSessionConfig, CaptureBackend, ChannelRef, ConversationId, DeviceIds,
    FrameSource, IceCandidateInit, LocalStream, LocalTrack, MediaAcquisitionError, MediaError,
    MediaKind, MemoryChannel, NegotiationBackend, NegotiationError, NegotiationFactory,
    PeerConnectionState, PeerEvent, PeerIdentityString, RetryPolicy, ScreenCapture,
    SessionDescription, SignalChannel, VideoFrame, VideoSender,
};

/// Frame source returning one constant gray frame
pub struct StaticFrames;

impl FrameSource for StaticFrames {
    fn latest_frame(&self) -> Option<VideoFrame> {
        Some(VideoFrame {
            width: 4,
            height: 4,
            data: bytes::Bytes::from(vec![128u8; 4 * 4 * 4]),
            timestamp: Utc::now(),
        })
    }
}

/// Capture backend producing in-memory tracks and a static frame tap
pub struct FakeCapture {
    screen_ended: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            screen_ended: Mutex::new(None),
        }
    }

    /// Simulate the user ending the screen share from OS chrome
    pub fn end_screen_share(&self) {
        if let Some(tx) = self.screen_ended.lock().as_ref() {
            let _ = tx.send(true);
        }
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn acquire(
        &self,
        video: bool,
        audio: bool,
        _device_ids: Option<DeviceIds>,
    ) -> Result<LocalStream, MediaAcquisitionError> {
        Ok(LocalStream {
            audio: audio.then(|| LocalTrack::new(MediaKind::Audio, "mic")),
            video: video.then(|| LocalTrack::new(MediaKind::Video, "cam")),
            frames: video.then(|| Arc::new(StaticFrames) as Arc<dyn FrameSource>),
        })
    }

    async fn acquire_display(&self) -> Result<ScreenCapture, MediaAcquisitionError> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        *self.screen_ended.lock() = Some(tx);
        Ok(ScreenCapture {
            track: LocalTrack::new(MediaKind::Video, "screen"),
            ended: rx,
        })
    }
}

/// Video sender that records every track swapped onto it
#[derive(Default)]
pub struct RecordingSender {
    pub replaced: Mutex<Vec<String>>,
}

#[async_trait]
impl VideoSender for RecordingSender {
    async fn replace_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), MediaError> {
        use webrtc::track::track_local::TrackLocal;
        self.replaced.lock().push(track.id().to_string());
        Ok(())
    }
}

/// Negotiation backend that reports `Connected` once a remote description
/// lands, and gathers one synthetic candidate per local description
pub struct AutoConnectBackend {
    pub label: String,
    pub offers: Mutex<Vec<bool>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidateInit>>,
    pub sender: Arc<RecordingSender>,
    pub closed: Mutex<bool>,
    connected: AtomicBool,
    events: broadcast::Sender<PeerEvent>,
}

impl AutoConnectBackend {
    pub fn new(label: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            label: label.to_string(),
            offers: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            sender: Arc::new(RecordingSender::default()),
            closed: Mutex::new(false),
            connected: AtomicBool::new(false),
            events,
        })
    }

    pub fn inject(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn gather_candidate(&self) {
        let _ = self.events.send(PeerEvent::IceCandidate(IceCandidateInit {
            candidate: format!(
                "candidate:{} 1 UDP 2122260223 192.0.2.1 50000 typ host",
                self.label
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
    }
}

#[async_trait]
impl NegotiationBackend for AutoConnectBackend {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.offers.lock().push(ice_restart);
        self.gather_candidate();
        Ok(SessionDescription::offer(format!("v=0\r\noffer-{}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.gather_candidate();
        Ok(SessionDescription::answer(format!(
            "v=0\r\nanswer-{}",
            self.label
        )))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.remote_descriptions.lock().push(desc);
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::ConnectionStateChanged(
                PeerConnectionState::Connected,
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(
        &self,
        _track: Arc<TrackLocalStaticSample>,
    ) -> Result<Arc<dyn VideoSender>, NegotiationError> {
        Ok(self.sender.clone())
    }

    fn connection_state(&self) -> PeerConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            PeerConnectionState::Connected
        } else {
            PeerConnectionState::New
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        *self.closed.lock() = true;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

pub struct FixedFactory {
    backend: Arc<AutoConnectBackend>,
}

impl FixedFactory {
    pub fn new(backend: Arc<AutoConnectBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl NegotiationFactory for FixedFactory {
    async fn create(&self) -> Result<Arc<dyn NegotiationBackend>, NegotiationError> {
        Ok(self.backend.clone())
    }
}

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Retry knobs compressed for tests
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        offer_timeout: Duration::from_millis(50),
        max_offer_retries: 2,
        request_offer_grace: Duration::from_millis(20),
        request_offer_interval: Duration::from_millis(30),
        max_offer_requests: 3,
    }
}

pub struct SessionPair {
    pub alice: Arc<CallSession<PeerIdentityString>>,
    pub bob: Arc<CallSession<PeerIdentityString>>,
    pub alice_backend: Arc<AutoConnectBackend>,
    pub bob_backend: Arc<AutoConnectBackend>,
    pub alice_channel: Arc<MemoryChannel<PeerIdentityString>>,
    pub bob_channel: Arc<MemoryChannel<PeerIdentityString>>,
}

/// Two sessions for the same call wired over an in-process relay
pub fn session_pair(media: MediaKind) -> SessionPair {
    let (alice_channel, bob_channel) = MemoryChannel::<PeerIdentityString>::pair();
    let alice_id = PeerIdentityString::new("alice");
    let bob_id = PeerIdentityString::new("bob");

    let outgoing = CallSessionConfig::outgoing(
        ConversationId::new("conv-1"),
        alice_id.clone(),
        bob_id.clone(),
        media,
    )
    .with_retry(fast_policy());
    let call_id = outgoing.call_id;

    let alice_backend = AutoConnectBackend::new("alice");
    let alice = CallSession::new(
        outgoing,
        ChannelRef::new(alice_channel.clone() as Arc<dyn SignalChannel<_>>),
        Arc::new(FakeCapture::new()),
        FixedFactory::new(alice_backend.clone()),
    );

    let incoming = CallSessionConfig::incoming(
        call_id,
        ConversationId::new("conv-1"),
        bob_id,
        alice_id,
        media,
    )
    .with_retry(fast_policy());
    let bob_backend = AutoConnectBackend::new("bob");
    let bob = CallSession::new(
        incoming,
        ChannelRef::new(bob_channel.clone() as Arc<dyn SignalChannel<_>>),
        Arc::new(FakeCapture::new()),
        FixedFactory::new(bob_backend.clone()),
    );

    SessionPair {
        alice,
        bob,
        alice_backend,
        bob_backend,
        alice_channel,
        bob_channel,
    }
}

/// Wait until `condition` holds or five (virtual) seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
