//! Media acquisition and the outbound pipeline
//!
//! # Architecture
//!
//! Device capture is behind the [`CaptureBackend`] trait: the host supplies
//! the platform implementation (getUserMedia in a webview, desktop-capture in
//! a native shell) and the engine stays testable without hardware.
//!
//! [`MediaPipeline`] decides what actually goes over the wire. Exactly one
//! [`TrackSource`] is active at a time:
//!
//! - `Camera` — the raw capture track, identity passthrough
//! - `Filtered(id)` — a 30 fps render loop over the raw frames
//! - `ScreenShare` — a display-capture track
//!
//! Switching is a hot-swap: the previous variant's resources are stopped,
//! then [`VideoSender::replace_track`] swaps the sender's source. The peer
//! connection is never closed or renegotiated by a switch.

use crate::filter::{apply_filter, FilterId, FilterSpec};
use crate::types::{MediaKind, TrackSource};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Fixed frame rate of the filter render loop
pub const FILTER_FPS: u32 = 30;

/// Granular device-acquisition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    /// User denied the permission prompt
    #[error("media permission denied")]
    PermissionDenied,

    /// No device matches the requested id
    #[error("media device not found: {0}")]
    DeviceNotFound(String),

    /// Device is held by another application
    #[error("media device busy: {0}")]
    DeviceBusy(String),

    /// Constraints cannot be satisfied by any device
    #[error("media constraints unsatisfiable")]
    ConstraintsUnsatisfiable,

    /// Capture requires a secure context
    #[error("insecure context, capture unavailable")]
    InsecureContext,

    /// Platform has no capture support at all
    #[error("media capture unsupported on this platform")]
    Unsupported,
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Acquisition failed
    #[error(transparent)]
    Acquisition(#[from] MediaAcquisitionError),

    /// No local video track to operate on
    #[error("no local video track")]
    NoVideoTrack,

    /// No local audio track to operate on
    #[error("no local audio track")]
    NoAudioTrack,

    /// Raw capture exposes no frame tap, filters unavailable
    #[error("no frame source for filter rendering")]
    NoFrameSource,

    /// Unknown filter id
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    /// Track replace on the sender failed
    #[error("track replace failed: {0}")]
    ReplaceFailed(String),
}

/// One raw RGBA video frame from the capture device
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA8 pixel data, `width * height * 4` bytes
    pub data: Bytes,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
}

/// Tap on the raw capture feed, read by the filter render loop
pub trait FrameSource: Send + Sync {
    /// Latest frame captured, if any has arrived yet
    fn latest_frame(&self) -> Option<VideoFrame>;
}

/// Requested capture devices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIds {
    /// Audio input device id
    pub audio: Option<String>,
    /// Video input device id
    pub video: Option<String>,
}

/// One local outbound track
///
/// `enabled` is the mute flag: capture writers skip disabled tracks, the
/// track itself stays attached to the sender.
#[derive(Clone)]
pub struct LocalTrack {
    /// Track id
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// The sample-writable track handed to the negotiation backend
    pub track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    /// Create a new local track of the given kind
    pub fn new(kind: MediaKind, label: &str) -> Self {
        let id = format!("{}-{}", label, Uuid::new_v4());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            "wirecall".to_owned(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the mute flag, returning the new value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    /// Whether the track is currently unmuted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    /// Release the underlying device handle. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.id, kind = ?self.kind, "Local track stopped");
        }
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Result of acquiring local capture
#[derive(Clone)]
pub struct LocalStream {
    /// Audio track, if requested
    pub audio: Option<LocalTrack>,
    /// Video track, if requested
    pub video: Option<LocalTrack>,
    /// Raw frame tap feeding the filter loop
    pub frames: Option<Arc<dyn FrameSource>>,
}

impl LocalStream {
    /// Stop every track in the stream
    pub fn stop_all(&self) {
        if let Some(a) = &self.audio {
            a.stop();
        }
        if let Some(v) = &self.video {
            v.stop();
        }
    }

    /// Ids of the live tracks
    pub fn track_ids(&self) -> Vec<String> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Display-capture stream
///
/// `ended` flips to `true` when the user stops sharing from OS chrome; the
/// pipeline watches it and falls back to the previously active source.
pub struct ScreenCapture {
    /// The display track
    pub track: LocalTrack,
    /// Natural-end notification
    pub ended: watch::Receiver<bool>,
}

/// Platform capture seam
///
/// Acquisition must be idempotent from the pipeline's point of view: the
/// pipeline stops previously active tracks before calling `acquire` again, so
/// implementations never see two overlapping exclusive claims.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Obtain local audio/video capture
    ///
    /// # Errors
    ///
    /// Returns a granular [`MediaAcquisitionError`] the UI can render.
    async fn acquire(
        &self,
        video: bool,
        audio: bool,
        device_ids: Option<DeviceIds>,
    ) -> Result<LocalStream, MediaAcquisitionError>;

    /// Obtain a display-capture stream
    async fn acquire_display(&self) -> Result<ScreenCapture, MediaAcquisitionError>;
}

/// Seam through which the pipeline swaps the outbound video track
///
/// Implemented over `RTCRtpSender::replace_track` by the webrtc backend and
/// mocked in tests. Swapping never triggers renegotiation.
#[async_trait]
pub trait VideoSender: Send + Sync {
    /// Replace the track feeding the sender
    async fn replace_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), MediaError>;
}

struct PipelineState {
    raw: Option<LocalStream>,
    sender: Option<Arc<dyn VideoSender>>,
    active: Option<TrackSource>,
    /// Source to restore when screen sharing ends
    restore_after_share: Option<TrackSource>,
    filter_loop: Option<JoinHandle<()>>,
    filter_track: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    screen_watch: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl PipelineState {
    fn stop_filter_loop(&mut self) {
        if let Some(handle) = self.filter_loop.take() {
            handle.abort();
        }
        if let Some(track) = self.filter_track.take() {
            track.stop();
        }
    }

    fn stop_screen(&mut self) {
        if let Some(handle) = self.screen_watch.take() {
            handle.abort();
        }
        if let Some(track) = self.screen.take() {
            track.stop();
        }
    }
}

/// Outbound media pipeline with hot-swappable video source
///
/// Cheap to clone; all clones share one state. The facade drives it from UI
/// commands, the screen-share watcher drives the autonomous fallback.
#[derive(Clone)]
pub struct MediaPipeline {
    capture: Arc<dyn CaptureBackend>,
    state: Arc<Mutex<PipelineState>>,
    source_events: broadcast::Sender<TrackSource>,
}

impl MediaPipeline {
    /// Create a pipeline over the given capture backend
    pub fn new(capture: Arc<dyn CaptureBackend>) -> Self {
        let (source_events, _) = broadcast::channel(16);
        Self {
            capture,
            state: Arc::new(Mutex::new(PipelineState {
                raw: None,
                sender: None,
                active: None,
                restore_after_share: None,
                filter_loop: None,
                filter_track: None,
                screen: None,
                screen_watch: None,
                shut_down: false,
            })),
            source_events,
        }
    }

    /// Observe outbound source changes, including autonomous fallbacks
    pub fn subscribe_source_changes(&self) -> broadcast::Receiver<TrackSource> {
        self.source_events.subscribe()
    }

    /// Acquire local capture for the call
    ///
    /// Idempotent: any previously acquired tracks are stopped first so device
    /// handles never leak. Side effect: when a video sender is already
    /// registered, the fresh camera track is attached to it immediately.
    #[tracing::instrument(skip(self, device_ids))]
    pub async fn acquire(
        &self,
        kind: MediaKind,
        device_ids: Option<DeviceIds>,
    ) -> Result<LocalStream, MediaError> {
        let mut state = self.state.lock().await;
        if let Some(old) = state.raw.take() {
            tracing::debug!("Stopping previously acquired tracks before re-acquire");
            old.stop_all();
        }
        state.stop_filter_loop();

        let stream = self
            .capture
            .acquire(kind.has_video(), true, device_ids)
            .await?;

        if kind.has_video() {
            if let (Some(sender), Some(video)) = (state.sender.clone(), stream.video.clone()) {
                sender
                    .replace_track(video.track.clone())
                    .await
                    .map_err(|e| MediaError::ReplaceFailed(e.to_string()))?;
            }
            state.active = Some(TrackSource::Camera);
        }
        state.raw = Some(stream.clone());
        Ok(stream)
    }

    /// Register the sender once the peer connection exists
    ///
    /// Attaches the currently active video track right away.
    pub async fn set_video_sender(&self, sender: Arc<dyn VideoSender>) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if let Some(track) = Self::active_track(&state) {
            sender
                .replace_track(track)
                .await
                .map_err(|e| MediaError::ReplaceFailed(e.to_string()))?;
        }
        state.sender = Some(sender);
        Ok(())
    }

    /// The currently active outbound source
    pub async fn active_source(&self) -> Option<TrackSource> {
        self.state.lock().await.active.clone()
    }

    /// The raw acquired stream, independent of what is on the wire
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.state.lock().await.raw.clone()
    }

    /// Flip the audio mute flag, returning the new enabled state
    pub async fn toggle_audio(&self) -> Result<bool, MediaError> {
        let state = self.state.lock().await;
        let track = state
            .raw
            .as_ref()
            .and_then(|s| s.audio.as_ref())
            .ok_or(MediaError::NoAudioTrack)?;
        Ok(track.set_enabled(!track.is_enabled()))
    }

    /// Flip the video mute flag, returning the new enabled state
    pub async fn toggle_video(&self) -> Result<bool, MediaError> {
        let state = self.state.lock().await;
        let track = state
            .raw
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .ok_or(MediaError::NoVideoTrack)?;
        Ok(track.set_enabled(!track.is_enabled()))
    }

    /// Switch the outbound source back to the raw camera track
    #[tracing::instrument(skip(self))]
    pub async fn use_camera(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            // Mid-share: remember the choice, restore applies it later.
            state.restore_after_share = Some(TrackSource::Camera);
            return Ok(());
        }
        self.activate(&mut state, TrackSource::Camera).await
    }

    /// Switch the outbound source to a filtered render of the camera feed
    ///
    /// While screen sharing this is a no-op that records the selection; the
    /// filter becomes active when sharing ends.
    #[tracing::instrument(skip(self), fields(filter = %id))]
    pub async fn apply_filter(&self, id: FilterId) -> Result<(), MediaError> {
        if FilterSpec::named(&id).is_none() {
            return Err(MediaError::UnknownFilter(id.0));
        }
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            tracing::debug!("Screen share active, deferring filter selection");
            state.restore_after_share = Some(TrackSource::Filtered(id));
            return Ok(());
        }
        self.activate(&mut state, TrackSource::Filtered(id)).await
    }

    /// Start sharing the display
    ///
    /// The previously active source is remembered and restored when sharing
    /// stops, whether via [`MediaPipeline::stop_screen_share`] or the user
    /// ending it from OS chrome.
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            return Ok(());
        }

        let capture = self.capture.acquire_display().await?;
        if state.restore_after_share.is_none() {
            state.restore_after_share = state.active.clone();
        }
        state.stop_filter_loop();

        if let Some(sender) = state.sender.clone() {
            sender
                .replace_track(capture.track.track.clone())
                .await
                .map_err(|e| MediaError::ReplaceFailed(e.to_string()))?;
        }

        // Watch for the user ending the share from OS chrome.
        let pipeline = self.clone();
        let mut ended = capture.ended.clone();
        let watch_task = tokio::spawn(async move {
            loop {
                if *ended.borrow() {
                    break;
                }
                if ended.changed().await.is_err() {
                    break;
                }
            }
            pipeline.handle_screen_ended().await;
        });

        state.screen = Some(capture.track);
        state.screen_watch = Some(watch_task);
        state.active = Some(TrackSource::ScreenShare);
        let _ = self.source_events.send(TrackSource::ScreenShare);
        Ok(())
    }

    /// Stop sharing the display and restore the previous source
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if state.screen.is_none() {
            return Ok(());
        }
        state.stop_screen();
        let target = state
            .restore_after_share
            .take()
            .unwrap_or(TrackSource::Camera);
        self.activate(&mut state, target).await
    }

    /// Tear the pipeline down. Idempotent; part of the single end-call path.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.stop_filter_loop();
        state.stop_screen();
        if let Some(raw) = state.raw.take() {
            raw.stop_all();
        }
        state.sender = None;
        state.active = None;
        state.restore_after_share = None;
        tracing::debug!("Media pipeline shut down");
    }

    async fn handle_screen_ended(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down || state.screen.is_none() {
            return;
        }
        tracing::info!("Screen share ended by user, restoring previous source");
        state.stop_screen();
        let target = state
            .restore_after_share
            .take()
            .unwrap_or(TrackSource::Camera);
        if let Err(e) = self.activate(&mut state, target).await {
            tracing::warn!(error = %e, "Failed to restore source after screen share");
        }
    }

    fn active_track(state: &PipelineState) -> Option<Arc<TrackLocalStaticSample>> {
        match state.active {
            Some(TrackSource::Camera) | None => state
                .raw
                .as_ref()
                .and_then(|s| s.video.as_ref())
                .map(|t| t.track.clone()),
            Some(TrackSource::Filtered(_)) => state.filter_track.as_ref().map(|t| t.track.clone()),
            Some(TrackSource::ScreenShare) => state.screen.as_ref().map(|t| t.track.clone()),
        }
    }

    /// Make `source` the outbound source: stop the previous variant's
    /// resources, then replace the track on the sender.
    async fn activate(
        &self,
        state: &mut PipelineState,
        source: TrackSource,
    ) -> Result<(), MediaError> {
        let track = match &source {
            TrackSource::Camera => {
                state.stop_filter_loop();
                state
                    .raw
                    .as_ref()
                    .and_then(|s| s.video.clone())
                    .ok_or(MediaError::NoVideoTrack)?
            }
            TrackSource::Filtered(id) => {
                let spec = FilterSpec::named(id).ok_or_else(|| {
                    MediaError::UnknownFilter(id.0.clone())
                })?;
                let frames = state
                    .raw
                    .as_ref()
                    .and_then(|s| s.frames.clone())
                    .ok_or(MediaError::NoFrameSource)?;
                state.stop_filter_loop();
                let out = LocalTrack::new(MediaKind::Video, "filtered");
                state.filter_loop = Some(spawn_filter_loop(frames, spec, out.clone()));
                state.filter_track = Some(out.clone());
                out
            }
            TrackSource::ScreenShare => state.screen.clone().ok_or(MediaError::NoVideoTrack)?,
        };

        if let Some(sender) = state.sender.clone() {
            sender
                .replace_track(track.track.clone())
                .await
                .map_err(|e| MediaError::ReplaceFailed(e.to_string()))?;
        }
        state.active = Some(source.clone());
        let _ = self.source_events.send(source);
        Ok(())
    }
}

/// Spawn the cooperative filter render task
///
/// Each tick: read the latest raw frame, apply the pure transform keyed by
/// `(filter, elapsed)`, write the result into the output track.
fn spawn_filter_loop(
    frames: Arc<dyn FrameSource>,
    spec: FilterSpec,
    out: LocalTrack,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame_interval = Duration::from_secs(1) / FILTER_FPS;
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if out.is_stopped() {
                break;
            }
            let Some(frame) = frames.latest_frame() else {
                continue;
            };
            let rendered = apply_filter(&frame, &spec, started.elapsed());
            let sample = Sample {
                data: rendered.data,
                duration: frame_interval,
                ..Default::default()
            };
            if let Err(e) = out.track.write_sample(&sample).await {
                tracing::trace!(error = %e, "Filter frame dropped");
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use webrtc::track::track_local::TrackLocal;

    struct StaticFrames {
        frame: RwLock<Option<VideoFrame>>,
    }

    impl FrameSource for StaticFrames {
        fn latest_frame(&self) -> Option<VideoFrame> {
            self.frame.read().clone()
        }
    }

    struct RecordingSender {
        replaced: RwLock<Vec<String>>,
    }

    #[async_trait]
    impl VideoSender for RecordingSender {
        async fn replace_track(
            &self,
            track: Arc<TrackLocalStaticSample>,
        ) -> Result<(), MediaError> {
            self.replaced.write().push(track.id().to_string());
            Ok(())
        }
    }

    struct FakeCapture {
        ended_tx: RwLock<Option<watch::Sender<bool>>>,
    }

    impl FakeCapture {
        fn new() -> Self {
            Self {
                ended_tx: RwLock::new(None),
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
            let frame = VideoFrame {
                width: 2,
                height: 2,
                data: Bytes::from(vec![128u8; 16]),
                timestamp: Utc::now(),
            };
            Ok(LocalStream {
                audio: audio.then(|| LocalTrack::new(MediaKind::Audio, "mic")),
                video: video.then(|| LocalTrack::new(MediaKind::Video, "cam")),
                frames: video.then(|| {
                    Arc::new(StaticFrames {
                        frame: RwLock::new(Some(frame)),
                    }) as Arc<dyn FrameSource>
                }),
            })
        }

        async fn acquire_display(&self) -> Result<ScreenCapture, MediaAcquisitionError> {
            let (tx, rx) = watch::channel(false);
            *self.ended_tx.write() = Some(tx);
            Ok(ScreenCapture {
                track: LocalTrack::new(MediaKind::Video, "screen"),
                ended: rx,
            })
        }
    }

    fn pipeline_with_sender() -> (MediaPipeline, Arc<RecordingSender>, Arc<FakeCapture>) {
        let capture = Arc::new(FakeCapture::new());
        let pipeline = MediaPipeline::new(capture.clone());
        let sender = Arc::new(RecordingSender {
            replaced: RwLock::new(Vec::new()),
        });
        (pipeline, sender, capture)
    }

    #[tokio::test]
    async fn test_acquire_sets_camera_active() {
        let (pipeline, _, _) = pipeline_with_sender();
        let stream = pipeline.acquire(MediaKind::Video, None).await.unwrap();
        assert!(stream.audio.is_some());
        assert!(stream.video.is_some());
        assert_eq!(
            pipeline.active_source().await,
            Some(TrackSource::Camera)
        );
    }

    #[tokio::test]
    async fn test_reacquire_stops_old_tracks() {
        let (pipeline, _, _) = pipeline_with_sender();
        let first = pipeline.acquire(MediaKind::Video, None).await.unwrap();
        let old_video = first.video.unwrap();
        let _second = pipeline.acquire(MediaKind::Video, None).await.unwrap();
        assert!(old_video.is_stopped());
    }

    #[tokio::test]
    async fn test_filter_switch_replaces_track() {
        let (pipeline, sender, _) = pipeline_with_sender();
        pipeline.acquire(MediaKind::Video, None).await.unwrap();
        pipeline.set_video_sender(sender.clone()).await.unwrap();
        pipeline.apply_filter(FilterId::new("noir")).await.unwrap();

        assert!(matches!(
            pipeline.active_source().await,
            Some(TrackSource::Filtered(_))
        ));
        // One replace for the camera attach, one for the filter swap.
        assert_eq!(sender.replaced.read().len(), 2);
        assert!(sender.replaced.read()[1].starts_with("filtered-"));
    }

    #[tokio::test]
    async fn test_unknown_filter_rejected() {
        let (pipeline, _, _) = pipeline_with_sender();
        pipeline.acquire(MediaKind::Video, None).await.unwrap();
        let err = pipeline
            .apply_filter(FilterId::new("does-not-exist"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::UnknownFilter(_)));
    }

    #[tokio::test]
    async fn test_filter_while_sharing_is_deferred() {
        let (pipeline, sender, _) = pipeline_with_sender();
        pipeline.acquire(MediaKind::Video, None).await.unwrap();
        pipeline.set_video_sender(sender.clone()).await.unwrap();
        pipeline.start_screen_share().await.unwrap();

        pipeline.apply_filter(FilterId::new("crt")).await.unwrap();
        // Still sharing; the filter waits.
        assert_eq!(
            pipeline.active_source().await,
            Some(TrackSource::ScreenShare)
        );

        pipeline.stop_screen_share().await.unwrap();
        assert_eq!(
            pipeline.active_source().await,
            Some(TrackSource::Filtered(FilterId::new("crt")))
        );
    }

    #[tokio::test]
    async fn test_screen_share_natural_end_falls_back() {
        let (pipeline, sender, capture) = pipeline_with_sender();
        pipeline.acquire(MediaKind::Video, None).await.unwrap();
        pipeline.set_video_sender(sender.clone()).await.unwrap();
        pipeline.apply_filter(FilterId::new("noir")).await.unwrap();
        pipeline.start_screen_share().await.unwrap();
        assert_eq!(
            pipeline.active_source().await,
            Some(TrackSource::ScreenShare)
        );

        // User stops sharing from OS chrome.
        capture.ended_tx.read().as_ref().unwrap().send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            pipeline.active_source().await,
            Some(TrackSource::Filtered(FilterId::new("noir")))
        );
    }

    #[tokio::test]
    async fn test_toggle_flags() {
        let (pipeline, _, _) = pipeline_with_sender();
        pipeline.acquire(MediaKind::Video, None).await.unwrap();
        assert!(!pipeline.toggle_audio().await.unwrap());
        assert!(pipeline.toggle_audio().await.unwrap());
        assert!(!pipeline.toggle_video().await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (pipeline, _, _) = pipeline_with_sender();
        let stream = pipeline.acquire(MediaKind::Video, None).await.unwrap();
        pipeline.shutdown().await;
        pipeline.shutdown().await;
        assert!(stream.video.unwrap().is_stopped());
        assert_eq!(pipeline.active_source().await, None);
    }
}
