//! Peer connection management
//!
//! [`PeerConnectionManager`] owns the negotiation state for one remote
//! participant: the signaling state machine, the remote-description flag, and
//! the pending ICE candidate queue. The actual SDP/ICE work happens behind
//! the [`NegotiationBackend`] seam, implemented over the webrtc crate in
//! [`crate::rtc`] and mocked in tests.
//!
//! Candidate invariant: a candidate is applied to the connection if and only
//! if a remote description has been set. Otherwise it is queued and drained
//! in arrival order, exactly once each, immediately after the remote
//! description is applied.

use crate::media::VideoSender;
use crate::types::{
    IceCandidateInit, IceState, MediaKind, PeerConnectionState, SessionDescription, SignalState,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Negotiation errors
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    /// Offer retries exhausted without an answer
    #[error("offer not answered after retries")]
    NoAnswerAfterRetries,

    /// The backend refused the remote description
    #[error("remote description rejected: {0}")]
    RemoteDescriptionRejected(String),

    /// Transport-level connection failure after recovery attempts
    #[error("peer connection failed")]
    ConnectionFailed,

    /// Operation invalid in the current signaling state
    #[error("invalid operation in signaling state {0:?}")]
    InvalidState(SignalState),

    /// Backend failure
    #[error("negotiation backend error: {0}")]
    Backend(String),
}

/// Events surfaced by a negotiation backend
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidateInit),
    /// Connection-level state changed
    ConnectionStateChanged(PeerConnectionState),
    /// ICE connectivity state changed
    IceStateChanged(IceState),
    /// A remote track arrived
    TrackReceived {
        /// Remote track id
        track_id: String,
        /// Audio or video
        kind: MediaKind,
    },
}

/// Seam over the platform's RTCPeerConnection
#[async_trait]
pub trait NegotiationBackend: Send + Sync {
    /// Create an offer and set it as the local description
    ///
    /// `ice_restart` re-runs connectivity establishment on the existing
    /// session without closing it.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote offer or answer
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply one remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateInit)
        -> Result<(), NegotiationError>;

    /// Attach a local track; the returned sender supports hot-swapping
    async fn add_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Arc<dyn VideoSender>, NegotiationError>;

    /// Current connection-level state
    fn connection_state(&self) -> PeerConnectionState;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), NegotiationError>;

    /// Subscribe to backend events
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Constructs negotiation backends
///
/// The coordinator builds connections lazily (a responder may receive
/// signaling before any connection exists) and retry logic may discard a
/// stale handle and start over rather than operate on a half-torn-down one.
#[async_trait]
pub trait NegotiationFactory: Send + Sync {
    /// Create a fresh backend
    async fn create(&self) -> Result<Arc<dyn NegotiationBackend>, NegotiationError>;
}

/// Negotiation state and candidate queue for one remote participant
///
/// Owned exclusively by the session's coordinator task; all queue
/// manipulation is synchronous relative to other events in the session, so
/// no locking is needed here.
pub struct PeerConnectionManager {
    backend: Arc<dyn NegotiationBackend>,
    signal_state: SignalState,
    has_remote_description: bool,
    pending_candidates: VecDeque<IceCandidateInit>,
}

impl PeerConnectionManager {
    /// Wrap a backend in a fresh manager
    pub fn new(backend: Arc<dyn NegotiationBackend>) -> Self {
        Self {
            backend,
            signal_state: SignalState::New,
            has_remote_description: false,
            pending_candidates: VecDeque::new(),
        }
    }

    /// Current signaling state
    pub fn signal_state(&self) -> SignalState {
        self.signal_state
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Number of candidates waiting for a remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Current connection-level state
    pub fn connection_state(&self) -> PeerConnectionState {
        self.backend.connection_state()
    }

    /// Subscribe to backend events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.backend.subscribe()
    }

    /// Attach a local track to the connection
    pub async fn add_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Arc<dyn VideoSender>, NegotiationError> {
        self.backend.add_track(track).await
    }

    /// Create an offer (initiator path)
    ///
    /// Valid from any non-closed state; an ICE-restart offer on an already
    /// negotiated session keeps the connection open.
    #[tracing::instrument(skip(self))]
    pub async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.signal_state == SignalState::Closed {
            return Err(NegotiationError::InvalidState(self.signal_state));
        }
        let offer = self.backend.create_offer(ice_restart).await?;
        self.signal_state = SignalState::HaveLocalOffer;
        tracing::debug!(ice_restart, "Local offer created");
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer (answerer path)
    ///
    /// A second offer while already stable is rejected rather than attempted;
    /// the duplicate-delivery guard upstream relies on this.
    #[tracing::instrument(skip(self, offer))]
    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        match self.signal_state {
            SignalState::New | SignalState::HaveRemoteOffer => {}
            state => return Err(NegotiationError::InvalidState(state)),
        }
        self.backend.set_remote_description(offer).await?;
        self.has_remote_description = true;
        self.signal_state = SignalState::HaveRemoteOffer;
        self.drain_pending_candidates().await?;

        let answer = self.backend.create_answer().await?;
        self.signal_state = SignalState::Stable;
        tracing::debug!("Remote offer applied, answer created");
        Ok(answer)
    }

    /// Apply the remote answer to our outstanding offer (initiator path)
    #[tracing::instrument(skip(self, answer))]
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.signal_state != SignalState::HaveLocalOffer {
            return Err(NegotiationError::InvalidState(self.signal_state));
        }
        self.backend.set_remote_description(answer).await?;
        self.has_remote_description = true;
        self.signal_state = SignalState::Stable;
        self.drain_pending_candidates().await?;
        tracing::debug!("Remote answer applied");
        Ok(())
    }

    /// Add a remote ICE candidate, queueing it if negotiation is not ready
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), NegotiationError> {
        if self.signal_state == SignalState::Closed {
            tracing::trace!("Dropping candidate for closed connection");
            return Ok(());
        }
        if self.has_remote_description {
            self.backend.add_ice_candidate(candidate).await
        } else {
            tracing::trace!(
                queued = self.pending_candidates.len() + 1,
                "Queueing candidate until remote description is set"
            );
            self.pending_candidates.push_back(candidate);
            Ok(())
        }
    }

    /// Close the connection and discard queued candidates. Idempotent.
    pub async fn close(&mut self) -> Result<(), NegotiationError> {
        if self.signal_state == SignalState::Closed {
            return Ok(());
        }
        self.signal_state = SignalState::Closed;
        self.pending_candidates.clear();
        self.backend.close().await
    }

    async fn drain_pending_candidates(&mut self) -> Result<(), NegotiationError> {
        let queued = self.pending_candidates.len();
        if queued > 0 {
            tracing::debug!(queued, "Draining pending candidates");
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.backend.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}
