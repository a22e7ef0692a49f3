//! Core call types and data structures

use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the conversation the call belongs to in the host app
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Wrap a host-app conversation id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media kind requested by the UI when starting a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Audio and video call
    Video,
}

impl MediaKind {
    /// Whether the call carries a video track
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer half of the exchange
    Offer,
    /// Answer half of the exchange
    Answer,
}

/// SDP session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One advertised network path for the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    /// Candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation signaling state of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    /// Connection created, no descriptions applied
    New,
    /// Local offer set, waiting for the remote answer
    HaveLocalOffer,
    /// Remote offer applied, answer pending
    HaveRemoteOffer,
    /// Both descriptions applied
    Stable,
    /// Terminal; reachable from any state
    Closed,
}

/// Connection-level state reported by the negotiation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Freshly created
    New,
    /// Transport checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Transport temporarily lost
    Disconnected,
    /// Transport failed
    Failed,
    /// Connection closed
    Closed,
}

/// ICE-specific connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceState {
    /// Gathering/checking not started
    New,
    /// Candidate pairs being checked
    Checking,
    /// A working pair was found
    Connected,
    /// All pairs checked and usable
    Completed,
    /// A previously working pair stopped
    Disconnected,
    /// No usable pair
    Failed,
    /// ICE agent shut down
    Closed,
}

/// Which source is currently feeding the outbound video track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    /// Raw camera capture, identity passthrough
    Camera,
    /// Filtered/composited render of the camera feed
    Filtered(crate::filter::FilterId),
    /// Display capture
    ScreenShare,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Outbound call initiated, offer in flight
    Calling,
    /// Negotiation in progress
    Connecting,
    /// Media path established
    Connected,
    /// Teardown in progress
    Ending,
    /// Call failed fatally
    Failed,
}

impl CallState {
    /// Check whether a state transition follows the call state machine
    ///
    /// Setup: Idle -> Calling -> Connecting -> Connected. Responders skip
    /// Calling and go straight to Connecting. Failure is reachable from any
    /// active state; Ending leads back to Idle.
    pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
        matches!(
            (from, to),
            (CallState::Idle, CallState::Calling)
                | (CallState::Idle, CallState::Connecting)
                | (CallState::Calling, CallState::Connecting)
                | (CallState::Connecting, CallState::Connected)
                | (CallState::Connected, CallState::Ending)
                | (CallState::Calling, CallState::Ending)
                | (CallState::Connecting, CallState::Ending)
                | (CallState::Ending, CallState::Idle)
                | (CallState::Calling, CallState::Failed)
                | (CallState::Connecting, CallState::Failed)
                | (CallState::Connected, CallState::Failed)
                | (CallState::Failed, CallState::Ending)
                | (CallState::Failed, CallState::Idle)
        )
    }
}

/// Signaling messages carried over the event-relay channel
///
/// Every negotiation variant is correlated by `call_id` and addressed to one
/// participant; the channel itself is shared across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[serde(bound = "I: PeerIdentity")]
pub enum SignalEvent<I: PeerIdentity> {
    /// SDP offer addressed to the remote participant
    Offer {
        /// Call correlation id
        call_id: CallId,
        /// The offer description
        offer: SessionDescription,
        /// Addressee
        target: I,
    },
    /// SDP answer addressed to the initiator
    Answer {
        /// Call correlation id
        call_id: CallId,
        /// The answer description
        answer: SessionDescription,
        /// Addressee
        target: I,
    },
    /// ICE candidate for an in-flight negotiation
    IceCandidate {
        /// Call correlation id
        call_id: CallId,
        /// The candidate
        candidate: IceCandidateInit,
        /// Addressee
        target: I,
    },
    /// Responder asking the initiator to (re)send its offer
    RequestOffer {
        /// Call correlation id
        call_id: CallId,
        /// Requesting participant
        from: I,
        /// Addressee (the initiator)
        target: I,
    },
    /// Callee accepted the call
    Accept {
        /// Call correlation id
        call_id: CallId,
    },
    /// Callee rejected the call
    Reject {
        /// Call correlation id
        call_id: CallId,
    },
    /// Either side ended the call
    End {
        /// Call correlation id
        call_id: CallId,
    },
    /// Ephemeral in-call reaction
    Reaction {
        /// Call correlation id
        call_id: CallId,
        /// Emoji payload
        emoji: String,
    },
}

impl<I: PeerIdentity> SignalEvent<I> {
    /// Get the call id this event is correlated with
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::RequestOffer { call_id, .. }
            | Self::Accept { call_id }
            | Self::Reject { call_id }
            | Self::End { call_id }
            | Self::Reaction { call_id, .. } => *call_id,
        }
    }

    /// Whether this event is part of SDP/ICE negotiation
    ///
    /// Lifecycle events (`Accept`, `Reject`, `End`, `Reaction`) are consumed by
    /// the session facade, not the negotiation core.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. }
                | Self::Answer { .. }
                | Self::IceCandidate { .. }
                | Self::RequestOffer { .. }
        )
    }
}

/// Notifications emitted to session observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// Outbound offer published (first attempt or retry)
    OfferSent {
        /// Call identifier
        call_id: CallId,
        /// Zero-based attempt counter; > 0 means an ICE restart retry
        attempt: u32,
    },
    /// Answer published back to the initiator
    AnswerSent {
        /// Call identifier
        call_id: CallId,
    },
    /// Media path established
    ConnectionEstablished {
        /// Call identifier
        call_id: CallId,
    },
    /// Negotiation or transport failed fatally
    ConnectionFailed {
        /// Call identifier
        call_id: CallId,
        /// Human-readable description
        error: String,
    },
    /// Remote participant accepted
    CallAccepted {
        /// Call identifier
        call_id: CallId,
    },
    /// Remote participant rejected
    CallRejected {
        /// Call identifier
        call_id: CallId,
    },
    /// Call ended (either side)
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
    /// In-call reaction received
    ReactionReceived {
        /// Call identifier
        call_id: CallId,
        /// Emoji payload
        emoji: String,
        /// Sender
        from: Option<I>,
    },
    /// Outbound video source switched
    TrackSourceChanged {
        /// Call identifier
        call_id: CallId,
        /// The now-active source
        source: TrackSource,
    },
}

/// Read-only snapshot of the session state the UI observes
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Ids of local outbound tracks
    pub local_tracks: Vec<String>,
    /// Ids of remote inbound tracks
    pub remote_tracks: Vec<String>,
    /// Whether the media path is established
    pub connected: bool,
    /// The active outbound video source, if any
    pub active_source: Option<TrackSource>,
    /// Last fatal error, human readable; cleared on connect
    pub error: Option<String>,
    /// When the connection was established
    pub connected_at: Option<DateTime<Utc>>,
}

/// Retry policy for offer/answer negotiation
///
/// Timing knobs live here rather than in constants so tests can compress time
/// and hosts can tune for their relay latency.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How long the initiator waits for an answer before an ICE-restart retry
    pub offer_timeout: Duration,
    /// Additional offers sent after the first before giving up
    pub max_offer_retries: u32,
    /// Grace window before a responder starts requesting the offer
    pub request_offer_grace: Duration,
    /// Interval between repeated offer requests
    pub request_offer_interval: Duration,
    /// Offer requests sent before the responder gives up waiting
    pub max_offer_requests: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(2),
            max_offer_retries: 2,
            request_offer_grace: Duration::from_millis(500),
            request_offer_interval: Duration::from_secs(1),
            max_offer_requests: 3,
        }
    }
}
