//! Wirecall - peer-to-peer call negotiation over an event-relay channel
//!
//! This library implements the signaling and media-track negotiation core for
//! one-to-one calls. It assumes nothing about the transport beyond a thin
//! bidirectional event relay and copes with the messiness that implies:
//!
//! - **Out-of-order delivery**: ICE candidates arriving before the offer are
//!   queued and drained in order once a remote description exists
//! - **At-least-once delivery**: duplicate offers and answers are one-shot
//!   guarded per call, never reprocessed
//! - **Flaky transports**: unanswered offers are retried with ICE restart on
//!   explicit deadlines, responders actively request missing offers
//! - **Socket churn**: the relay handle is re-resolved before every send, so
//!   a host-side reconnect never strands a session on a dead socket
//! - **Live media mutation**: the outbound video track hot-swaps between
//!   camera, filtered render, and screen share without renegotiation
//!
//! # Examples
//!
//! ```rust,no_run
//! use wirecall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     channel: Arc<ChannelRef<PeerIdentityString>>,
//! #     capture: Arc<dyn CaptureBackend>,
//! # ) -> anyhow::Result<()> {
//! let config = CallSessionConfig::outgoing(
//!     ConversationId::new("conv-42"),
//!     PeerIdentityString::new("alice"),
//!     PeerIdentityString::new("bob"),
//!     MediaKind::Video,
//! );
//! let session = CallSession::new(
//!     config,
//!     channel,
//!     capture,
//!     Arc::new(RtcFactory::default()),
//! );
//!
//! let mut events = session.events();
//! session.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::ConnectionEstablished { .. } = event {
//!         session.apply_filter(FilterId::new("noir")).await?;
//!         break;
//!     }
//! }
//!
//! session.end().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Event-relay channel abstraction
pub mod channel;

/// Local media acquisition and the hot-swappable outbound pipeline
pub mod media;

/// Declarative video filters and the pure frame transform
pub mod filter;

/// Peer connection state and the candidate queue
pub mod peer;

/// Negotiation backend over the webrtc crate
pub mod rtc;

/// The per-call signaling coordinator actor
pub mod signaling;

/// Call session facade for host UIs
pub mod session;

// Re-export main types at crate root
pub use channel::{ChannelError, ChannelRef, MemoryChannel, SignalChannel};
pub use filter::{FilterId, FilterSpec};
pub use identity::{PeerIdentity, PeerIdentityString};
pub use media::{
    CaptureBackend, DeviceIds, FrameSource, LocalStream, LocalTrack, MediaAcquisitionError,
    MediaError, MediaPipeline, ScreenCapture, VideoFrame, VideoSender,
};
pub use peer::{
    NegotiationBackend, NegotiationError, NegotiationFactory, PeerConnectionManager, PeerEvent,
};
pub use rtc::{RtcBackend, RtcConfig, RtcFactory, RtcVideoSender};
pub use session::{CallSession, CallSessionConfig, SessionError};
pub use signaling::{CoordinatorConfig, CoordinatorHandle, SignalingCoordinator};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{ChannelRef, MemoryChannel, SignalChannel};
    pub use crate::filter::FilterId;
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::media::{CaptureBackend, DeviceIds, MediaPipeline};
    pub use crate::rtc::{RtcConfig, RtcFactory};
    pub use crate::session::{CallSession, CallSessionConfig, SessionError};
    pub use crate::types::{
        CallEvent, CallId, CallState, ConversationId, MediaKind, RetryPolicy, SessionSnapshot,
        SignalEvent, TrackSource,
    };
}
