//! Call session facade
//!
//! [`CallSession`] is the surface the host UI talks to: start and end the
//! call, mute, switch the outbound video source, send lifecycle signals, and
//! observe progress through a watch snapshot and an event stream. It wires a
//! [`MediaPipeline`] and a [`SignalingCoordinator`] together; all negotiation
//! happens inside the coordinator actor.

use crate::channel::{ChannelError, ChannelRef};
use crate::filter::FilterId;
use crate::identity::PeerIdentity;
use crate::media::{CaptureBackend, DeviceIds, MediaError, MediaPipeline};
use crate::peer::NegotiationFactory;
use crate::signaling::{CoordinatorConfig, CoordinatorHandle, SignalingCoordinator};
use crate::types::{
    CallEvent, CallId, CallState, ConversationId, MediaKind, RetryPolicy, SessionSnapshot,
    SignalEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Session-level errors surfaced to the host UI
#[derive(Error, Debug)]
pub enum SessionError {
    /// Media acquisition or pipeline failure
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The event-relay channel refused a lifecycle send
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The requested operation does not fit the call state machine
    #[error("invalid call state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: CallState,
        /// Requested state
        to: CallState,
    },

    /// The session has already been torn down
    #[error("call already ended")]
    Ended,
}

/// Parameters for one logical call
#[derive(Debug, Clone)]
pub struct CallSessionConfig<I: PeerIdentity> {
    /// Call correlation id
    pub call_id: CallId,
    /// Host-app conversation the call belongs to
    pub conversation: ConversationId,
    /// Local participant
    pub local: I,
    /// Remote participant
    pub remote: I,
    /// Whether this side creates the offer
    pub initiator: bool,
    /// Audio-only or audio and video
    pub media: MediaKind,
    /// Negotiation timing knobs
    pub retry: RetryPolicy,
}

impl<I: PeerIdentity> CallSessionConfig<I> {
    /// Config for an outgoing call with a fresh call id
    pub fn outgoing(conversation: ConversationId, local: I, remote: I, media: MediaKind) -> Self {
        Self {
            call_id: CallId::new(),
            conversation,
            local,
            remote,
            initiator: true,
            media,
            retry: RetryPolicy::default(),
        }
    }

    /// Config for answering an incoming call signal
    pub fn incoming(
        call_id: CallId,
        conversation: ConversationId,
        local: I,
        remote: I,
        media: MediaKind,
    ) -> Self {
        Self {
            call_id,
            conversation,
            local,
            remote,
            initiator: false,
            media,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One logical call between the local and one remote participant
pub struct CallSession<I: PeerIdentity> {
    config: CallSessionConfig<I>,
    channel: Arc<ChannelRef<I>>,
    pipeline: MediaPipeline,
    coordinator: CoordinatorHandle,
    events: broadcast::Sender<CallEvent<I>>,
    snapshot: watch::Receiver<SessionSnapshot>,
    state: parking_lot::Mutex<CallState>,
    ended: AtomicBool,
    lifecycle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<I: PeerIdentity> CallSession<I> {
    /// Create a session and spawn its coordinator actor
    ///
    /// The session immediately listens for signaling addressed to its call
    /// id; negotiation begins on [`CallSession::start`].
    pub fn new(
        config: CallSessionConfig<I>,
        channel: Arc<ChannelRef<I>>,
        capture: Arc<dyn CaptureBackend>,
        factory: Arc<dyn NegotiationFactory>,
    ) -> Arc<Self> {
        let pipeline = MediaPipeline::new(capture);
        let (events, _) = broadcast::channel(64);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());

        let coordinator = SignalingCoordinator::spawn(
            CoordinatorConfig {
                call_id: config.call_id,
                local: config.local.clone(),
                remote: config.remote.clone(),
                initiator: config.initiator,
                retry: config.retry.clone(),
            },
            channel.clone(),
            factory,
            pipeline.clone(),
            events.clone(),
            snapshot_tx,
        );

        let session = Arc::new(Self {
            config,
            channel,
            pipeline,
            coordinator,
            events,
            snapshot,
            state: parking_lot::Mutex::new(CallState::Idle),
            ended: AtomicBool::new(false),
            lifecycle: parking_lot::Mutex::new(None),
        });
        session.spawn_lifecycle();
        session
    }

    /// The call id
    pub fn call_id(&self) -> CallId {
        self.config.call_id
    }

    /// The session's configuration
    pub fn config(&self) -> &CallSessionConfig<I> {
        &self.config
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Observe session snapshots
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.events.subscribe()
    }

    /// Acquire local media and begin negotiation for the configured role
    #[tracing::instrument(skip(self), fields(call_id = %self.config.call_id))]
    pub async fn start(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        let to = if self.config.initiator {
            CallState::Calling
        } else {
            CallState::Connecting
        };
        self.transition_checked(to)?;

        if let Err(error) = self.pipeline.acquire(self.config.media, None).await {
            self.transition(CallState::Failed);
            return Err(error.into());
        }
        self.coordinator.start().await;
        Ok(())
    }

    /// Acquire media from specific devices instead of the defaults
    pub async fn start_with_devices(&self, devices: DeviceIds) -> Result<(), SessionError> {
        self.ensure_active()?;
        let to = if self.config.initiator {
            CallState::Calling
        } else {
            CallState::Connecting
        };
        self.transition_checked(to)?;

        if let Err(error) = self.pipeline.acquire(self.config.media, Some(devices)).await {
            self.transition(CallState::Failed);
            return Err(error.into());
        }
        self.coordinator.start().await;
        Ok(())
    }

    /// Tell the initiator we are taking the call
    pub async fn accept(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.channel
            .publish(SignalEvent::Accept {
                call_id: self.config.call_id,
            })
            .await?;
        Ok(())
    }

    /// Decline the call and tear the session down
    pub async fn reject(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.channel
            .publish(SignalEvent::Reject {
                call_id: self.config.call_id,
            })
            .await?;
        self.teardown(false).await;
        Ok(())
    }

    /// Send an ephemeral in-call reaction
    pub async fn send_reaction(&self, emoji: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.channel
            .publish(SignalEvent::Reaction {
                call_id: self.config.call_id,
                emoji: emoji.into(),
            })
            .await?;
        Ok(())
    }

    /// Flip the audio mute flag, returning the new enabled state
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.toggle_audio().await?)
    }

    /// Flip the video mute flag, returning the new enabled state
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.toggle_video().await?)
    }

    /// Switch the outbound video back to the raw camera feed
    pub async fn use_camera(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.use_camera().await?)
    }

    /// Switch the outbound video to a filtered render of the camera feed
    pub async fn apply_filter(&self, id: FilterId) -> Result<(), SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.apply_filter(id).await?)
    }

    /// Share the display instead of the camera
    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.start_screen_share().await?)
    }

    /// Stop sharing the display, restoring the previous source
    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        Ok(self.pipeline.stop_screen_share().await?)
    }

    /// End the call
    ///
    /// Callable from any state, including mid-negotiation and mid-render.
    /// The remote side is notified, then the single teardown path runs:
    /// media stopped, timers cancelled, peer connection closed. Idempotent;
    /// a second call returns immediately.
    #[tracing::instrument(skip(self), fields(call_id = %self.config.call_id))]
    pub async fn end(&self) {
        self.teardown(true).await;
    }

    async fn teardown(&self, notify_remote: bool) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Tearing down call session");
        self.transition(CallState::Ending);

        if notify_remote {
            let end = SignalEvent::End {
                call_id: self.config.call_id,
            };
            if let Err(error) = self.channel.publish(end).await {
                tracing::warn!(%error, "Could not notify remote of call end");
            }
        }

        self.pipeline.shutdown().await;
        self.coordinator.shutdown().await;
        self.transition(CallState::Idle);

        if notify_remote {
            let _ = self.events.send(CallEvent::CallEnded {
                call_id: self.config.call_id,
            });
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.ended.load(Ordering::SeqCst) {
            Err(SessionError::Ended)
        } else {
            Ok(())
        }
    }

    fn transition_checked(&self, to: CallState) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if CallState::is_valid_transition(*state, to) {
            *state = to;
            Ok(())
        } else {
            Err(SessionError::InvalidTransition { from: *state, to })
        }
    }

    /// Best-effort transition; invalid moves are logged and ignored
    fn transition(&self, to: CallState) {
        let mut state = self.state.lock();
        if CallState::is_valid_transition(*state, to) {
            *state = to;
        } else if *state != to {
            tracing::debug!(from = ?*state, ?to, "Skipping invalid state transition");
        }
    }

    fn spawn_lifecycle(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.events.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    CallEvent::AnswerSent { .. } => {
                        session.transition(CallState::Connecting);
                    }
                    CallEvent::ConnectionEstablished { .. } => {
                        session.transition(CallState::Connecting);
                        session.transition(CallState::Connected);
                    }
                    CallEvent::ConnectionFailed { .. } => {
                        session.transition(CallState::Failed);
                    }
                    CallEvent::CallRejected { .. } | CallEvent::CallEnded { .. } => {
                        session.teardown(false).await;
                    }
                    _ => {}
                }
            }
        });
        *self.lifecycle.lock() = Some(task);
    }
}

impl<I: PeerIdentity> Drop for CallSession<I> {
    fn drop(&mut self) {
        if let Some(task) = self.lifecycle.lock().take() {
            task.abort();
        }
    }
}
