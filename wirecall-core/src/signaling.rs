//! Signaling coordination
//!
//! One [`SignalingCoordinator`] actor runs per call session. It owns the
//! [`PeerConnectionManager`], the retry timers, and the pending message
//! queue; signaling events, backend events, timer deadlines, and commands
//! from the session facade all arrive on the same `select!` loop and are
//! processed to completion one at a time, so none of the negotiation state
//! needs locking.
//!
//! Role behavior:
//! - The initiator creates and publishes the offer, then arms a no-answer
//!   deadline. Each expiry re-offers with ICE restart, up to
//!   [`RetryPolicy::max_offer_retries`] times, before failing with
//!   [`NegotiationError::NoAnswerAfterRetries`].
//! - The responder never offers. After a grace window it asks the initiator
//!   to (re)send via `RequestOffer` on a fixed interval, capped at
//!   [`RetryPolicy::max_offer_requests`] attempts.

use crate::channel::ChannelRef;
use crate::identity::PeerIdentity;
use crate::media::MediaPipeline;
use crate::peer::{NegotiationError, NegotiationFactory, PeerConnectionManager, PeerEvent};
use crate::types::{
    CallEvent, CallId, PeerConnectionState, RetryPolicy, SessionDescription, SessionSnapshot,
    SignalEvent, TrackSource,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Per-call parameters the coordinator needs
#[derive(Debug, Clone)]
pub struct CoordinatorConfig<I: PeerIdentity> {
    /// Call correlation id; mismatched inbound events are dropped
    pub call_id: CallId,
    /// Local participant
    pub local: I,
    /// Remote participant
    pub remote: I,
    /// Whether this side creates the offer
    pub initiator: bool,
    /// Timing and retry knobs
    pub retry: RetryPolicy,
}

enum Command {
    Start,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running coordinator actor
///
/// Dropping the handle does not stop the actor; call
/// [`CoordinatorHandle::shutdown`].
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// Begin negotiation for the configured role
    pub async fn start(&self) {
        let _ = self.commands.send(Command::Start).await;
    }

    /// Stop the actor, closing the peer connection and cancelling all
    /// timers. Idempotent; safe to call on an already stopped actor.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Spawns the per-call signaling actor
pub struct SignalingCoordinator;

impl SignalingCoordinator {
    /// Spawn the actor for one call
    ///
    /// The actor subscribes to the channel immediately, so negotiation
    /// events arriving before [`CoordinatorHandle::start`] are queued and
    /// replayed once the peer connection exists.
    pub fn spawn<I: PeerIdentity>(
        config: CoordinatorConfig<I>,
        channel: Arc<ChannelRef<I>>,
        factory: Arc<dyn NegotiationFactory>,
        pipeline: MediaPipeline,
        events: broadcast::Sender<CallEvent<I>>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> CoordinatorHandle {
        let (commands, command_rx) = mpsc::channel(16);
        let signal_rx = channel.subscribe();
        let source_rx = pipeline.subscribe_source_changes();
        let actor = Actor {
            config,
            channel,
            factory,
            pipeline,
            events,
            snapshot_tx: snapshot,
            snapshot: SessionSnapshot::default(),
            manager: None,
            pending: VecDeque::new(),
            last_offer: None,
            offer_handled: false,
            answer_handled: false,
            offer_attempts: 0,
            offer_deadline: None,
            request_deadline: None,
            requests_sent: 0,
            ice_restart_used: false,
            finished: false,
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx, source_rx));
        CoordinatorHandle {
            commands,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }
}

struct Actor<I: PeerIdentity> {
    config: CoordinatorConfig<I>,
    channel: Arc<ChannelRef<I>>,
    factory: Arc<dyn NegotiationFactory>,
    pipeline: MediaPipeline,
    events: broadcast::Sender<CallEvent<I>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    snapshot: SessionSnapshot,

    manager: Option<PeerConnectionManager>,
    /// Negotiation events that arrived before the connection existed
    pending: VecDeque<SignalEvent<I>>,
    /// Most recent local offer, replayed on `RequestOffer`
    last_offer: Option<SessionDescription>,
    offer_handled: bool,
    answer_handled: bool,
    offer_attempts: u32,
    offer_deadline: Option<Instant>,
    request_deadline: Option<Instant>,
    requests_sent: u32,
    ice_restart_used: bool,
    /// Set on fatal failure or remote end; timers stay cancelled
    finished: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_peer_event(
    rx: &mut Option<broadcast::Receiver<PeerEvent>>,
) -> Result<PeerEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<I: PeerIdentity> Actor<I> {
    #[tracing::instrument(
        name = "signaling",
        skip_all,
        fields(call_id = %self.config.call_id, initiator = self.config.initiator)
    )]
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: broadcast::Receiver<SignalEvent<I>>,
        mut sources: broadcast::Receiver<TrackSource>,
    ) {
        let mut peer_rx: Option<broadcast::Receiver<PeerEvent>> = None;
        loop {
            let next_deadline = match (self.offer_deadline, self.request_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => {
                        if let Some(rx) = self.handle_start().await {
                            peer_rx = Some(rx);
                        }
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                signal = signals.recv() => match signal {
                    Ok(signal) => self.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Signal subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Signal channel closed");
                        self.teardown().await;
                        return;
                    }
                },
                peer_event = recv_peer_event(&mut peer_rx) => match peer_event {
                    Ok(peer_event) => self.handle_peer_event(peer_event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Peer event subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        peer_rx = None;
                    }
                },
                source = sources.recv() => {
                    if let Ok(source) = source {
                        self.handle_source_change(source);
                    }
                },
                _ = sleep_until_opt(next_deadline), if next_deadline.is_some() => {
                    self.handle_deadline().await;
                }
            }
        }
    }

    async fn handle_start(&mut self) -> Option<broadcast::Receiver<PeerEvent>> {
        if self.manager.is_some() || self.finished {
            return None;
        }
        let peer_rx = match self.build_connection().await {
            Ok(rx) => rx,
            Err(error) => {
                self.fail(error.to_string()).await;
                return None;
            }
        };

        // Replay everything that arrived before the connection existed, in
        // arrival order.
        while let Some(signal) = self.pending.pop_front() {
            self.dispatch_negotiation(signal).await;
        }
        if self.finished {
            return Some(peer_rx);
        }

        if self.config.initiator {
            // A queued offer request replayed above already produces the
            // offer; creating a second one would replace the local SDP the
            // remote is answering.
            if !self.answer_handled && self.last_offer.is_none() {
                self.send_offer(false).await;
            }
        } else if !self.offer_handled {
            self.request_deadline = Some(Instant::now() + self.config.retry.request_offer_grace);
        }
        Some(peer_rx)
    }

    async fn build_connection(
        &mut self,
    ) -> Result<broadcast::Receiver<PeerEvent>, NegotiationError> {
        let backend = self.factory.create().await?;
        let manager = PeerConnectionManager::new(backend);
        let peer_rx = manager.subscribe();

        if let Some(stream) = self.pipeline.local_stream().await {
            if let Some(audio) = &stream.audio {
                manager.add_track(audio.track.clone()).await?;
            }
            if let Some(video) = &stream.video {
                let sender = manager.add_track(video.track.clone()).await?;
                self.pipeline
                    .set_video_sender(sender)
                    .await
                    .map_err(|e| NegotiationError::Backend(e.to_string()))?;
            }
            self.snapshot.local_tracks = stream.track_ids();
            self.push_snapshot();
        }

        self.manager = Some(manager);
        tracing::debug!("Peer connection constructed");
        Ok(peer_rx)
    }

    fn handle_source_change(&mut self, source: TrackSource) {
        tracing::debug!(?source, "Outbound video source changed");
        self.snapshot.active_source = Some(source.clone());
        self.push_snapshot();
        self.emit(CallEvent::TrackSourceChanged {
            call_id: self.config.call_id,
            source,
        });
    }

    async fn handle_signal(&mut self, signal: SignalEvent<I>) {
        if signal.call_id() != self.config.call_id {
            tracing::trace!(
                event_call_id = %signal.call_id(),
                "Dropping signal for a different call"
            );
            return;
        }
        match signal {
            SignalEvent::Accept { call_id } => {
                self.emit(CallEvent::CallAccepted { call_id });
            }
            SignalEvent::Reject { call_id } => {
                tracing::info!("Call rejected by remote");
                self.teardown().await;
                self.emit(CallEvent::CallRejected { call_id });
            }
            SignalEvent::End { call_id } => {
                tracing::info!("Call ended by remote");
                self.teardown().await;
                self.emit(CallEvent::CallEnded { call_id });
            }
            SignalEvent::Reaction { call_id, emoji } => {
                self.emit(CallEvent::ReactionReceived {
                    call_id,
                    emoji,
                    from: Some(self.config.remote.clone()),
                });
            }
            negotiation => {
                if !self.addressed_to_us(&negotiation) {
                    return;
                }
                if self.manager.is_none() {
                    tracing::debug!("Queueing signal until the connection is constructed");
                    self.pending.push_back(negotiation);
                    return;
                }
                self.dispatch_negotiation(negotiation).await;
            }
        }
    }

    fn addressed_to_us(&self, signal: &SignalEvent<I>) -> bool {
        let target = match signal {
            SignalEvent::Offer { target, .. }
            | SignalEvent::Answer { target, .. }
            | SignalEvent::IceCandidate { target, .. }
            | SignalEvent::RequestOffer { target, .. } => target,
            _ => return true,
        };
        if target.unique_id() == self.config.local.unique_id() {
            true
        } else {
            tracing::trace!("Dropping signal addressed to another participant");
            false
        }
    }

    async fn dispatch_negotiation(&mut self, signal: SignalEvent<I>) {
        match signal {
            SignalEvent::Offer { offer, .. } => self.handle_offer(offer).await,
            SignalEvent::Answer { answer, .. } => self.handle_answer(answer).await,
            SignalEvent::IceCandidate { candidate, .. } => {
                if let Some(manager) = self.manager.as_mut() {
                    if let Err(error) = manager.add_remote_candidate(candidate).await {
                        tracing::warn!(%error, "Failed to apply remote candidate");
                    }
                }
            }
            SignalEvent::RequestOffer { .. } => self.handle_request_offer().await,
            _ => {}
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) {
        if self.offer_handled {
            tracing::debug!("Duplicate offer ignored");
            return;
        }
        let Some(manager) = self.manager.as_mut() else {
            return;
        };
        match manager.apply_remote_offer(offer).await {
            Ok(answer) => {
                self.offer_handled = true;
                self.request_deadline = None;
                let call_id = self.config.call_id;
                self.publish(SignalEvent::Answer {
                    call_id,
                    answer,
                    target: self.config.remote.clone(),
                })
                .await;
                self.emit(CallEvent::AnswerSent { call_id });
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to apply remote offer");
                if matches!(error, NegotiationError::RemoteDescriptionRejected(_)) {
                    self.fail(error.to_string()).await;
                }
            }
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        if self.answer_handled {
            tracing::debug!("Duplicate answer ignored");
            return;
        }
        let Some(manager) = self.manager.as_mut() else {
            return;
        };
        match manager.apply_remote_answer(answer).await {
            Ok(()) => {
                self.answer_handled = true;
                self.offer_attempts = 0;
                self.offer_deadline = None;
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to apply remote answer");
                if matches!(error, NegotiationError::RemoteDescriptionRejected(_)) {
                    self.fail(error.to_string()).await;
                }
            }
        }
    }

    async fn handle_request_offer(&mut self) {
        if !self.config.initiator {
            return;
        }
        tracing::debug!("Remote requested the offer");
        match self.last_offer.clone() {
            Some(offer) => {
                let call_id = self.config.call_id;
                self.publish(SignalEvent::Offer {
                    call_id,
                    offer,
                    target: self.config.remote.clone(),
                })
                .await;
                self.emit(CallEvent::OfferSent {
                    call_id,
                    attempt: self.offer_attempts,
                });
            }
            None => self.send_offer(false).await,
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(manager) = self.manager.as_mut() else {
            return;
        };
        match manager.create_offer(ice_restart).await {
            Ok(offer) => {
                self.last_offer = Some(offer.clone());
                let call_id = self.config.call_id;
                self.publish(SignalEvent::Offer {
                    call_id,
                    offer,
                    target: self.config.remote.clone(),
                })
                .await;
                self.offer_deadline = Some(Instant::now() + self.config.retry.offer_timeout);
                self.emit(CallEvent::OfferSent {
                    call_id,
                    attempt: self.offer_attempts,
                });
            }
            Err(error) => self.fail(error.to_string()).await,
        }
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();
        if self.offer_deadline.is_some_and(|d| d <= now) {
            self.offer_deadline = None;
            if !self.answer_handled {
                if self.ice_restart_used {
                    // A mid-call recovery restart went unanswered; the call
                    // is dead, not merely slow to answer.
                    self.fail(NegotiationError::ConnectionFailed.to_string())
                        .await;
                    return;
                }
                if self.offer_attempts >= self.config.retry.max_offer_retries {
                    tracing::warn!(
                        attempts = self.offer_attempts,
                        "No answer after retries, giving up"
                    );
                    self.fail(NegotiationError::NoAnswerAfterRetries.to_string())
                        .await;
                    return;
                }
                self.offer_attempts += 1;
                tracing::info!(attempt = self.offer_attempts, "Re-offering with ICE restart");
                self.send_offer(true).await;
            }
        }
        if self.request_deadline.is_some_and(|d| d <= now) {
            self.request_deadline = None;
            if !self.offer_handled {
                if self.requests_sent >= self.config.retry.max_offer_requests {
                    tracing::debug!("Offer request attempts exhausted, waiting passively");
                    return;
                }
                self.requests_sent += 1;
                let call_id = self.config.call_id;
                self.publish(SignalEvent::RequestOffer {
                    call_id,
                    from: self.config.local.clone(),
                    target: self.config.remote.clone(),
                })
                .await;
                self.request_deadline =
                    Some(Instant::now() + self.config.retry.request_offer_interval);
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.publish(SignalEvent::IceCandidate {
                    call_id: self.config.call_id,
                    candidate,
                    target: self.config.remote.clone(),
                })
                .await;
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::debug!(?state, "Connection state changed");
                match state {
                    PeerConnectionState::Connected => {
                        self.cancel_timers();
                        self.snapshot.connected = true;
                        self.snapshot.error = None;
                        self.snapshot.connected_at = Some(chrono::Utc::now());
                        self.push_snapshot();
                        self.emit(CallEvent::ConnectionEstablished {
                            call_id: self.config.call_id,
                        });
                    }
                    PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                        self.snapshot.connected = false;
                        self.push_snapshot();
                    }
                    PeerConnectionState::Failed => self.recover_or_fail().await,
                    _ => {}
                }
            }
            PeerEvent::IceStateChanged(state) => {
                tracing::trace!(?state, "ICE state changed");
                if state == crate::types::IceState::Failed {
                    self.recover_or_fail().await;
                }
            }
            PeerEvent::TrackReceived { track_id, kind } => {
                tracing::debug!(%track_id, ?kind, "Remote track received");
                if !self.snapshot.remote_tracks.contains(&track_id) {
                    self.snapshot.remote_tracks.push(track_id);
                    self.push_snapshot();
                }
            }
        }
    }

    /// One ICE-restart recovery per call; the second failure is fatal.
    async fn recover_or_fail(&mut self) {
        if self.finished {
            return;
        }
        if self.config.initiator && !self.ice_restart_used {
            self.ice_restart_used = true;
            // The restart needs a fresh answer; the one-shot guard only
            // protects against re-delivery of the pre-restart answer.
            self.answer_handled = false;
            tracing::info!("Transport failed, attempting ICE restart");
            self.send_offer(true).await;
        } else {
            self.fail(NegotiationError::ConnectionFailed.to_string())
                .await;
        }
    }

    async fn fail(&mut self, error: String) {
        if self.finished {
            return;
        }
        tracing::warn!(%error, "Negotiation failed fatally");
        self.finished = true;
        self.cancel_timers();
        if let Some(manager) = self.manager.as_mut() {
            let _ = manager.close().await;
        }
        self.snapshot.connected = false;
        self.snapshot.error = Some(error.clone());
        self.push_snapshot();
        self.emit(CallEvent::ConnectionFailed {
            call_id: self.config.call_id,
            error,
        });
    }

    async fn teardown(&mut self) {
        self.cancel_timers();
        self.finished = true;
        self.pending.clear();
        if let Some(manager) = self.manager.as_mut() {
            if let Err(error) = manager.close().await {
                tracing::debug!(%error, "Error closing peer connection");
            }
        }
        self.snapshot.connected = false;
        self.snapshot.remote_tracks.clear();
        self.snapshot.active_source = None;
        self.push_snapshot();
    }

    fn cancel_timers(&mut self) {
        self.offer_deadline = None;
        self.request_deadline = None;
    }

    async fn publish(&self, signal: SignalEvent<I>) {
        // Unavailable sends are dropped; the retry and request-offer timers
        // cover recovery once the relay reconnects.
        if let Err(error) = self.channel.publish(signal).await {
            tracing::warn!(%error, "Dropping signal, channel unavailable");
        }
    }

    fn emit(&self, event: CallEvent<I>) {
        let _ = self.events.send(event);
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }
}
