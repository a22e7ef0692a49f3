//! Event-relay channel abstraction
//!
//! The engine's only transport primitive is a thin bidirectional event relay:
//! publish a signaling event addressed to a participant, subscribe to events
//! addressed to us, and know whether the relay is currently connected. The
//! relay's own reconnection logic lives in the host app.
//!
//! Because the underlying socket can be replaced mid-call, components never
//! hold a channel directly. They hold a [`ChannelRef`] and re-resolve the
//! current handle immediately before every send.

use crate::identity::PeerIdentity;
use crate::types::SignalEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The relay is not currently connected
    #[error("event-relay channel unavailable")]
    Unavailable,
}

/// Bidirectional event-relay channel
///
/// Implement this over the host app's socket layer. Delivery is at-least-once
/// and unordered across topics; the negotiation core copes with duplicates and
/// reordering itself.
#[async_trait]
pub trait SignalChannel<I: PeerIdentity>: Send + Sync {
    /// Publish a signaling event to the relay
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the relay is disconnected.
    /// Callers log and drop; the coordinator's own timers provide recovery.
    async fn publish(&self, event: SignalEvent<I>) -> Result<(), ChannelError>;

    /// Subscribe to inbound signaling events
    ///
    /// Subscribing is valid before any call exists; events for unknown calls
    /// are filtered by the consumer.
    fn subscribe(&self) -> broadcast::Receiver<SignalEvent<I>>;

    /// Whether the relay is currently connected
    fn is_connected(&self) -> bool;
}

/// Re-resolving reference to the current channel handle
///
/// The host may replace the underlying socket on reconnect. `ChannelRef`
/// models that churn: [`ChannelRef::swap`] installs the replacement and every
/// [`ChannelRef::publish`] resolves the handle at send time, so no component
/// ever addresses a stale socket captured earlier.
pub struct ChannelRef<I: PeerIdentity> {
    current: RwLock<Arc<dyn SignalChannel<I>>>,
}

impl<I: PeerIdentity> ChannelRef<I> {
    /// Wrap an initial channel handle
    pub fn new(channel: Arc<dyn SignalChannel<I>>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(channel),
        })
    }

    /// Replace the underlying channel handle (socket reconnect)
    pub fn swap(&self, channel: Arc<dyn SignalChannel<I>>) {
        *self.current.write() = channel;
    }

    /// Resolve the current handle
    pub fn resolve(&self) -> Arc<dyn SignalChannel<I>> {
        self.current.read().clone()
    }

    /// Publish through the current handle
    ///
    /// # Errors
    ///
    /// Propagates [`ChannelError::Unavailable`] from the resolved handle.
    pub async fn publish(&self, event: SignalEvent<I>) -> Result<(), ChannelError> {
        // Resolve before the await so the guard is released first.
        let channel = self.resolve();
        channel.publish(event).await
    }

    /// Subscribe through the current handle
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent<I>> {
        self.resolve().subscribe()
    }

    /// Whether the current handle is connected
    pub fn is_connected(&self) -> bool {
        self.resolve().is_connected()
    }
}

/// In-process loopback channel
///
/// [`MemoryChannel::pair`] returns two connected endpoints: events published
/// on one side arrive on the other's subscription. Used by the integration
/// tests and useful for host-side simulation.
pub struct MemoryChannel<I: PeerIdentity> {
    inbound: broadcast::Sender<SignalEvent<I>>,
    outbound: broadcast::Sender<SignalEvent<I>>,
    connected: Arc<AtomicBool>,
}

impl<I: PeerIdentity> MemoryChannel<I> {
    /// Create a connected pair of endpoints
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, _) = broadcast::channel(256);
        let (b_tx, _) = broadcast::channel(256);
        let a = Arc::new(Self {
            inbound: a_tx.clone(),
            outbound: b_tx.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        });
        let b = Arc::new(Self {
            inbound: b_tx,
            outbound: a_tx,
            connected: Arc::new(AtomicBool::new(true)),
        });
        (a, b)
    }

    /// Simulate the relay dropping or regaining its connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl<I: PeerIdentity> SignalChannel<I> for MemoryChannel<I> {
    async fn publish(&self, event: SignalEvent<I>) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Unavailable);
        }
        // A send error only means no subscriber yet; at-least-once relays
        // give no delivery guarantee either way.
        let _ = self.outbound.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent<I>> {
        self.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use crate::types::CallId;

    fn end_event(call_id: CallId) -> SignalEvent<PeerIdentityString> {
        SignalEvent::End { call_id }
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_across() {
        let (a, b) = MemoryChannel::<PeerIdentityString>::pair();
        let mut rx = b.subscribe();

        let id = CallId::new();
        a.publish(end_event(id)).await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.call_id(), id);
    }

    #[tokio::test]
    async fn test_disconnected_channel_rejects_publish() {
        let (a, _b) = MemoryChannel::<PeerIdentityString>::pair();
        a.set_connected(false);
        let err = a.publish(end_event(CallId::new())).await.unwrap_err();
        assert_eq!(err, ChannelError::Unavailable);
    }

    #[tokio::test]
    async fn test_channel_ref_resolves_swapped_handle() {
        let (a1, b1) = MemoryChannel::<PeerIdentityString>::pair();
        let (a2, b2) = MemoryChannel::<PeerIdentityString>::pair();

        let channel_ref = ChannelRef::new(a1.clone() as Arc<dyn SignalChannel<_>>);
        let mut rx1 = b1.subscribe();
        let mut rx2 = b2.subscribe();

        let first = CallId::new();
        channel_ref.publish(end_event(first)).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().call_id(), first);

        // Socket churn: replace the handle, the next publish must use it.
        channel_ref.swap(a2 as Arc<dyn SignalChannel<_>>);
        let second = CallId::new();
        channel_ref.publish(end_event(second)).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().call_id(), second);
        assert!(rx1.try_recv().is_err());
    }
}
