//! Ordering guarantees for ICE candidates around the remote description

mod support;

use proptest::prelude::*;
use std::sync::Arc;
use support::AutoConnectBackend;
use wirecall_core::{
    IceCandidateInit, NegotiationBackend, PeerConnectionManager, SessionDescription,
};

fn candidate(n: usize) -> IceCandidateInit {
    IceCandidateInit {
        candidate: format!("candidate:{n} 1 UDP 2122260223 192.0.2.10 50000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

proptest! {
    /// However candidate arrival interleaves with the remote description,
    /// every candidate reaches the backend exactly once, in arrival order.
    #[test]
    fn candidates_apply_exactly_once_in_order(
        total in 0usize..12,
        before in 0usize..12,
    ) {
        let before = before.min(total);
        tokio_test::block_on(async move {
            let backend = AutoConnectBackend::new("prop");
            let mut mgr = PeerConnectionManager::new(backend.clone() as Arc<dyn NegotiationBackend>);

            for n in 0..before {
                mgr.add_remote_candidate(candidate(n)).await.unwrap();
            }
            prop_assert!(backend.candidates.lock().is_empty());
            prop_assert_eq!(mgr.pending_candidates(), before);

            mgr.apply_remote_offer(SessionDescription::offer("v=0")).await.unwrap();

            for n in before..total {
                mgr.add_remote_candidate(candidate(n)).await.unwrap();
            }

            let applied = backend.candidates.lock().clone();
            prop_assert_eq!(applied.len(), total);
            for (n, c) in applied.iter().enumerate() {
                prop_assert_eq!(c, &candidate(n));
            }
            prop_assert_eq!(mgr.pending_candidates(), 0);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn queue_is_not_redrained_on_later_candidates() {
    let backend = AutoConnectBackend::new("redrain");
    let mut mgr = PeerConnectionManager::new(backend.clone() as Arc<dyn NegotiationBackend>);

    mgr.add_remote_candidate(candidate(0)).await.unwrap();
    mgr.apply_remote_offer(SessionDescription::offer("v=0"))
        .await
        .unwrap();
    mgr.add_remote_candidate(candidate(1)).await.unwrap();
    mgr.add_remote_candidate(candidate(2)).await.unwrap();

    // The early candidate shows up once, never again.
    let applied = backend.candidates.lock().clone();
    assert_eq!(applied.len(), 3);
    assert_eq!(applied[0], candidate(0));
    assert_eq!(applied[1], candidate(1));
    assert_eq!(applied[2], candidate(2));
}

#[tokio::test]
async fn closed_connection_drops_candidates() {
    let backend = AutoConnectBackend::new("closed");
    let mut mgr = PeerConnectionManager::new(backend.clone() as Arc<dyn NegotiationBackend>);

    mgr.add_remote_candidate(candidate(0)).await.unwrap();
    mgr.close().await.unwrap();
    mgr.add_remote_candidate(candidate(1)).await.unwrap();

    assert!(backend.candidates.lock().is_empty());
    assert_eq!(mgr.pending_candidates(), 0);
}
