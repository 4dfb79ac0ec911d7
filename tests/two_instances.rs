//! Integration test: two session instances on one in-process network.
//!
//! Instance one hands out a ticket, instance two joins with it, and both
//! rosters converge through the push feed.

use std::sync::Arc;
use std::time::Duration;

use peer_session::transport::memory::{MemoryNetwork, MemoryTransport};
use peer_session::{PeerRecord, PeerSession, SessionConfig, SessionError, SessionState};

fn instance(net: &MemoryNetwork) -> PeerSession<MemoryTransport> {
    PeerSession::new(net.transport(), SessionConfig::default())
}

async fn roster_until<F>(s: &PeerSession<MemoryTransport>, mut done: F) -> Vec<PeerRecord>
where
    F: FnMut(&[PeerRecord]) -> bool,
{
    let mut rx = s.subscribe_roster();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let roster = s.get_roster().await;
            if done(&roster) {
                return roster;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("roster never reached expected state")
}

#[tokio::test]
async fn ticket_join_and_disconnect() {
    let net = MemoryNetwork::new();
    let one = instance(&net);
    let two = instance(&net);

    let n1 = one.user_logged_in("alice").await.unwrap().unwrap();
    let n2 = two.user_logged_in("bob").await.unwrap().unwrap();
    assert_ne!(n1, n2);

    let ticket = one.generate_ticket().await.unwrap();
    assert_eq!(ticket.identity(), n1);

    let joined = two.connect(&ticket.to_string(), "bob").await.unwrap();
    assert_eq!(joined.identity, n1);
    assert!(joined.online);

    let roster = roster_until(&one, |r| r.len() == 1).await;
    assert_eq!(roster[0].identity, n2);
    assert_eq!(roster[0].display_name, "bob");
    assert!(roster[0].online);

    one.disconnect(&n2).await.unwrap();
    assert!(one.get_roster().await.is_empty());
    // The link is gone on the far side too.
    roster_until(&two, |r| r.is_empty()).await;
}

#[tokio::test]
async fn switching_user_does_not_wait_for_old_endpoint() {
    let net = MemoryNetwork::new();
    let s = instance(&net);

    let old = s.user_logged_in("alice").await.unwrap().unwrap();
    let new = s.user_logged_in("bob").await.unwrap().unwrap();
    assert_ne!(old, new);
    assert_eq!(s.get_session_state(), SessionState::Running(new));
    assert_eq!(s.active_user().await.as_deref(), Some("bob"));
    assert!(net.is_bound(&new));

    tokio::time::timeout(Duration::from_secs(2), async {
        while net.is_bound(&old) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("old endpoint was never released");
    assert_eq!(net.bound_count(), 1);
}

#[tokio::test]
async fn concurrent_logins_bind_once() {
    let net = MemoryNetwork::new();
    let s = Arc::new(instance(&net));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let s = s.clone();
            tokio::spawn(async move { s.user_logged_in("alice").await })
        })
        .collect();
    let mut ids = Vec::new();
    for t in tasks {
        ids.push(t.await.unwrap().unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(net.bind_count(), 1);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let net = MemoryNetwork::new();
    let s = instance(&net);
    let id = s.user_logged_in("alice").await.unwrap().unwrap();

    s.shutdown().await;
    s.shutdown().await;
    assert_eq!(s.get_session_state(), SessionState::Idle);
    assert!(!net.is_bound(&id));
    assert!(matches!(s.generate_ticket().await, Err(SessionError::NotRunning)));
}

#[tokio::test]
async fn malformed_ticket_is_rejected_before_dialing() {
    let net = MemoryNetwork::new();
    let s = instance(&net);
    s.user_logged_in("alice").await.unwrap();

    for bad in ["", "peer", "peer!!!", "nodeabc", "peerAAAAAAAAAAAA"] {
        let err = s.connect(bad, "x").await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedTicket(_)), "{bad:?} gave {err}");
    }
    assert!(s.get_roster().await.is_empty());
}

#[tokio::test]
async fn peer_leaving_shows_up_in_roster() {
    let net = MemoryNetwork::new();
    let one = instance(&net);
    let two = instance(&net);
    one.user_logged_in("alice").await.unwrap();
    two.user_logged_in("bob").await.unwrap();

    let ticket = one.generate_ticket().await.unwrap();
    two.connect(&ticket.to_string(), "bob").await.unwrap();
    roster_until(&one, |r| r.len() == 1).await;

    two.user_logged_out().await;
    roster_until(&one, |r| r.is_empty()).await;
    assert!(two.get_roster().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_release_of_previous_user_is_only_logged() {
    let net = MemoryNetwork::new();
    let s = instance(&net);
    let old = s.user_logged_in("alice").await.unwrap().unwrap();
    net.set_unbind_latency(&old, Duration::from_secs(30));
    net.fail_unbind(&old, true);

    let new = tokio::time::timeout(Duration::from_secs(1), s.user_logged_in("bob"))
        .await
        .expect("new login waited on the old endpoint")
        .unwrap()
        .unwrap();
    assert_eq!(s.get_session_state(), SessionState::Running(new));

    // The new endpoint is usable while the old one is still going down.
    let other = instance(&net);
    other.user_logged_in("carol").await.unwrap();
    let ticket = s.generate_ticket().await.unwrap();
    other.connect(&ticket.to_string(), "carol").await.unwrap();
    assert!(net.is_bound(&old));

    tokio::time::timeout(Duration::from_secs(60), async {
        while net.is_bound(&old) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old endpoint was never released");
    assert_eq!(s.get_session_state(), SessionState::Running(new));
    roster_until(&s, |r| r.len() == 1 && r[0].display_name == "carol").await;
}
