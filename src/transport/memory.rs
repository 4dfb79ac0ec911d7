//! In-process network. Every bound endpoint lives in one shared table; opening
//! a session links both sides and pushes a fresh snapshot to each of them.
//!
//! Failure knobs (unreachable endpoints, latency, bind and teardown failures)
//! let tests drive every error path of the session core without sockets.

use super::Transport;
use crate::error::TransportError;
use crate::roster::PeerRecord;
use crate::ticket::ReachabilityHints;
use iroh::{EndpointAddr, EndpointId, SecretKey, TransportAddr};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const FIRST_PORT: u16 = 40_000;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<EndpointId, MemoryNode>,
    next_port: u16,
    binds: usize,
    fail_next_bind: Option<String>,
}

struct MemoryNode {
    addr: SocketAddr,
    links: BTreeMap<EndpointId, PeerRecord>,
    snapshot_tx: watch::Sender<Vec<PeerRecord>>,
    reachable: bool,
    latency: Duration,
    fail_teardown: bool,
    unbind_latency: Duration,
    fail_unbind: bool,
}

impl MemoryNode {
    fn publish(&self) {
        self.snapshot_tx.send_replace(self.links.values().cloned().collect());
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network with a fresh identity per bind.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { network: self.clone(), secret_key: None }
    }

    /// A transport that always binds with `secret_key`, keeping its identity across restarts.
    pub fn transport_with_key(&self, secret_key: SecretKey) -> MemoryTransport {
        MemoryTransport { network: self.clone(), secret_key: Some(secret_key) }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total successful binds since the network was created.
    pub fn bind_count(&self) -> usize {
        self.state().binds
    }

    pub fn is_bound(&self, id: &EndpointId) -> bool {
        self.state().nodes.contains_key(id)
    }

    pub fn bound_count(&self) -> usize {
        self.state().nodes.len()
    }

    pub fn fail_next_bind(&self, reason: impl Into<String>) {
        self.state().fail_next_bind = Some(reason.into());
    }

    pub fn set_reachable(&self, id: &EndpointId, reachable: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.reachable = reachable;
        }
    }

    /// Delay before a session to `id` is established.
    pub fn set_latency(&self, id: &EndpointId, latency: Duration) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.latency = latency;
        }
    }

    /// Make `close_session` on `id` report failure (the link is still dropped locally).
    pub fn fail_teardown(&self, id: &EndpointId, fail: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.fail_teardown = fail;
        }
    }

    /// Delay before `unbind` of `id` completes.
    pub fn set_unbind_latency(&self, id: &EndpointId, latency: Duration) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.unbind_latency = latency;
        }
    }

    /// Make `unbind` of `id` report failure after the endpoint is gone.
    pub fn fail_unbind(&self, id: &EndpointId, fail: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.fail_unbind = fail;
        }
    }

    /// Flip the liveness of `peer` as seen by `owner`, pushing a snapshot to `owner`.
    pub fn set_link_online(&self, owner: &EndpointId, peer: &EndpointId, online: bool) {
        let mut state = self.state();
        if let Some(node) = state.nodes.get_mut(owner) {
            if let Some(link) = node.links.get_mut(peer) {
                link.online = online;
                if online {
                    link.last_seen = Some(crate::roster::now_ms());
                }
                node.publish();
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    secret_key: Option<SecretKey>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[derive(Clone, Debug)]
pub struct MemoryHandle {
    id: EndpointId,
}

impl MemoryHandle {
    pub fn id(&self) -> EndpointId {
        self.id
    }
}

#[derive(Debug)]
pub struct MemorySession {
    remote: EndpointId,
}

impl MemorySession {
    pub fn remote(&self) -> EndpointId {
        self.remote
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    type Handle = MemoryHandle;
    type Session = MemorySession;

    async fn bind(&self) -> Result<(EndpointId, MemoryHandle), TransportError> {
        let mut state = self.network.state();
        if let Some(reason) = state.fail_next_bind.take() {
            return Err(TransportError::Bind(reason));
        }
        let id = match &self.secret_key {
            Some(key) => key.public(),
            None => SecretKey::generate(&mut rand::rng()).public(),
        };
        if state.nodes.contains_key(&id) {
            return Err(TransportError::Bind(format!("{} is already bound", id.fmt_short())));
        }
        let port = FIRST_PORT + state.next_port;
        state.next_port = state.next_port.wrapping_add(1);
        state.binds += 1;
        let (snapshot_tx, _) = watch::channel(Vec::new());
        state.nodes.insert(
            id,
            MemoryNode {
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                links: BTreeMap::new(),
                snapshot_tx,
                reachable: true,
                latency: Duration::ZERO,
                fail_teardown: false,
                unbind_latency: Duration::ZERO,
                fail_unbind: false,
            },
        );
        tracing::debug!("Memory endpoint bound: {} on port {port}", id.fmt_short());
        Ok((id, MemoryHandle { id }))
    }

    async fn unbind(&self, handle: MemoryHandle) -> Result<(), TransportError> {
        let (latency, fail) = {
            let state = self.network.state();
            match state.nodes.get(&handle.id) {
                Some(node) => (node.unbind_latency, node.fail_unbind),
                None => return Ok(()),
            }
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut state = self.network.state();
            let Some(node) = state.nodes.remove(&handle.id) else {
                return Ok(());
            };
            for remote in node.links.keys() {
                if let Some(other) = state.nodes.get_mut(remote) {
                    if other.links.remove(&handle.id).is_some() {
                        other.publish();
                    }
                }
            }
        }
        tracing::debug!("Memory endpoint unbound: {}", handle.id.fmt_short());
        if fail {
            return Err(TransportError::Teardown(format!("{} did not close cleanly", handle.id.fmt_short())));
        }
        Ok(())
    }

    fn local_reachability_hints(&self, handle: &MemoryHandle) -> ReachabilityHints {
        self.network
            .state()
            .nodes
            .get(&handle.id)
            .map(|n| [TransportAddr::Ip(n.addr)].into_iter().collect())
            .unwrap_or_default()
    }

    async fn open_session(
        &self,
        handle: &MemoryHandle,
        addr: EndpointAddr,
        display_name: &str,
        timeout: Duration,
    ) -> Result<MemorySession, TransportError> {
        let peer = addr.id;
        let unreachable = |reason: &str| TransportError::Unreachable { peer, reason: reason.to_string() };
        if peer == handle.id {
            return Err(unreachable("cannot open a session to ourselves"));
        }

        let latency = {
            let state = self.network.state();
            if !state.nodes.contains_key(&handle.id) {
                return Err(unreachable("local endpoint is closed"));
            }
            match state.nodes.get(&peer) {
                Some(node) if node.reachable => node.latency,
                _ => return Err(unreachable("no route to endpoint")),
            }
        };

        let started = Instant::now();
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout { peer, after: timeout });
        }
        tokio::time::sleep(latency).await;
        let rtt_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

        let mut state = self.network.state();
        if !state.nodes.contains_key(&handle.id) || !state.nodes.contains_key(&peer) {
            return Err(unreachable("endpoint went away during handshake"));
        }
        for (owner, other) in [(handle.id, peer), (peer, handle.id)] {
            if let Some(node) = state.nodes.get_mut(&owner) {
                node.links.insert(other, PeerRecord::connected(other, display_name, rtt_ms));
                node.publish();
            }
        }
        Ok(MemorySession { remote: peer })
    }

    async fn session_to(&self, handle: &MemoryHandle, peer: EndpointId) -> Option<MemorySession> {
        let state = self.network.state();
        let linked = state.nodes.get(&handle.id)?.links.contains_key(&peer);
        linked.then_some(MemorySession { remote: peer })
    }

    async fn close_session(&self, handle: &MemoryHandle, session: MemorySession) -> Result<(), TransportError> {
        let mut state = self.network.state();
        let mut fail = false;
        for (owner, other) in [(handle.id, session.remote), (session.remote, handle.id)] {
            if let Some(node) = state.nodes.get_mut(&owner) {
                if owner == handle.id {
                    fail = node.fail_teardown;
                }
                if node.links.remove(&other).is_some() {
                    node.publish();
                }
            }
        }
        if fail {
            return Err(TransportError::Teardown(format!(
                "{} did not acknowledge close",
                session.remote.fmt_short()
            )));
        }
        Ok(())
    }

    fn subscribe(&self, handle: &MemoryHandle) -> watch::Receiver<Vec<PeerRecord>> {
        match self.network.state().nodes.get(&handle.id) {
            Some(node) => node.snapshot_tx.subscribe(),
            // Sender dropped immediately: the receiver reports closed.
            None => watch::channel(Vec::new()).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_links_both_sides() {
        let net = MemoryNetwork::new();
        let t = net.transport();
        let (a, ha) = t.bind().await.unwrap();
        let (b, hb) = t.bind().await.unwrap();
        let rx_b = t.subscribe(&hb);

        let session = t
            .open_session(&ha, EndpointAddr::from(b), "bob", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.remote(), b);
        let seen_by_b = rx_b.borrow().clone();
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].identity, a);
        assert_eq!(seen_by_b[0].display_name, "bob");
        assert!(seen_by_b[0].online);

        assert!(t.session_to(&hb, a).await.is_some());
        assert!(t.session_to(&hb, b).await.is_none());

        t.close_session(&ha, session).await.unwrap();
        assert!(rx_b.borrow().is_empty());
        assert!(t.session_to(&hb, a).await.is_none());
        assert!(t.subscribe(&ha).borrow().is_empty());
    }

    #[tokio::test]
    async fn unreachable_and_timeout() {
        let net = MemoryNetwork::new();
        let t = net.transport();
        let (_, ha) = t.bind().await.unwrap();
        let (b, _hb) = t.bind().await.unwrap();

        net.set_reachable(&b, false);
        let err = t
            .open_session(&ha, EndpointAddr::from(b), "x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));

        net.set_reachable(&b, true);
        net.set_latency(&b, Duration::from_millis(200));
        let err = t
            .open_session(&ha, EndpointAddr::from(b), "x", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(t.subscribe(&ha).borrow().is_empty());
    }

    #[tokio::test]
    async fn unbind_closes_push_channel_and_unlinks_peers() {
        let net = MemoryNetwork::new();
        let t = net.transport();
        let (_, ha) = t.bind().await.unwrap();
        let (b, hb) = t.bind().await.unwrap();
        t.open_session(&ha, EndpointAddr::from(b), "x", Duration::from_secs(1)).await.unwrap();

        let mut rx_a = t.subscribe(&ha);
        let rx_b = t.subscribe(&hb);
        t.unbind(ha.clone()).await.unwrap();
        assert!(rx_a.changed().await.is_err());
        assert!(rx_b.borrow().is_empty());
        // Second unbind is harmless.
        t.unbind(ha).await.unwrap();
        assert_eq!(net.bound_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failing_unbind_still_removes_endpoint() {
        let net = MemoryNetwork::new();
        let t = net.transport();
        let (a, ha) = t.bind().await.unwrap();
        net.set_unbind_latency(&a, Duration::from_secs(5));
        net.fail_unbind(&a, true);

        let started = Instant::now();
        let err = t.unbind(ha).await.unwrap_err();
        assert!(matches!(err, TransportError::Teardown(_)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!net.is_bound(&a));
    }

    #[tokio::test]
    async fn fixed_key_binds_once() {
        let net = MemoryNetwork::new();
        let key = SecretKey::generate(&mut rand::rng());
        let t = net.transport_with_key(key.clone());
        let (id, h) = t.bind().await.unwrap();
        assert_eq!(id, key.public());
        assert!(matches!(t.bind().await, Err(TransportError::Bind(_))));
        t.unbind(h).await.unwrap();
        let (again, _) = t.bind().await.unwrap();
        assert_eq!(again, id);
    }
}
