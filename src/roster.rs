//! Authoritative table of known remote peers.
//!
//! Keyed by [`EndpointId`], so there is never more than one record per peer.
//! Every mutation takes the single write lock for its whole duration, which
//! makes a snapshot replace atomic to readers. A `watch` counter is bumped
//! after each mutation so observers can re-render without polling.

use iroh::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};

/// A known remote peer and its last-known liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: EndpointId,
    /// Label supplied when the session was opened.
    pub display_name: String,
    pub online: bool,
    pub round_trip_ms: Option<f64>,
    /// Unix timestamp (ms) of the last successful contact.
    pub last_seen: Option<u64>,
}

impl PeerRecord {
    /// A freshly connected peer: online and seen now.
    pub fn connected(identity: EndpointId, display_name: impl Into<String>, round_trip_ms: Option<f64>) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            online: true,
            round_trip_ms,
            last_seen: Some(now_ms()),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn replace(peers: &mut BTreeMap<EndpointId, PeerRecord>, records: Vec<PeerRecord>) -> bool {
    let incoming: BTreeMap<EndpointId, PeerRecord> =
        records.into_iter().map(|r| (r.identity, r)).collect();
    if *peers == incoming {
        return false;
    }
    tracing::debug!("Roster snapshot: {} → {} peer(s)", peers.len(), incoming.len());
    *peers = incoming;
    true
}

pub struct Roster {
    peers: RwLock<BTreeMap<EndpointId, PeerRecord>>,
    version_tx: watch::Sender<u64>,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0u64);
        Self {
            peers: RwLock::new(BTreeMap::new()),
            version_tx,
        }
    }

    /// Replace the whole table with `records`. Peers missing from the
    /// snapshot are dropped; duplicate identities keep the last entry.
    pub async fn apply_snapshot(&self, records: Vec<PeerRecord>) {
        let mut peers = self.peers.write().await;
        let changed = replace(&mut peers, records);
        drop(peers);
        if changed {
            self.bump();
        }
    }

    /// Apply whatever snapshot `feed` holds once the write lock is ours, so a
    /// snapshot can never overwrite a newer point mutation with older state.
    pub async fn apply_latest(&self, feed: &mut watch::Receiver<Vec<PeerRecord>>) {
        let mut peers = self.peers.write().await;
        let records = feed.borrow_and_update().clone();
        let changed = replace(&mut peers, records);
        drop(peers);
        if changed {
            self.bump();
        }
    }

    pub async fn upsert(&self, record: PeerRecord) {
        let mut peers = self.peers.write().await;
        peers.insert(record.identity, record);
        drop(peers);
        self.bump();
    }

    /// Returns whether a record was removed. Absent identities are not an error.
    pub async fn remove(&self, identity: &EndpointId) -> bool {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(identity).is_some();
        drop(peers);
        if removed {
            self.bump();
        }
        removed
    }

    pub async fn clear(&self) {
        let mut peers = self.peers.write().await;
        if peers.is_empty() {
            return;
        }
        peers.clear();
        drop(peers);
        self.bump();
    }

    /// All records, ordered by identity.
    pub async fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, identity: &EndpointId) -> Option<PeerRecord> {
        self.peers.read().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Change counter, bumped after every mutation that altered the table.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    fn bump(&self) {
        self.version_tx.send_modify(|v| *v += 1);
    }
}
