//! Peer sessions over iroh QUIC connections.
//!
//! Single ALPN, single connection per peer. Bi-streams multiplexed by
//! first byte: 0x01 = hello, 0x02 = ping, 0x03 = leaving.
//!
//! The side that opens a session sends a hello carrying the display name; the
//! accepting side registers the link under that name. Every known link is
//! pinged on a fixed heartbeat and the full link table is pushed to
//! subscribers after each sweep and after every membership change.

use super::Transport;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::roster::{now_ms, PeerRecord};
use crate::ticket::ReachabilityHints;
use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

pub const ALPN: &[u8] = b"peer-session/0";
const STREAM_HELLO: u8 = 0x01;
const STREAM_PING: u8 = 0x02;
const STREAM_LEAVING: u8 = 0x03;
const MAX_HELLO_BYTES: usize = 16 * 1024;
const HELLO_ACK: u8 = 0x01;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// First message on a hello stream (length-prefixed JSON).
#[derive(Serialize, Deserialize)]
struct Hello {
    display_name: String,
}

pub struct IrohTransport {
    config: TransportConfig,
}

impl IrohTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

struct Link {
    conn: Connection,
    record: PeerRecord,
}

#[derive(Clone)]
pub struct IrohHandle {
    endpoint: Endpoint,
    links: Arc<Mutex<HashMap<EndpointId, Link>>>,
    snapshot_tx: Arc<watch::Sender<Vec<PeerRecord>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl IrohHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn publish(&self) {
        let records: Vec<PeerRecord> = self.links.lock().await.values().map(|l| l.record.clone()).collect();
        self.snapshot_tx.send_replace(records);
    }

    async fn register(&self, remote: EndpointId, conn: Connection, display_name: String, rtt_ms: Option<f64>) {
        {
            let mut links = self.links.lock().await;
            let total = links.len() + usize::from(!links.contains_key(&remote));
            tracing::info!("Peer linked: {} as {display_name:?} (total: {total})", remote.fmt_short());
            links.insert(remote, Link { conn, record: PeerRecord::connected(remote, display_name, rtt_ms) });
        }
        self.publish().await;
    }

    /// Mark `remote` offline, but only if `conn` is still the link's connection.
    async fn mark_offline(&self, remote: EndpointId, conn: &Connection) {
        let changed = {
            let mut links = self.links.lock().await;
            match links.get_mut(&remote) {
                Some(link) if link.conn.stable_id() == conn.stable_id() && link.record.online => {
                    link.record.online = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::info!("Peer {} went offline", remote.fmt_short());
            self.publish().await;
        }
    }

    async fn remove(&self, remote: EndpointId, conn: &Connection) {
        let removed = {
            let mut links = self.links.lock().await;
            match links.get(&remote) {
                Some(link) if link.conn.stable_id() == conn.stable_id() => links.remove(&remote).is_some(),
                _ => false,
            }
        };
        if removed {
            tracing::info!("Peer {} left", remote.fmt_short());
            self.publish().await;
        }
    }
}

pub struct IrohSession {
    remote: EndpointId,
}

impl IrohSession {
    pub fn remote(&self) -> EndpointId {
        self.remote
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    type Handle = IrohHandle;
    type Session = IrohSession;

    async fn bind(&self) -> Result<(EndpointId, IrohHandle), TransportError> {
        self.bind_endpoint()
            .await
            .map_err(|e| TransportError::Bind(format!("{e:#}")))
    }

    async fn unbind(&self, handle: IrohHandle) -> Result<(), TransportError> {
        handle.shutdown.send_replace(true);
        let conns: Vec<(EndpointId, Connection)> = handle
            .links
            .lock()
            .await
            .drain()
            .map(|(id, link)| (id, link.conn))
            .collect();
        for (peer_id, conn) in conns {
            tokio::spawn(async move {
                if let Err(e) = send_leaving(&conn).await {
                    tracing::debug!("Failed to send leaving to {}: {e}", peer_id.fmt_short());
                }
            });
        }
        // Give the leaving streams a moment to flush
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.publish().await;
        handle.endpoint.close().await;
        Ok(())
    }

    fn local_reachability_hints(&self, handle: &IrohHandle) -> ReachabilityHints {
        handle.endpoint.addr().addrs
    }

    async fn open_session(
        &self,
        handle: &IrohHandle,
        addr: EndpointAddr,
        display_name: &str,
        timeout: Duration,
    ) -> Result<IrohSession, TransportError> {
        let peer = addr.id;
        if peer == handle.endpoint.id() {
            return Err(TransportError::Unreachable { peer, reason: "cannot open a session to ourselves".into() });
        }

        let existing = handle
            .links
            .lock()
            .await
            .get(&peer)
            .map(|l| l.conn.clone())
            .filter(|c| c.close_reason().is_none());
        let fresh = existing.is_none();

        let attempt = async {
            let conn = match existing {
                Some(conn) => conn,
                None => handle.endpoint.connect(addr, ALPN).await?,
            };
            let rtt = send_hello(&conn, display_name).await?;
            Ok::<_, anyhow::Error>((conn, rtt))
        };
        let (conn, rtt) = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => return Err(TransportError::Unreachable { peer, reason: format!("{e:#}") }),
            Err(_) => return Err(TransportError::Timeout { peer, after: timeout }),
        };

        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        handle.register(peer, conn.clone(), display_name.to_string(), Some(rtt_ms)).await;
        if fresh {
            // Inbound streams from this peer (its heartbeat pings, leaving)
            let handle = handle.clone();
            tokio::spawn(async move { dispatch_streams(handle, conn, peer).await });
        }
        Ok(IrohSession { remote: peer })
    }

    async fn session_to(&self, handle: &IrohHandle, peer: EndpointId) -> Option<IrohSession> {
        handle
            .links
            .lock()
            .await
            .contains_key(&peer)
            .then_some(IrohSession { remote: peer })
    }

    async fn close_session(&self, handle: &IrohHandle, session: IrohSession) -> Result<(), TransportError> {
        let link = handle.links.lock().await.remove(&session.remote);
        handle.publish().await;
        let Some(link) = link else {
            return Ok(());
        };
        let res = send_leaving(&link.conn).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        link.conn.close(0u32.into(), b"disconnect");
        res.map_err(|e| TransportError::Teardown(format!("{e:#}")))
    }

    fn subscribe(&self, handle: &IrohHandle) -> watch::Receiver<Vec<PeerRecord>> {
        handle.snapshot_tx.subscribe()
    }
}

impl IrohTransport {
    async fn bind_endpoint(&self) -> Result<(EndpointId, IrohHandle)> {
        let secret_key = match &self.config.key_path {
            Some(path) => load_or_create_key(path).await?,
            None => {
                tracing::info!("No key file configured: using ephemeral key");
                SecretKey::generate(&mut rand::rng())
            }
        };

        let mut builder = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN.to_vec()])
            .transport_config(quic_transport_config()?);
        if !self.config.relay_urls.is_empty() {
            use iroh::{RelayConfig, RelayMap};
            let mut configs = Vec::with_capacity(self.config.relay_urls.len());
            for url in &self.config.relay_urls {
                configs.push(RelayConfig { url: url.parse()?, quic: None });
            }
            tracing::info!("Using custom relay URLs: {:?}", self.config.relay_urls);
            builder = builder.relay_mode(iroh::endpoint::RelayMode::Custom(RelayMap::from_iter(configs)));
        }
        if let Some(port) = self.config.bind_port {
            tracing::info!("Binding QUIC to UDP port {port}");
            builder = builder.bind_addr(std::net::SocketAddr::from(([0, 0, 0, 0], port)))?;
        }
        let endpoint = builder.bind().await?;

        // Wait briefly for the relay so tickets include the relay URL.
        let relay_wait = self.config.relay_wait();
        match tokio::time::timeout(relay_wait, endpoint.online()).await {
            Ok(()) => tracing::info!("Relay connected"),
            Err(_) => tracing::warn!("Relay connection timed out ({relay_wait:?}), proceeding without relay"),
        }

        let (snapshot_tx, _) = watch::channel(Vec::new());
        let handle = IrohHandle {
            endpoint,
            links: Arc::new(Mutex::new(HashMap::new())),
            snapshot_tx: Arc::new(snapshot_tx),
            shutdown: Arc::new(watch::channel(false).0),
        };

        let h = handle.clone();
        tokio::spawn(async move { accept_loop(h).await });
        let h = handle.clone();
        let interval = self.config.heartbeat_interval();
        let ping_timeout = self.config.ping_timeout();
        tokio::spawn(async move { heartbeat_loop(h, interval, ping_timeout).await });

        Ok((handle.endpoint.id(), handle))
    }
}

/// Idle links are kept alive well inside the idle timeout, so a quiet peer
/// stays online between heartbeats.
fn quic_transport_config() -> Result<iroh::endpoint::QuicTransportConfig> {
    Ok(iroh::endpoint::QuicTransportConfig::builder()
        .max_idle_timeout(Some(IDLE_TIMEOUT.try_into()?))
        .keep_alive_interval(KEEP_ALIVE_INTERVAL)
        .build())
}

// --- Connection handling ---

async fn accept_loop(handle: IrohHandle) {
    loop {
        let incoming = match handle.endpoint.accept().await {
            Some(i) => i,
            None => break,
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(handle, incoming).await {
                tracing::warn!("Incoming connection error: {e}");
            }
        });
    }
    tracing::debug!("Accept loop finished");
}

async fn handle_incoming(handle: IrohHandle, incoming: iroh::endpoint::Incoming) -> Result<()> {
    let mut accepting = incoming.accept()?;
    let _alpn = accepting.alpn().await?;
    let conn = accepting.await?;
    let remote = conn.remote_id();
    tracing::info!("Inbound connection from {}", remote.fmt_short());
    dispatch_streams(handle, conn, remote).await;
    Ok(())
}

/// Serve bi-streams on `conn` by type byte until the connection dies.
async fn dispatch_streams(handle: IrohHandle, conn: Connection, remote: EndpointId) {
    loop {
        let (send, mut recv) = match conn.accept_bi().await {
            Ok(s) => s,
            Err(e) => {
                tracing::info!("Connection to {} closed: {e}", remote.fmt_short());
                handle.mark_offline(remote, &conn).await;
                break;
            }
        };

        let mut type_buf = [0u8; 1];
        if recv.read_exact(&mut type_buf).await.is_err() {
            continue;
        }

        match type_buf[0] {
            STREAM_HELLO => {
                let handle = handle.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_hello(&handle, conn, remote, send, recv).await {
                        tracing::warn!("Hello stream error from {}: {e}", remote.fmt_short());
                    }
                });
            }
            STREAM_PING => {
                tokio::spawn(async move {
                    if let Err(e) = answer_ping(send, recv).await {
                        tracing::debug!("Ping from {} failed: {e}", remote.fmt_short());
                    }
                });
            }
            STREAM_LEAVING => {
                handle.remove(remote, &conn).await;
            }
            other => {
                tracing::warn!("Unknown stream type {other} from {}", remote.fmt_short());
            }
        }
    }
}

async fn handle_hello(
    handle: &IrohHandle,
    conn: Connection,
    remote: EndpointId,
    mut send: iroh::endpoint::SendStream,
    mut recv: iroh::endpoint::RecvStream,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_HELLO_BYTES {
        anyhow::bail!("hello too large ({len} bytes)");
    }
    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;
    let hello: Hello = serde_json::from_slice(&buf)?;

    send.write_all(&[HELLO_ACK]).await?;
    send.finish()?;

    handle.register(remote, conn, hello.display_name, None).await;
    Ok(())
}

async fn answer_ping(mut send: iroh::endpoint::SendStream, mut recv: iroh::endpoint::RecvStream) -> Result<()> {
    let mut nonce = [0u8; 1];
    recv.read_exact(&mut nonce).await?;
    send.write_all(&nonce).await?;
    send.finish()?;
    Ok(())
}

/// Announce ourselves on `conn`. Returns the round trip of the exchange.
async fn send_hello(conn: &Connection, display_name: &str) -> Result<Duration> {
    let started = Instant::now();
    let (mut send, mut recv) = conn.open_bi().await?;
    send.write_all(&[STREAM_HELLO]).await?;
    let msg = serde_json::to_vec(&Hello { display_name: display_name.to_string() })?;
    send.write_all(&(msg.len() as u32).to_le_bytes()).await?;
    send.write_all(&msg).await?;
    send.finish()?;

    let mut ack = [0u8; 1];
    recv.read_exact(&mut ack).await?;
    if ack[0] != HELLO_ACK {
        anyhow::bail!("unexpected hello ack {:#04x}", ack[0]);
    }
    Ok(started.elapsed())
}

async fn send_ping(conn: &Connection) -> Result<Duration> {
    let started = Instant::now();
    let (mut send, mut recv) = conn.open_bi().await?;
    let nonce: u8 = rand::random();
    send.write_all(&[STREAM_PING, nonce]).await?;
    send.finish()?;
    let mut echo = [0u8; 1];
    recv.read_exact(&mut echo).await?;
    if echo[0] != nonce {
        anyhow::bail!("ping echo mismatch");
    }
    Ok(started.elapsed())
}

async fn send_leaving(conn: &Connection) -> Result<()> {
    let (mut send, _recv) = conn.open_bi().await?;
    send.write_all(&[STREAM_LEAVING]).await?;
    send.finish()?;
    Ok(())
}

// --- Liveness ---

/// Ping every link on a fixed interval. Links whose connection died are
/// redialled by identity (discovery resolves the address) and re-announced
/// under their stored name.
async fn heartbeat_loop(handle: IrohHandle, interval: Duration, ping_timeout: Duration) {
    let mut shutdown = handle.shutdown.subscribe();
    'sweep: loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped(&mut shutdown) => break,
        }
        if handle.endpoint.is_closed() {
            break;
        }

        let targets: Vec<(EndpointId, Connection, String)> = handle
            .links
            .lock()
            .await
            .iter()
            .map(|(id, link)| (*id, link.conn.clone(), link.record.display_name.clone()))
            .collect();
        if targets.is_empty() {
            continue;
        }
        tracing::debug!("Heartbeat: pinging {} peer(s)", targets.len());

        for (peer_id, conn, name) in targets {
            if *shutdown.borrow() {
                break 'sweep;
            }
            let probe = async {
                if conn.close_reason().is_none() {
                    return send_ping(&conn).await.map(|rtt| (None, rtt));
                }
                let fresh = handle.endpoint.connect(EndpointAddr::from(peer_id), ALPN).await?;
                let rtt = send_hello(&fresh, &name).await?;
                Ok::<_, anyhow::Error>((Some(fresh), rtt))
            };
            let result = tokio::select! {
                r = tokio::time::timeout(ping_timeout, probe) => r,
                _ = stopped(&mut shutdown) => break 'sweep,
            };

            let mut links = handle.links.lock().await;
            let Some(link) = links.get_mut(&peer_id) else {
                continue;
            };
            match result {
                Ok(Ok((fresh, rtt))) => {
                    link.record.online = true;
                    link.record.round_trip_ms = Some(rtt.as_secs_f64() * 1000.0);
                    link.record.last_seen = Some(now_ms());
                    if let Some(fresh) = fresh {
                        tracing::info!("Heartbeat: reconnected to {}", peer_id.fmt_short());
                        link.conn = fresh.clone();
                        let handle = handle.clone();
                        tokio::spawn(async move { dispatch_streams(handle, fresh, peer_id).await });
                    }
                }
                _ => {
                    link.record.online = false;
                    tracing::debug!("Heartbeat: peer {} unreachable", peer_id.fmt_short());
                }
            }
        }

        handle.publish().await;
    }
    tracing::debug!("Heartbeat loop finished");
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Load a hex secret key from `path`, or create one there.
async fn load_or_create_key(path: &Path) -> Result<SecretKey> {
    if path.exists() {
        let hex = tokio::fs::read_to_string(path).await?;
        let bytes = hex::decode(hex.trim())?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key length in {}", path.display()))?;
        let key = SecretKey::from_bytes(&bytes);
        tracing::info!("Loaded key from {}", path.display());
        return Ok(key);
    }

    let key = SecretKey::generate(&mut rand::rng());
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, hex::encode(key.to_bytes())).await?;
    tracing::info!("Generated new key, saved to {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_file_is_created_then_reused() {
        let dir = std::env::temp_dir().join(format!("peer-session-key-{}", rand::random::<u64>()));
        let path = dir.join("nested").join("key");

        let created = load_or_create_key(&path).await.unwrap();
        assert!(path.exists());
        let loaded = load_or_create_key(&path).await.unwrap();
        assert_eq!(created.public(), loaded.public());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn bad_key_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("peer-session-key-{}", rand::random::<u64>()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("key");
        tokio::fs::write(&path, "abcd").await.unwrap();

        assert!(load_or_create_key(&path).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn keep_alive_fits_inside_idle_timeout() {
        assert!(KEEP_ALIVE_INTERVAL < IDLE_TIMEOUT);
        assert!(quic_transport_config().is_ok());
    }

    #[tokio::test]
    async fn shutdown_raised_mid_sweep_is_still_seen() {
        let (tx, _) = watch::channel(false);
        let mut rx = tx.subscribe();
        // Raised while nobody is waiting on it.
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .expect("shutdown signal was lost");
        // A late subscriber sees it too.
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut tx.subscribe()))
            .await
            .expect("shutdown signal was lost");
    }

    #[test]
    fn hello_wire_shape() {
        let json = serde_json::to_string(&Hello { display_name: "bob".into() }).unwrap();
        assert_eq!(json, r#"{"display_name":"bob"}"#);
    }
}
