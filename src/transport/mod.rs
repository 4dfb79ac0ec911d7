//! What the session core needs from the secure transport underneath it.
//!
//! Two implementations: [`quic::IrohTransport`] over real QUIC, and
//! [`memory::MemoryTransport`], an in-process network used by tests and the
//! binary's `--simulate` mode.

pub mod memory;
pub mod quic;

use crate::error::TransportError;
use crate::roster::PeerRecord;
use crate::ticket::ReachabilityHints;
use iroh::{EndpointAddr, EndpointId};
use std::time::Duration;
use tokio::sync::watch;

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A live local endpoint. Cloning must share the same endpoint.
    type Handle: Clone + Send + Sync + 'static;
    /// An established session with one remote peer.
    type Session: Send + Sync + 'static;

    async fn bind(&self) -> Result<(EndpointId, Self::Handle), TransportError>;

    /// Release the endpoint. Closes the push channel handed out by [`Transport::subscribe`].
    async fn unbind(&self, handle: Self::Handle) -> Result<(), TransportError>;

    fn local_reachability_hints(&self, handle: &Self::Handle) -> ReachabilityHints;

    /// Open a session to `addr`, announcing `display_name` to the remote side.
    /// Must give up with [`TransportError::Timeout`] once `timeout` elapses.
    async fn open_session(
        &self,
        handle: &Self::Handle,
        addr: EndpointAddr,
        display_name: &str,
        timeout: Duration,
    ) -> Result<Self::Session, TransportError>;

    /// A session for an existing link, typically one the remote side opened.
    async fn session_to(&self, handle: &Self::Handle, peer: EndpointId) -> Option<Self::Session>;

    async fn close_session(&self, handle: &Self::Handle, session: Self::Session) -> Result<(), TransportError>;

    /// Push feed of full roster snapshots for this endpoint. The receiver always
    /// holds the latest snapshot; it closes when the endpoint is unbound.
    fn subscribe(&self, handle: &Self::Handle) -> watch::Receiver<Vec<PeerRecord>>;
}
