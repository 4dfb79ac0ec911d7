//! Owns the single local endpoint of the process.
//!
//! `start` is idempotent: the bind runs under the same lock that guards the
//! slot, so concurrent callers serialize and all observe one identity. `stop`
//! takes the endpoint out of the slot at once and releases it on a background
//! task; teardown problems are only logged.

use crate::error::{Result, SessionError, TransportError};
use crate::transport::Transport;
use iroh::EndpointId;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle of the local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    /// No local endpoint.
    Idle,
    /// Bind in progress.
    Starting,
    /// Endpoint live with this identity.
    Running(EndpointId),
    /// Last bind attempt failed. Behaves like `Idle` but keeps the error for display.
    Failed(String),
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running(_))
    }

    pub fn identity(&self) -> Option<EndpointId> {
        match self {
            SessionState::Running(id) => Some(*id),
            _ => None,
        }
    }
}

struct Active<H> {
    identity: EndpointId,
    handle: H,
}

pub struct EndpointManager<T: Transport> {
    transport: Arc<T>,
    active: Mutex<Option<Active<T::Handle>>>,
    state_tx: watch::Sender<SessionState>,
}

impl<T: Transport> EndpointManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            transport,
            active: Mutex::new(None),
            state_tx,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Bind the endpoint if it is not already running and return its identity.
    pub async fn start(&self) -> Result<EndpointId> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            tracing::debug!("Endpoint already running: {}", existing.identity.fmt_short());
            return Ok(existing.identity);
        }

        self.state_tx.send_replace(SessionState::Starting);
        tracing::info!("Starting endpoint...");
        match self.transport.bind().await {
            Ok((identity, handle)) => {
                *active = Some(Active { identity, handle });
                self.state_tx.send_replace(SessionState::Running(identity));
                tracing::info!("Endpoint online, id={}", identity);
                Ok(identity)
            }
            Err(e) => {
                tracing::warn!("Endpoint failed to start: {e}");
                self.state_tx.send_replace(SessionState::Failed(e.to_string()));
                Err(SessionError::from(e))
            }
        }
    }

    /// Release the endpoint without waiting for the transport. The state is
    /// `Idle` on return and a following `start` binds a fresh endpoint right
    /// away. Safe to call when nothing is running. The returned task finishes
    /// once the old endpoint is gone.
    pub async fn stop(&self) -> Option<JoinHandle<()>> {
        let Some(endpoint) = self.detach().await else {
            self.state_tx.send_if_modified(|state| {
                if matches!(state, SessionState::Failed(_)) {
                    *state = SessionState::Idle;
                    true
                } else {
                    false
                }
            });
            return None;
        };
        Some(tokio::spawn(async move {
            let identity = endpoint.identity();
            if let Err(e) = endpoint.release().await {
                tracing::warn!("Endpoint {} did not shut down cleanly: {e}", identity.fmt_short());
            }
        }))
    }

    /// Take the live endpoint out of the manager, leaving it `Idle`. The caller
    /// owns the release, so it can run in the background without touching
    /// whatever endpoint is started next.
    pub async fn detach(&self) -> Option<DetachedEndpoint<T>> {
        let taken = self.active.lock().await.take();
        let active = taken?;
        self.state_tx.send_replace(SessionState::Idle);
        Some(DetachedEndpoint {
            identity: active.identity,
            handle: active.handle,
            transport: self.transport.clone(),
        })
    }

    pub fn current_identity(&self) -> Option<EndpointId> {
        self.state_tx.borrow().identity()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Identity and a clone of the live handle, if running.
    pub async fn handle(&self) -> Option<(EndpointId, T::Handle)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| (a.identity, a.handle.clone()))
    }
}

/// An endpoint that has left the manager and still needs releasing.
pub struct DetachedEndpoint<T: Transport> {
    identity: EndpointId,
    handle: T::Handle,
    transport: Arc<T>,
}

impl<T: Transport> DetachedEndpoint<T> {
    pub fn identity(&self) -> EndpointId {
        self.identity
    }

    pub async fn release(self) -> std::result::Result<(), TransportError> {
        tracing::info!("Shutting down endpoint {}...", self.identity.fmt_short());
        self.transport.unbind(self.handle).await?;
        tracing::info!("Endpoint {} stopped", self.identity.fmt_short());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use std::time::Duration;

    fn manager(net: &MemoryNetwork) -> EndpointManager<crate::transport::memory::MemoryTransport> {
        EndpointManager::new(Arc::new(net.transport()))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        assert_eq!(mgr.current_identity(), None);

        let first = mgr.start().await.unwrap();
        let second = mgr.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(net.bind_count(), 1);
        assert_eq!(mgr.state(), SessionState::Running(first));
        assert_eq!(mgr.current_identity(), Some(first));
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_endpoint() {
        let net = MemoryNetwork::new();
        let mgr = Arc::new(manager(&net));
        let (a, b) = tokio::join!(mgr.start(), mgr.start());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(net.bind_count(), 1);
        assert_eq!(net.bound_count(), 1);
    }

    #[tokio::test]
    async fn stop_twice_ends_idle() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        let id = mgr.start().await.unwrap();
        let release = mgr.stop().await.unwrap();
        assert_eq!(mgr.state(), SessionState::Idle);
        release.await.unwrap();
        assert!(!net.is_bound(&id));
        assert!(mgr.stop().await.is_none());
        assert_eq!(mgr.state(), SessionState::Idle);
        assert_eq!(mgr.current_identity(), None);
    }

    #[tokio::test]
    async fn bind_failure_is_reported_and_recoverable() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        net.fail_next_bind("network unavailable");

        let err = mgr.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Bind(_)));
        assert_eq!(mgr.state(), SessionState::Failed("failed to bind endpoint: network unavailable".into()));
        assert_eq!(mgr.current_identity(), None);
        assert!(mgr.handle().await.is_none());

        let id = mgr.start().await.unwrap();
        assert_eq!(mgr.state(), SessionState::Running(id));
    }

    #[tokio::test]
    async fn stop_clears_failure() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        net.fail_next_bind("denied");
        let _ = mgr.start().await;
        assert!(mgr.stop().await.is_none());
        assert_eq!(mgr.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn detach_hands_over_release() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        let old = mgr.start().await.unwrap();
        let detached = mgr.detach().await.unwrap();
        assert_eq!(detached.identity(), old);
        assert_eq!(mgr.state(), SessionState::Idle);

        // A new endpoint can start before the old one is released.
        let new = mgr.start().await.unwrap();
        assert_ne!(old, new);
        detached.release().await.unwrap();
        assert!(!net.is_bound(&old));
        assert!(net.is_bound(&new));
        assert_eq!(mgr.current_identity(), Some(new));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_wait_for_slow_unbind() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        let old = mgr.start().await.unwrap();
        net.set_unbind_latency(&old, Duration::from_secs(30));
        net.fail_unbind(&old, true);

        let (new, release) = tokio::time::timeout(Duration::from_secs(1), async {
            let release = mgr.stop().await;
            assert_eq!(mgr.state(), SessionState::Idle);
            (mgr.start().await.unwrap(), release)
        })
        .await
        .expect("stop blocked on the transport");
        assert_ne!(old, new);
        assert!(net.is_bound(&old));

        // The failure is logged, not surfaced.
        release.unwrap().await.unwrap();
        assert!(!net.is_bound(&old));
        assert_eq!(mgr.state(), SessionState::Running(new));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let net = MemoryNetwork::new();
        let mgr = manager(&net);
        let mut rx = mgr.subscribe();
        let id = mgr.start().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Running(id));
    }
}
