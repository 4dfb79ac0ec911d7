//! Peer session orchestration.
//!
//! [`PeerSession`] is the single writer of session state. User actions and
//! login/logout transitions are serialized through one lock; the push
//! listener runs beside them and only ever replaces the roster with the
//! transport's latest snapshot.

use crate::config::SessionConfig;
use crate::endpoint::{EndpointManager, SessionState};
use crate::error::{Result, SessionError};
use crate::roster::{PeerRecord, Roster};
use crate::ticket::{self, Ticket};
use crate::transport::Transport;
use iroh::EndpointId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct PeerSession<T: Transport> {
    config: SessionConfig,
    endpoint: EndpointManager<T>,
    roster: Arc<Roster>,
    control: Mutex<Control<T::Session>>,
}

struct Control<S> {
    user: Option<String>,
    sessions: HashMap<EndpointId, S>,
    listener: Option<JoinHandle<()>>,
}

impl<T: Transport> PeerSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            config,
            endpoint: EndpointManager::new(Arc::new(transport)),
            roster: Arc::new(Roster::new()),
            control: Mutex::new(Control {
                user: None,
                sessions: HashMap::new(),
                listener: None,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        self.endpoint.transport()
    }

    // --- Session boundaries ---

    /// A user logged in. Any endpoint left over from a different user is
    /// released in the background; then, if the settings allow it, a fresh
    /// endpoint is started. Returns the local identity when running.
    pub async fn user_logged_in(&self, user_id: &str) -> Result<Option<EndpointId>> {
        let mut control = self.control.lock().await;

        if control.user.as_deref() == Some(user_id) {
            if self.endpoint.state().is_running() || !self.config.auto_start() {
                tracing::debug!("Login for {user_id} already active");
                return Ok(self.endpoint.current_identity());
            }
        } else if let Some(previous) = control.user.take() {
            tracing::info!("Switching user {previous} → {user_id}");
            self.end_session(&mut control, previous).await;
        }

        control.user = Some(user_id.to_string());
        if !self.config.auto_start() {
            tracing::info!("Logged in as {user_id}; auto-start disabled by settings");
            return Ok(None);
        }
        self.start_locked(&mut control).await.map(Some)
    }

    pub async fn user_logged_out(&self) {
        let mut control = self.control.lock().await;
        let Some(user) = control.user.take() else {
            return;
        };
        tracing::info!("User {user} logged out");
        self.end_session(&mut control, user).await;
    }

    /// Bring the endpoint up for the logged-in user when login did not.
    pub async fn start_endpoint(&self) -> Result<EndpointId> {
        let mut control = self.control.lock().await;
        if control.user.is_none() {
            return Err(SessionError::NotRunning);
        }
        self.start_locked(&mut control).await
    }

    /// Tear everything down as on logout, then wait for the endpoint release
    /// outside the control lock so peers are told before the process exits.
    pub async fn shutdown(&self) {
        let release = {
            let mut control = self.control.lock().await;
            match control.user.take() {
                Some(user) => self.end_session(&mut control, user).await,
                // A failed start may have left the state at Failed with nobody logged in.
                None => self.endpoint.stop().await,
            }
        };
        if let Some(task) = release {
            let _ = task.await;
        }
    }

    // --- User actions ---

    pub async fn generate_ticket(&self) -> Result<Ticket> {
        let (identity, handle) = self.endpoint.handle().await.ok_or(SessionError::NotRunning)?;
        let hints = self.transport().local_reachability_hints(&handle);
        let ticket = ticket::encode(identity, hints);
        tracing::info!(
            "Generated ticket for {} ({} address hint(s))",
            identity.fmt_short(),
            ticket.addr().addrs.len()
        );
        Ok(ticket)
    }

    /// Connect to the peer behind `ticket_str` and label it `display_name`.
    /// The roster is only touched once the transport reports success.
    pub async fn connect(&self, ticket_str: &str, display_name: &str) -> Result<PeerRecord> {
        let ticket = ticket::decode(ticket_str)?;
        let peer = ticket.identity();

        let mut control = self.control.lock().await;
        let (_, handle) = self.endpoint.handle().await.ok_or(SessionError::NotRunning)?;

        tracing::info!("Connecting to peer {}...", peer.fmt_short());
        let started = Instant::now();
        let session = match self
            .transport()
            .open_session(&handle, ticket.into_addr(), display_name, self.config.connect_timeout())
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {e}", peer.fmt_short());
                return Err(e.into());
            }
        };
        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

        control.sessions.insert(peer, session);
        let record = PeerRecord::connected(peer, display_name, Some(rtt_ms));
        self.roster.upsert(record.clone()).await;
        tracing::info!("Connected to {} as {display_name:?} (rtt={rtt_ms:.1}ms)", peer.fmt_short());
        Ok(record)
    }

    /// Drop `identity` from the roster, closing its session first. The roster
    /// entry goes away even when the transport reports a teardown failure; that
    /// failure is still returned.
    pub async fn disconnect(&self, identity: &EndpointId) -> Result<()> {
        let mut control = self.control.lock().await;
        let opened = control.sessions.remove(identity);

        let mut outcome = Ok(());
        match self.endpoint.handle().await {
            Some((_, handle)) => {
                let session = match opened {
                    Some(s) => Some(s),
                    None => self.transport().session_to(&handle, *identity).await,
                };
                match session {
                    Some(session) => {
                        if let Err(e) = self.transport().close_session(&handle, session).await {
                            tracing::warn!("Teardown of {} reported: {e}", identity.fmt_short());
                            outcome = Err(e.into());
                        }
                    }
                    None => tracing::debug!("No session to {}", identity.fmt_short()),
                }
            }
            None => outcome = Err(SessionError::NotRunning),
        }

        if self.roster.remove(identity).await {
            tracing::info!("Removed peer {}", identity.fmt_short());
        }
        outcome
    }

    /// Fold a full roster snapshot from the transport into the roster.
    pub async fn on_status_push(&self, records: Vec<PeerRecord>) {
        self.roster.apply_snapshot(records).await;
    }

    // --- Observers ---

    pub async fn get_roster(&self) -> Vec<PeerRecord> {
        self.roster.list().await
    }

    pub fn get_session_state(&self) -> SessionState {
        self.endpoint.state()
    }

    pub fn local_identity(&self) -> Option<EndpointId> {
        self.endpoint.current_identity()
    }

    pub async fn active_user(&self) -> Option<String> {
        self.control.lock().await.user.clone()
    }

    /// Fires after every roster change.
    pub fn subscribe_roster(&self) -> watch::Receiver<u64> {
        self.roster.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.endpoint.subscribe()
    }

    // --- Internals ---

    async fn start_locked(&self, control: &mut Control<T::Session>) -> Result<EndpointId> {
        let identity = self.endpoint.start().await?;
        let listener_alive = control.listener.as_ref().is_some_and(|l| !l.is_finished());
        if !listener_alive {
            if let Some((_, handle)) = self.endpoint.handle().await {
                let feed = self.transport().subscribe(&handle);
                control.listener = Some(spawn_listener(self.roster.clone(), feed, identity));
            }
        }
        Ok(identity)
    }

    /// Drop the user's peers and release their endpoint in the background.
    /// Never waits on the transport; the returned task finishes once the old
    /// endpoint is gone.
    async fn end_session(&self, control: &mut Control<T::Session>, user: String) -> Option<JoinHandle<()>> {
        // The listener must be gone before the roster is cleared, or a snapshot
        // in flight could repopulate it.
        if let Some(listener) = control.listener.take() {
            listener.abort();
            let _ = listener.await;
        }
        control.sessions.clear();
        self.roster.clear().await;

        let Some(detached) = self.endpoint.detach().await else {
            return self.endpoint.stop().await;
        };
        Some(tokio::spawn(async move {
            let identity = detached.identity();
            tracing::info!("Releasing endpoint of {user}");
            if let Err(e) = detached.release().await {
                tracing::warn!("Endpoint {} of {user} did not shut down cleanly: {e}", identity.fmt_short());
            }
        }))
    }
}

fn spawn_listener(
    roster: Arc<Roster>,
    mut feed: watch::Receiver<Vec<PeerRecord>>,
    identity: EndpointId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            roster.apply_latest(&mut feed).await;
            if feed.changed().await.is_err() {
                tracing::debug!("Status feed for {} closed", identity.fmt_short());
                break;
            }
        }
    })
}
