//! Typed failures surfaced by the session core.

use iroh::EndpointId;
use std::time::Duration;

/// Why a ticket string could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("missing '{0}' prefix")]
    MissingPrefix(&'static str),
    /// Bad encoding, truncation, checksum mismatch or an undecodable address.
    #[error("{0}")]
    Invalid(String),
}

impl From<iroh_tickets::ParseError> for TicketError {
    fn from(err: iroh_tickets::ParseError) -> Self {
        TicketError::Invalid(err.to_string())
    }
}

/// Failures reported by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind endpoint: {0}")]
    Bind(String),
    #[error("peer {} unreachable: {reason}", .peer.fmt_short())]
    Unreachable { peer: EndpointId, reason: String },
    #[error("timed out after {:?} connecting to {}", .after, .peer.fmt_short())]
    Timeout { peer: EndpointId, after: Duration },
    #[error("teardown failed: {0}")]
    Teardown(String),
}

/// Errors returned by the session orchestrator and the endpoint manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("cannot start endpoint: {0}")]
    Bind(String),
    #[error("malformed ticket: {0}")]
    MalformedTicket(#[from] TicketError),
    #[error("peer {} unreachable: {reason}", .peer.fmt_short())]
    Unreachable { peer: EndpointId, reason: String },
    #[error("timed out after {:?} connecting to {}", .after, .peer.fmt_short())]
    Timeout { peer: EndpointId, after: Duration },
    #[error("endpoint not running")]
    NotRunning,
    /// Returned by `disconnect` after the roster entry is gone. Endpoint
    /// shutdown only logs these.
    #[error("teardown failed: {0}")]
    Teardown(String),
}

impl SessionError {
    /// True for both flavours of failed session establishment.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SessionError::Unreachable { .. } | SessionError::Timeout { .. })
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Bind(msg) => SessionError::Bind(msg),
            TransportError::Unreachable { peer, reason } => SessionError::Unreachable { peer, reason },
            TransportError::Timeout { peer, after } => SessionError::Timeout { peer, after },
            TransportError::Teardown(msg) => SessionError::Teardown(msg),
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
