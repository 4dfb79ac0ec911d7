//! peer-session: serverless peer sessions bootstrapped by shareable tickets.
//!
//! One local endpoint per logged-in user. Peers are reached by pasting a
//! ticket generated on the other side; the roster of known peers is kept in
//! sync with the transport's push feed.
//!
//! ```no_run
//! use peer_session::{PeerSession, SessionConfig, TransportConfig};
//! use peer_session::transport::quic::IrohTransport;
//!
//! # tokio_test::block_on(async {
//! let session = PeerSession::new(IrohTransport::new(TransportConfig::default()), SessionConfig::default());
//! session.user_logged_in("alice").await?;
//! println!("Share this: {}", session.generate_ticket().await?);
//! # Ok::<(), peer_session::SessionError>(())
//! # });
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod roster;
pub mod session;
pub mod ticket;
pub mod transport;

pub use config::{SessionConfig, TransportConfig};
pub use endpoint::{EndpointManager, SessionState};
pub use error::{SessionError, TicketError, TransportError};
pub use roster::{PeerRecord, Roster};
pub use session::PeerSession;
pub use ticket::{ReachabilityHints, Ticket};
pub use transport::Transport;
