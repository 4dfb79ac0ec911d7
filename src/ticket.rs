//! Shareable connection tickets.
//!
//! A ticket is an iroh ticket of kind `peer`: the postcard encoded
//! [`EndpointAddr`] with a 4-byte blake3 checksum appended, written as
//! `peer{base32}`. Tickets are reusable and never expire; the addresses inside
//! may be stale, in which case the transport falls back to discovery.

use crate::error::TicketError;
use iroh::{EndpointAddr, EndpointId, TransportAddr};
use iroh_tickets::ParseError;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const TICKET_PREFIX: &str = "peer";
const CHECKSUM_LEN: usize = 4;

/// Addresses the local endpoint can currently be reached on (direct IPs, relays).
pub type ReachabilityHints = BTreeSet<TransportAddr>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    addr: EndpointAddr,
}

impl Ticket {
    pub fn new(addr: EndpointAddr) -> Self {
        Self { addr }
    }

    pub fn identity(&self) -> EndpointId {
        self.addr.id
    }

    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    pub fn into_addr(self) -> EndpointAddr {
        self.addr
    }
}

/// Build a ticket for `identity` reachable via `hints`.
pub fn encode(identity: EndpointId, hints: ReachabilityHints) -> Ticket {
    let mut addr = EndpointAddr::from(identity);
    addr.addrs.extend(hints);
    Ticket::new(addr)
}

/// Parse a ticket string. Pure: safe to call on unvalidated user input.
pub fn decode(input: &str) -> Result<Ticket, TicketError> {
    let input = input.trim();
    if !input.starts_with(TICKET_PREFIX) {
        return Err(TicketError::MissingPrefix(TICKET_PREFIX));
    }
    Ok(<Ticket as iroh_tickets::Ticket>::deserialize(input)?)
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    out
}

impl iroh_tickets::Ticket for Ticket {
    const KIND: &'static str = TICKET_PREFIX;

    fn to_bytes(&self) -> Vec<u8> {
        // Plain data: postcard cannot fail here, and an empty payload is rejected on decode.
        let mut bytes = postcard::to_stdvec(&self.addr).unwrap_or_default();
        let sum = checksum(&bytes);
        bytes.extend_from_slice(&sum);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() <= CHECKSUM_LEN {
            return Err(ParseError::verification_failed("ticket truncated"));
        }
        let (payload, sum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if checksum(payload) != sum {
            return Err(ParseError::verification_failed("checksum mismatch"));
        }
        let addr: EndpointAddr = postcard::from_bytes(payload)?;
        Ok(Ticket::new(addr))
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&iroh_tickets::Ticket::serialize(self))
    }
}

impl FromStr for Ticket {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}
