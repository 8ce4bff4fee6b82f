//! # Semtech UDP Framing
//!
//! Datagram layer of the gateway <-> server protocol: the 12-byte request
//! header, acknowledgement validation and downstream datagram
//! classification. Bodies are JSON; the upstream body is assembled by
//! [`rxpk`], the downstream body decoded by [`txpk`].
//!
//! Replies are accepted only when protocol version, packet type and token
//! all match the outstanding request; everything else is silently dropped.

pub mod rxpk;
pub mod txpk;

use std::fmt;

use crate::constants::{PKT_PULL_ACK, PKT_PULL_RESP, PROTOCOL_VERSION};

/// 64-bit gateway MAC, sent in network byte order in every request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayId(u64);

impl GatewayId {
    pub fn new(mac: u64) -> Self {
        GatewayId(mac)
    }

    pub fn mac_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.mac_bytes()))
    }
}

/// Fresh 16-bit acknowledgement token.
pub fn new_token() -> u16 {
    rand::random()
}

/// Builds the fixed 12-byte header of a gateway-originated datagram.
pub fn request_header(pkt_type: u8, token: u16, gateway: GatewayId) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = PROTOCOL_VERSION;
    buf[1..3].copy_from_slice(&token.to_be_bytes());
    buf[3] = pkt_type;
    buf[4..12].copy_from_slice(&gateway.mac_bytes());
    buf
}

/// Verdict on a received acknowledgement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Well-formed and answering the outstanding request.
    Match,
    /// Well-formed but answering some other request.
    TokenMismatch,
    /// Too short, wrong version or wrong type.
    Invalid,
}

/// Validates an acknowledgement against the outstanding request token.
pub fn check_ack(buf: &[u8], expected_type: u8, token: u16) -> AckOutcome {
    if buf.len() < 4 || buf[0] != PROTOCOL_VERSION || buf[3] != expected_type {
        return AckOutcome::Invalid;
    }
    if buf[1..3] != token.to_be_bytes() {
        return AckOutcome::TokenMismatch;
    }
    AckOutcome::Match
}

/// A datagram received on the downstream socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Downstream<'a> {
    PullAck { token: u16 },
    PullResp { body: &'a [u8] },
}

/// Classifies a downstream datagram; anything not respecting the protocol is
/// dropped by returning `None`.
pub fn classify_downstream(buf: &[u8]) -> Option<Downstream<'_>> {
    if buf.len() < 4 || buf[0] != PROTOCOL_VERSION {
        return None;
    }
    match buf[3] {
        PKT_PULL_ACK => Some(Downstream::PullAck {
            token: u16::from_be_bytes([buf[1], buf[2]]),
        }),
        PKT_PULL_RESP => Some(Downstream::PullResp { body: &buf[4..] }),
        _ => None,
    }
}
