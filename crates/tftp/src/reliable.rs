//! Reliable send: one packet out, one matching reply back
//!
//! Every lock-step exchange of a transfer goes through [`send_and_await`].
//! A silent peer is retried a bounded number of times. A peer that answers
//! with the wrong packet is not retried: a wrong opcode or block number ends
//! the exchange at once.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::timeout;

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::protocol::Packet;

/// Seconds to wait for each reply before retransmitting
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Transmissions of one packet before giving up
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Per-exchange timeout and retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Send `outgoing` to `to` and wait for a reply accepted by `expected`
///
/// The reply may come from a different port than `to` if the endpoint has
/// no fixed peer yet (a client talking to a server's control port); its
/// source becomes the endpoint's peer.
///
/// Outcomes:
/// - a reply satisfying `expected` is returned;
/// - an `Error` packet becomes [`TransferError::PeerError`];
/// - any other reply, or undecodable bytes, fail immediately;
/// - silence for `policy.timeout` retransmits the same packet, up to
///   `policy.max_attempts` transmissions in total, then
///   [`TransferError::TimeoutExceeded`].
pub async fn send_and_await<F>(
    endpoint: &mut Endpoint,
    outgoing: &Packet,
    to: SocketAddr,
    policy: &RetryPolicy,
    expected: F,
) -> Result<Packet, TransferError>
where
    F: Fn(&Packet) -> bool,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        endpoint.send(outgoing, to).await?;

        let bytes = match timeout(policy.timeout, endpoint.recv_from_peer()).await {
            Ok(received) => received?,
            Err(_) => {
                tracing::debug!(
                    "No reply to {} from {} (attempt {}/{})",
                    outgoing,
                    to,
                    attempt,
                    attempts
                );
                continue;
            }
        };

        return match Packet::decode(&bytes)? {
            Packet::Error { code, message } => Err(TransferError::PeerError { code, message }),
            reply if expected(&reply) => Ok(reply),
            reply => Err(TransferError::ProtocolViolation(format!(
                "unexpected {} in reply to {}",
                reply, outgoing
            ))),
        };
    }

    Err(TransferError::TimeoutExceeded {
        peer: endpoint.peer().unwrap_or(to),
        attempts,
    })
}

/// Matcher for an acknowledgment of `block`
pub fn ack_of(block: u16) -> impl Fn(&Packet) -> bool {
    move |p| matches!(p, Packet::Acknowledge { block: b } if *b == block)
}

/// Matcher for the data packet numbered `block`
pub fn data_block(block: u16) -> impl Fn(&Packet) -> bool {
    move |p| matches!(p, Packet::Data { block: b, .. } if *b == block)
}
