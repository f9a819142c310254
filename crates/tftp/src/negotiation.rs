//! Option negotiation for the `bigfile` extension
//!
//! A request carrying the `bigfile` option asks for the block counter to
//! wrap from 65535 back to 1 instead of failing the transfer. The server
//! confirms with an OACK sent from its data endpoint, in place of its first
//! ordinary reply:
//!
//! ```text
//! read:   RRQ(bigfile)  ->      <- OACK      ACK #0 ->      <- DATA #1 ...
//! write:  WRQ(bigfile)  ->      <- OACK      DATA #1 ->     <- ACK #1  ...
//! ```
//!
//! A server that does not know the option answers as usual (DATA #1 or
//! ACK #0) and the transfer runs without wraparound.

use crate::error::TransferError;
use crate::protocol::{Packet, Request};
use crate::reliable::{ack_of, data_block};
use crate::transfer::{FirstBlock, SessionState, TransferSession};

/// Option key asking for block-number wraparound
pub const BIGFILE_OPTION: &str = "bigfile";

/// Options recognized in a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub bigfile: bool,
}

impl TransferOptions {
    /// Extract the recognized options; unknown keys are ignored
    ///
    /// # Examples
    /// ```
    /// use tftp::{Request, TransferOptions};
    ///
    /// let mut request = Request::new("disk.img");
    /// assert!(!TransferOptions::from_request(&request).bigfile);
    ///
    /// request.with_option("BigFile", "1");
    /// assert!(TransferOptions::from_request(&request).bigfile);
    /// ```
    pub fn from_request(request: &Request) -> Self {
        Self {
            bigfile: request.option(BIGFILE_OPTION).is_some(),
        }
    }

    /// Add these options to an outgoing request
    pub fn apply(&self, request: &mut Request) {
        if self.bigfile {
            request.with_option(BIGFILE_OPTION, "1");
        }
    }

    /// Whether the responder must open with an OACK
    pub fn requires_oack(&self) -> bool {
        self.bigfile
    }
}

/// Server side of a read request: after this returns, DATA #1 may be sent
///
/// With options present the OACK is sent (and retransmitted) until the
/// client answers with ACK #0.
pub async fn accept_read(session: &mut TransferSession, options: TransferOptions) -> Result<(), TransferError> {
    if options.requires_oack() {
        session.set_state(SessionState::AwaitPeerAck);
        session.exchange(&Packet::OptionAcknowledge, ack_of(0)).await?;
        session.enable_bigfile();
        tracing::debug!("bigfile negotiated for '{}' with {}", session.resource(), session.peer());
    }
    Ok(())
}

/// Server side of a write request: invite DATA #1 and wait for it
///
/// The invitation is an OACK when options were requested, ACK #0 otherwise.
pub async fn accept_write(session: &mut TransferSession, options: TransferOptions) -> Result<FirstBlock, TransferError> {
    let prompt = if options.requires_oack() {
        session.enable_bigfile();
        Packet::OptionAcknowledge
    } else {
        Packet::Acknowledge { block: 0 }
    };

    session.set_state(SessionState::AwaitData);
    match session.exchange(&prompt, data_block(1)).await? {
        Packet::Data { payload, .. } => Ok(FirstBlock::Received(payload)),
        other => Err(TransferError::ProtocolViolation(format!(
            "unexpected {} in reply to write acceptance",
            other
        ))),
    }
}

/// Client side of a read request
///
/// Sends the request and returns how the receiver flow obtains DATA #1:
/// either it already arrived, or (after an OACK) ACK #0 must prompt it.
pub async fn request_read(session: &mut TransferSession, request: Request) -> Result<FirstBlock, TransferError> {
    let requested = TransferOptions::from_request(&request);
    let first_data = data_block(1);

    session.set_state(SessionState::AwaitData);
    let reply = session
        .exchange(&Packet::ReadRequest(request), |p| {
            first_data(p) || (requested.requires_oack() && *p == Packet::OptionAcknowledge)
        })
        .await?;

    match reply {
        Packet::OptionAcknowledge => {
            session.enable_bigfile();
            Ok(FirstBlock::Prompt(Packet::Acknowledge { block: 0 }))
        }
        Packet::Data { payload, .. } => Ok(FirstBlock::Received(payload)),
        other => Err(TransferError::ProtocolViolation(format!(
            "unexpected {} in reply to read request",
            other
        ))),
    }
}

/// Client side of a write request: after this returns, DATA #1 may be sent
pub async fn request_write(session: &mut TransferSession, request: Request) -> Result<(), TransferError> {
    let requested = TransferOptions::from_request(&request);
    let first_ack = ack_of(0);

    session.set_state(SessionState::AwaitPeerAck);
    let reply = session
        .exchange(&Packet::WriteRequest(request), |p| {
            first_ack(p) || (requested.requires_oack() && *p == Packet::OptionAcknowledge)
        })
        .await?;

    if reply == Packet::OptionAcknowledge {
        session.enable_bigfile();
    }
    Ok(())
}
