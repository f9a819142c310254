//! TFTP File Transfer Logic
//!
//! This module drives one file transfer to completion over a data endpoint.
//! The same state machine runs on both ends: a server answering a read
//! request and a client performing a write are both a [`Role::Sender`]; the
//! other two cases are a [`Role::Receiver`].
//!
//! Blocks are exchanged in lock step: each DATA packet must be acknowledged
//! before the next one is read from the file. A payload shorter than 512
//! bytes ends the transfer, so a file whose length is a multiple of 512
//! ends with an empty DATA packet.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::protocol::{BLOCK_SIZE, Packet};
use crate::reliable::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS, RetryPolicy, ack_of, data_block, send_and_await,
};

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Time to wait for each reply before retransmitting
    pub timeout: Duration,
    /// Transmissions of one packet before the session gives up
    pub max_attempts: usize,
    /// Local address for data endpoints; unspecified means "any"
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            local_bind: None,
        }
    }
}

impl TransferConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout,
            max_attempts: self.max_attempts,
        }
    }
}

/// 16-bit block counter
///
/// Starts at 1. Past 65535 it either wraps to 1 (never 0) when the
/// `bigfile` extension is active, or refuses to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCounter {
    current: u16,
    wraps: bool,
}

impl BlockCounter {
    pub fn new(wraps: bool) -> Self {
        Self { current: 1, wraps }
    }

    pub fn current(&self) -> u16 {
        self.current
    }

    pub fn wraps(&self) -> bool {
        self.wraps
    }

    pub fn enable_wraparound(&mut self) {
        self.wraps = true;
    }

    /// Move to the next block number
    ///
    /// # Examples
    /// ```
    /// use tftp::BlockCounter;
    ///
    /// let mut counter = BlockCounter::starting_at(u16::MAX, true);
    /// assert_eq!(counter.advance().unwrap(), 1);
    ///
    /// let mut counter = BlockCounter::starting_at(u16::MAX, false);
    /// assert!(counter.advance().is_err());
    /// ```
    pub fn advance(&mut self) -> Result<u16, TransferError> {
        self.current = match self.current.checked_add(1) {
            Some(next) => next,
            None if self.wraps => 1,
            None => return Err(TransferError::FileTooLarge),
        };
        Ok(self.current)
    }

    /// Counter positioned at an arbitrary block
    pub fn starting_at(block: u16, wraps: bool) -> Self {
        Self { current: block, wraps }
    }
}

/// Which side of the data flow a session is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Reads the local file and sends DATA
    Sender,
    /// Receives DATA and writes the local file
    Receiver,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    AwaitPeerAck,
    AwaitData,
    Transferring,
    Done,
    Failed,
}

/// Totals of a finished transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// DATA packets exchanged, including a final empty one
    pub blocks: u64,
    /// Payload bytes exchanged
    pub bytes: u64,
}

impl TransferStats {
    fn record(&mut self, payload_len: usize) {
        self.blocks += 1;
        self.bytes += payload_len as u64;
    }
}

/// How a receiver obtains DATA #1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstBlock {
    /// Send this packet (ACK #0, OACK or a read request) and wait for DATA #1
    Prompt(Packet),
    /// DATA #1 already arrived; this is its payload
    Received(Vec<u8>),
}

/// One in-progress transfer over its own data endpoint
#[derive(Debug)]
pub struct TransferSession {
    role: Role,
    resource: String,
    endpoint: Endpoint,
    peer: SocketAddr,
    counter: BlockCounter,
    policy: RetryPolicy,
    state: SessionState,
    stats: TransferStats,
}

impl TransferSession {
    /// Create a session talking to `peer` over `endpoint`
    ///
    /// For a client, `peer` is the server's control address; it is replaced
    /// by the server's data endpoint address as soon as the first reply
    /// arrives.
    pub fn new(
        role: Role,
        resource: impl Into<String>,
        endpoint: Endpoint,
        peer: SocketAddr,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            role,
            resource: resource.into(),
            endpoint,
            peer,
            counter: BlockCounter::new(false),
            policy,
            state: SessionState::Start,
            stats: TransferStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn bigfile(&self) -> bool {
        self.counter.wraps()
    }

    /// Let the block counter wrap from 65535 to 1
    pub fn enable_bigfile(&mut self) {
        self.counter.enable_wraparound();
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session '{}' with {}: {:?} -> {:?}", self.resource, self.peer, self.state, state);
            self.state = state;
        }
    }

    /// One lock-step exchange with the peer
    pub(crate) async fn exchange<F>(&mut self, outgoing: &Packet, expected: F) -> Result<Packet, TransferError>
    where
        F: Fn(&Packet) -> bool,
    {
        let reply = send_and_await(&mut self.endpoint, outgoing, self.peer, &self.policy, expected).await?;
        if let Some(peer) = self.endpoint.peer() {
            self.peer = peer;
        }
        Ok(reply)
    }

    /// Send the whole of `reader` as DATA blocks starting at block 1
    ///
    /// Any opening handshake must already be done: the peer is expected to
    /// be waiting for DATA #1.
    pub async fn run_sender<R>(&mut self, mut reader: R) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.set_state(SessionState::Transferring);

        loop {
            let block = self.counter.current();
            let mut payload = Vec::with_capacity(BLOCK_SIZE);
            (&mut reader).take(BLOCK_SIZE as u64).read_to_end(&mut payload).await?;

            let len = payload.len();
            self.exchange(&Packet::Data { block, payload }, ack_of(block)).await?;
            self.stats.record(len);
            tracing::trace!("Block {} of '{}' acknowledged ({} bytes)", block, self.resource, len);

            if len < BLOCK_SIZE {
                return Ok(self.stats);
            }
            self.counter.advance()?;
        }
    }

    /// Receive DATA blocks into `writer` until a short block arrives
    ///
    /// Every block must carry exactly the next expected number; a duplicate
    /// or out-of-order block ends the session before anything is written.
    pub async fn run_receiver<W>(&mut self, mut writer: W, first: FirstBlock) -> Result<TransferStats, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut payload = match first {
            FirstBlock::Prompt(prompt) => {
                self.set_state(SessionState::AwaitData);
                let reply = self.exchange(&prompt, data_block(self.counter.current())).await?;
                into_payload(reply)?
            }
            FirstBlock::Received(payload) => payload,
        };
        self.set_state(SessionState::Transferring);

        loop {
            let block = self.counter.current();
            writer.write_all(&payload).await?;
            self.stats.record(payload.len());
            let ack = Packet::Acknowledge { block };

            if payload.len() < BLOCK_SIZE {
                writer.flush().await?;
                self.endpoint.send(&ack, self.peer).await?;
                return Ok(self.stats);
            }

            let next = self.counter.advance()?;
            payload = into_payload(self.exchange(&ack, data_block(next)).await?)?;
        }
    }

    /// Close out the session with the outcome of its flow
    ///
    /// On failure the peer is told why (where the protocol has a way to say
    /// it) and the state becomes [`SessionState::Failed`].
    pub async fn conclude<T>(&mut self, result: Result<T, TransferError>) -> Result<T, TransferError> {
        match &result {
            Ok(_) => {
                self.set_state(SessionState::Done);
                tracing::debug!(
                    "Session '{}' with {} done: {} blocks, {} bytes",
                    self.resource,
                    self.peer,
                    self.stats.blocks,
                    self.stats.bytes
                );
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                if let Some((code, message)) = e.notice() {
                    self.endpoint.send_error(code, &message, self.peer).await;
                }
            }
        }
        result
    }
}

fn into_payload(packet: Packet) -> Result<Vec<u8>, TransferError> {
    match packet {
        Packet::Data { payload, .. } => Ok(payload),
        other => Err(TransferError::ProtocolViolation(format!("expected DATA, got {}", other))),
    }
}
