//! TFTP protocol engine
//!
//! A lock-step file transfer protocol over UDP in the style of RFC 1350,
//! with the `bigfile` option that lets the 16-bit block counter wrap.
//!
//! # Layers
//!
//! - [`protocol`]: packet codec, pure and synchronous
//! - [`endpoint`]: one UDP socket, optionally fixed to one peer
//! - [`reliable`]: send one packet, await one matching reply, retransmit on silence
//! - [`transfer`]: the sender and receiver flows of a whole transfer
//! - [`negotiation`]: the `OACK` handshake in front of a transfer
//! - [`server`] / [`client`]: the two ends, built from the layers above
//!
//! The server serializes transfers of the same file through [`locks`] and
//! only serves names found in its [`registry`].

pub mod client;
pub mod endpoint;
pub mod error;
pub mod locks;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod reliable;
pub mod server;
pub mod transfer;

pub use client::TftpClient;
pub use endpoint::Endpoint;
pub use error::TransferError;
pub use locks::{ResourceGuard, ResourceLocks};
pub use negotiation::{BIGFILE_OPTION, TransferOptions};
pub use protocol::{
    BLOCK_SIZE, DecodeError, EncodeError, MAX_PACKET_SIZE, Packet, Request, TftpErrorCode, TftpOpcode, TransferMode,
};
pub use registry::{DEFAULT_MAX_RESOURCES, FileRegistry};
pub use reliable::{RetryPolicy, send_and_await};
pub use server::{TftpServer, TftpServerConfig, run_tftp_server};
pub use transfer::{BlockCounter, FirstBlock, Role, SessionState, TransferConfig, TransferSession, TransferStats};
