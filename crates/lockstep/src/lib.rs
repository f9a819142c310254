//! lockstep
//!
//! A TFTP server and client built on the [`tftp`] protocol engine.
//!
//! # Features
//!
//! - **Server**: RFC 1350 read and write requests in octet mode
//!   - Files registered once from a root directory
//!   - One data endpoint per transfer, concurrent across files
//!   - Transfers of the same file serialized, never refused
//!
//! - **Client**: get and put against any TFTP server
//!
//! - **bigfile option**: block numbers wrap from 65535 to 1, lifting the
//!   32 MiB limit of 512-byte blocks
//!

// Re-export the protocol crate for easier access
pub use tftp;
