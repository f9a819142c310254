//! Session-level error taxonomy

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::{DecodeError, EncodeError, TftpErrorCode};

/// Why a transfer (or one exchange within it) ended unsuccessfully
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] DecodeError),

    #[error("cannot encode packet: {0}")]
    Encode(#[from] EncodeError),

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no reply from {peer} after {attempts} attempts")]
    TimeoutExceeded { peer: SocketAddr, attempts: usize },

    #[error("peer reported error {code}: {message}")]
    PeerError { code: u16, message: String },

    #[error("file needs more than 65535 blocks and bigfile was not negotiated")]
    FileTooLarge,

    #[error("unsupported transfer mode '{0}'")]
    UnsupportedMode(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// The error packet to send the peer when this failure is detected
    /// locally, if the peer should be told at all
    pub fn notice(&self) -> Option<(TftpErrorCode, String)> {
        match self {
            Self::Malformed(_) | Self::ProtocolViolation(_) => {
                Some((TftpErrorCode::IllegalOperation, self.to_string()))
            }
            Self::UnsupportedMode(mode) => Some((
                TftpErrorCode::IllegalOperation,
                format!("Transfer mode '{}' not supported", mode),
            )),
            Self::ResourceNotFound(_) => Some((TftpErrorCode::FileNotFound, "resource not found".to_string())),
            Self::FileTooLarge => Some((TftpErrorCode::DiskFull, "File too large".to_string())),
            Self::Io(_) | Self::Encode(_) => Some((TftpErrorCode::NotDefined, self.to_string())),
            Self::TimeoutExceeded { .. } | Self::PeerError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_codes() {
        let (code, _) = TransferError::FileTooLarge.notice().unwrap();
        assert_eq!(code, TftpErrorCode::DiskFull);

        let (code, message) = TransferError::ResourceNotFound("x".into()).notice().unwrap();
        assert_eq!(code, TftpErrorCode::FileNotFound);
        assert_eq!(message, "resource not found");

        let (code, _) = TransferError::ProtocolViolation("dup".into()).notice().unwrap();
        assert_eq!(code, TftpErrorCode::IllegalOperation);
    }

    #[test]
    fn test_no_notice_for_timeouts_or_peer_errors() {
        let timeout = TransferError::TimeoutExceeded {
            peer: "127.0.0.1:69".parse().unwrap(),
            attempts: 3,
        };
        assert!(timeout.notice().is_none());

        let peer = TransferError::PeerError {
            code: 1,
            message: "nope".into(),
        };
        assert!(peer.notice().is_none());
    }
}
