//! TFTP Packet Codec
//!
//! This module contains the wire format of the protocol: opcodes, error
//! codes, transfer modes and the [`Packet`] type with its encoder and
//! decoder.
//!
//! # Wire Format
//!
//! Every packet starts with a 2-byte opcode in network byte order.
//!
//! | Packet | Layout |
//! |---|---|
//! | RRQ / WRQ | `opcode` `filename` 0 `mode` 0 \[`key` 0 `value` 0\]* |
//! | DATA | `opcode` `block#` `payload (0..=512)` |
//! | ACK | `opcode` `block#` |
//! | ERROR | `opcode` `code` `message` 0 |
//! | OACK | `opcode` |
//!
//! A DATA packet whose payload is shorter than [`BLOCK_SIZE`] ends the
//! transfer. No packet may exceed [`MAX_PACKET_SIZE`] bytes.
//!
//! Decoding never trusts the buffer: every length and every terminator is
//! checked before a field is read, and failures come back as a
//! [`DecodeError`] instead of a panic.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Payload bytes carried by a full DATA packet
pub const BLOCK_SIZE: usize = 512;

/// Opcode plus block number
pub const HEADER_LEN: usize = 4;

/// Largest datagram the protocol ever produces or accepts
pub const MAX_PACKET_SIZE: usize = HEADER_LEN + BLOCK_SIZE;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries one block of file content. A payload shorter than 512 bytes
    /// marks the end of the file.
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges one data block. Block 0 acknowledges a write request or
    /// an OACK.
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Confirms that the requested options (here: `bigfile`) are in effect.
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::OptionAck.name(), "OACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// The closed set of error codes defined by RFC 1350 and RFC 2347. Error
/// packets keep the raw `u16` so codes outside this set still decode; this
/// enum is what the local side sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see message
    NotDefined = 0,

    /// Error code 1: File not found
    ///
    /// Also used when the requested name is not in the server's registry.
    FileNotFound = 1,

    /// Error code 2: Access violation
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    ///
    /// Sent when a transfer would need more than 65535 blocks and the
    /// `bigfile` extension was not negotiated.
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Datagram received on a data endpoint from an address other than the
    /// session's peer.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,

    /// Error code 8: Option negotiation failed
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(3), Some(TftpErrorCode::DiskFull));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// Only binary (octet) transfers are carried out; netascii is recognized so
/// it can be refused with a precise error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, data is transferred as-is
    Octet,

    /// Text mode with CR-LF line endings
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string, case-insensitively
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!("OCTET".parse::<TransferMode>(), Ok(TransferMode::Octet));
    /// assert!("mail".parse::<TransferMode>().is_err());
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Check if transfers in this mode are carried out
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reasons a byte buffer is not a valid packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind} packet too short ({len} bytes)")]
    TooShort { kind: &'static str, len: usize },

    #[error("packet of {0} bytes exceeds the 516-byte limit")]
    TooLarge(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("{0} is not null-terminated")]
    Unterminated(&'static str),

    #[error("{0} is not valid text")]
    InvalidText(&'static str),

    #[error("option list has a key without a value")]
    OddOptions,
}

/// Reasons a packet cannot be put on the wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("data payload of {0} bytes exceeds the 512-byte block size")]
    PayloadTooLarge(usize),

    #[error("encoded packet of {0} bytes exceeds the 516-byte limit")]
    TooLarge(usize),

    #[error("{0} contains a null byte")]
    EmbeddedNul(&'static str),
}

/// Body of a read or write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested resource name
    pub filename: String,
    /// Transfer mode string as sent by the peer
    pub mode: String,
    /// Option pairs in wire order
    pub options: Vec<(String, String)>,
}

impl Request {
    /// Create an octet-mode request without options
    ///
    /// # Examples
    /// ```
    /// use tftp::Request;
    ///
    /// let mut request = Request::new("boot.img");
    /// request.with_option("bigfile", "1");
    /// assert_eq!(request.mode, "octet");
    /// assert_eq!(request.option("BIGFILE"), Some("1"));
    /// ```
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
            options: Vec::new(),
        }
    }

    /// Append an option pair
    pub fn with_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Look up an option value by key, case-insensitively
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the mode string
    pub fn transfer_mode(&self) -> Option<TransferMode> {
        TransferMode::from_str_opt(&self.mode)
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, payload: Vec<u8> },
    Acknowledge { block: u16 },
    Error { code: u16, message: String },
    OptionAcknowledge,
}

impl Packet {
    /// Build an error packet from a local error code
    pub fn error(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    /// The opcode this packet is sent with
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::ReadRequest(_) => TftpOpcode::ReadRequest,
            Self::WriteRequest(_) => TftpOpcode::WriteRequest,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Acknowledge { .. } => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
            Self::OptionAcknowledge => TftpOpcode::OptionAck,
        }
    }

    /// Check whether this is a DATA packet that ends the transfer
    pub fn is_final_data(&self) -> bool {
        matches!(self, Self::Data { payload, .. } if payload.len() < BLOCK_SIZE)
    }

    /// Serialize the packet into its wire representation
    ///
    /// # Examples
    /// ```
    /// use tftp::Packet;
    ///
    /// let bytes = Packet::Acknowledge { block: 258 }.encode().unwrap();
    /// assert_eq!(bytes, [0, 4, 1, 2]);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut v = Vec::with_capacity(MAX_PACKET_SIZE);
        v.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::ReadRequest(request) | Self::WriteRequest(request) => {
                put_text(&mut v, &request.filename, "filename")?;
                put_text(&mut v, &request.mode, "mode")?;
                for (key, value) in &request.options {
                    put_text(&mut v, key, "option key")?;
                    put_text(&mut v, value, "option value")?;
                }
            }
            Self::Data { block, payload } => {
                if payload.len() > BLOCK_SIZE {
                    return Err(EncodeError::PayloadTooLarge(payload.len()));
                }
                v.extend_from_slice(&block.to_be_bytes());
                v.extend_from_slice(payload);
            }
            Self::Acknowledge { block } => {
                v.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                v.extend_from_slice(&code.to_be_bytes());
                put_text(&mut v, message, "error message")?;
            }
            Self::OptionAcknowledge => {}
        }

        if v.len() > MAX_PACKET_SIZE {
            return Err(EncodeError::TooLarge(v.len()));
        }
        Ok(v)
    }

    /// Parse a packet from a received datagram
    ///
    /// # Examples
    /// ```
    /// use tftp::{DecodeError, Packet};
    ///
    /// let packet = Packet::decode(&[0, 3, 0, 1, b'h', b'i']).unwrap();
    /// assert_eq!(packet, Packet::Data { block: 1, payload: b"hi".to_vec() });
    ///
    /// assert_eq!(Packet::decode(&[0, 9]), Err(DecodeError::UnknownOpcode(9)));
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort {
                kind: "any",
                len: buf.len(),
            });
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::TooLarge(buf.len()));
        }

        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = TftpOpcode::from_u16(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;

        match opcode {
            TftpOpcode::ReadRequest => Ok(Self::ReadRequest(parse_request(buf)?)),
            TftpOpcode::WriteRequest => Ok(Self::WriteRequest(parse_request(buf)?)),
            TftpOpcode::Data => {
                let block = header_field(buf, opcode)?;
                Ok(Self::Data {
                    block,
                    payload: buf[HEADER_LEN..].to_vec(),
                })
            }
            TftpOpcode::Acknowledgment => Ok(Self::Acknowledge {
                block: header_field(buf, opcode)?,
            }),
            TftpOpcode::Error => {
                let code = header_field(buf, opcode)?;
                // Some peers omit the trailing null; take the message up to the
                // first null or the end of the datagram.
                let msg_bytes = &buf[HEADER_LEN..];
                let end = msg_bytes.iter().position(|&b| b == 0).unwrap_or(msg_bytes.len());
                let message = std::str::from_utf8(&msg_bytes[..end])
                    .map_err(|_| DecodeError::InvalidText("error message"))?
                    .to_string();
                Ok(Self::Error { code, message })
            }
            // Extra bytes after the opcode are ignored: older peers pad the OACK to four bytes.
            TftpOpcode::OptionAck => Ok(Self::OptionAcknowledge),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest(r) | Self::WriteRequest(r) => {
                write!(f, "{} '{}' ({})", self.opcode(), r.filename, r.mode)
            }
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Acknowledge { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
            Self::OptionAcknowledge => write!(f, "OACK"),
        }
    }
}

fn put_text(v: &mut Vec<u8>, text: &str, field: &'static str) -> Result<(), EncodeError> {
    if text.as_bytes().contains(&0) {
        return Err(EncodeError::EmbeddedNul(field));
    }
    v.extend_from_slice(text.as_bytes());
    v.push(0);
    Ok(())
}

/// Read the 2-byte field following the opcode (block number or error code)
fn header_field(buf: &[u8], opcode: TftpOpcode) -> Result<u16, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::TooShort {
            kind: opcode.name(),
            len: buf.len(),
        });
    }
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Read one null-terminated string starting at `start`, returning it and the
/// offset just past its terminator
fn read_text(buf: &[u8], start: usize, field: &'static str) -> Result<(String, usize), DecodeError> {
    let end = find_zero(buf, start).ok_or(DecodeError::Unterminated(field))?;
    let text = std::str::from_utf8(&buf[start..end]).map_err(|_| DecodeError::InvalidText(field))?;
    Ok((text.to_string(), end + 1))
}

fn parse_request(buf: &[u8]) -> Result<Request, DecodeError> {
    let (filename, i) = read_text(buf, 2, "filename")?;
    let (mode, mut i) = read_text(buf, i, "mode")?;

    let mut options = Vec::new();
    while i < buf.len() {
        let (key, next) = read_text(buf, i, "option key")?;
        if next >= buf.len() {
            return Err(DecodeError::OddOptions);
        }
        let (value, next) = read_text(buf, next, "option value")?;
        options.push((key, value));
        i = next;
    }

    Ok(Request {
        filename,
        mode,
        options,
    })
}
