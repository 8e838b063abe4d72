//! Error types for the KEY-BLE application protocol.
//!
//! Each layer gets its own `thiserror` enum; [`Error`] composes them into the
//! single type that crosses the crate boundary, matching the propagation
//! policy in the system design: retries are absorbed inside the fragment
//! layer, everything else surfaces as one aggregate error.

use thiserror::Error;

/// Malformed wire bytes: bad type id, wrong length, oversize message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidData {
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unexpected message type byte {actual:#04x}, expected {expected:#04x}")]
    WrongType { expected: u8, actual: u8 },

    #[error("unknown message type byte {0:#04x}")]
    UnknownType(u8),

    #[error("message has {len} fragments, which exceeds the 0x7f fragment limit")]
    MessageTooBig { len: usize },

    #[error("fragment payload must be exactly 15 bytes, got {0}")]
    BadFragmentLength(usize),
}

/// Ordering violations detected while reassembling fragments or validating
/// an authenticated message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("received a non-start fragment with no reassembly in progress")]
    FragmentWithoutStart,

    #[error("received a start fragment while a reassembly was already in progress")]
    StartFragmentMidStream,

    #[error("fragment sequence out of order: expected {expected}, got {actual}")]
    FragmentOutOfSequence { expected: u8, actual: u8 },

    #[error("security counter {counter} is not greater than the last accepted counter {last}")]
    StaleCounter { counter: u16, last: u16 },

    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    #[error("security counter overflowed its 16-bit range")]
    CounterOverflow,

    #[error("the lock refused the user id")]
    UserIdRefused,

    #[error("received a message of type {0:#04x} that was not expected in the current state")]
    UnexpectedMessage(u8),
}

/// Deadline expired waiting for an ack, a response, or a state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("timed out waiting for a FragmentAck after {retries} retries")]
    WaitAck { retries: u8 },

    #[error("timed out waiting for the answer to a sent message after {retries} retries")]
    WaitAnswer { retries: u8 },

    #[error("timed out waiting for the session to reach state {0}")]
    WaitState(&'static str),
}

/// BLE connect/write failures reported by the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {mac}: {reason}")]
    Connect { mac: String, reason: String },

    #[error("write failed: {0}")]
    Write(String),

    #[error("device is not connected")]
    NotConnected,

    #[error("BLE scan failed: {0}")]
    Scan(String),
}

/// Bad CLI arguments or configuration, caught before any protocol work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("key must be exactly 16 bytes (32 hex characters), got {0} bytes")]
    WrongKeyLength(usize),

    #[error("invalid hex in key: {0}")]
    BadHex(String),

    #[error("QR payload does not match the expected grammar M<mac:12hex>K<cardkey:32hex><serial:10>")]
    BadQrPayload,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid configuration file: {0}")]
    BadConfigFile(String),
}

/// The aggregate error type that crosses the `keyble-proto` crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidData(#[from] InvalidData),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = core::result::Result<T, Error>;
