//! Wire encoding: fragmentation of application messages into BLE
//! notification frames, and typed encode/decode for every message type.

pub mod fragment;
pub mod message;

pub use fragment::{decode_fragment, encode_fragment, FragmentAssembler, FRAGMENT_LEN, MAX_FRAGMENTS, PAYLOAD_LEN};
pub use message::{
    AnswerWithoutSecurity, ConnectionClose, ConnectionInfo, ConnectionRequest, FragmentAck, LockCommand, LockState,
    PairingRequest, SecureEnvelope, StatusChanged,
};
