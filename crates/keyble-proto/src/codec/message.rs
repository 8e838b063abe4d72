//! Typed encode/decode for every KEY-BLE application message.
//!
//! Each plain (unencrypted) message is a thin struct with `encode`/`decode`
//! methods. The encrypted message types (`StatusRequest`, `StatusInfo`,
//! `Command`, `UserInfo`, `UserNameSet`, `AnswerWithSecurity`) all share the
//! same on-wire envelope, [`SecureEnvelope`]; this module only slices that
//! envelope apart; decrypting and verifying it is the session layer's job,
//! since only the session holds the key and the security counters (§4.A).
//!
//! Decoders require their fields' minimum length and otherwise ignore any
//! trailing bytes: a reassembled single-fragment message is always padded
//! out to 15 payload bytes by the fragment layer, so messages shorter than
//! one fragment legitimately arrive with trailing zero padding attached.

use crate::crypto::{self, TAG_LEN};
use crate::error::{InvalidData, Result};

pub const TYPE_FRAGMENT_ACK: u8 = 0x00;
pub const TYPE_ANSWER_WITHOUT_SECURITY: u8 = 0x01;
pub const TYPE_CONNECTION_REQUEST: u8 = 0x02;
pub const TYPE_CONNECTION_INFO: u8 = 0x03;
pub const TYPE_PAIRING_REQUEST: u8 = 0x04;
pub const TYPE_STATUS_CHANGED: u8 = 0x05;
pub const TYPE_CONNECTION_CLOSE: u8 = 0x06;
pub const TYPE_ANSWER_WITH_SECURITY: u8 = 0x81;
pub const TYPE_STATUS_REQUEST: u8 = 0x82;
pub const TYPE_STATUS_INFO: u8 = 0x83;
pub const TYPE_COMMAND: u8 = 0x87;
pub const TYPE_USER_INFO: u8 = 0x8f;
pub const TYPE_USER_NAME_SET: u8 = 0x90;

fn require_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(InvalidData::TooShort { expected, actual: data.len() }.into());
    }
    Ok(())
}

fn require_type(data: &[u8], expected: u8) -> Result<()> {
    if data[0] != expected {
        return Err(InvalidData::WrongType { expected, actual: data[0] }.into());
    }
    Ok(())
}

/// Acknowledges a single received fragment, identified by its status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentAck {
    pub fragment_id: u8,
}

impl FragmentAck {
    pub fn encode(&self) -> Vec<u8> {
        vec![TYPE_FRAGMENT_ACK, self.fragment_id]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 2)?;
        require_type(data, TYPE_FRAGMENT_ACK)?;
        Ok(Self { fragment_id: data[1] })
    }
}

/// A plaintext answer to a not-yet-secured request (before the session has
/// exchanged nonces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerWithoutSecurity {
    pub answer: u8,
}

impl AnswerWithoutSecurity {
    pub fn encode(&self) -> Vec<u8> {
        vec![TYPE_ANSWER_WITHOUT_SECURITY, self.answer]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 2)?;
        require_type(data, TYPE_ANSWER_WITHOUT_SECURITY)?;
        Ok(Self { answer: data[1] })
    }
}

/// Opens a connection attempt: our user id and our freshly generated local
/// nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub user_id: u8,
    pub local_nonce: u64,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.push(TYPE_CONNECTION_REQUEST);
        out.push(self.user_id);
        out.extend_from_slice(&self.local_nonce.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 10)?;
        require_type(data, TYPE_CONNECTION_REQUEST)?;
        let user_id = data[1];
        let local_nonce = u64::from_be_bytes(data[2..10].try_into().unwrap());
        Ok(Self { user_id, local_nonce })
    }
}

/// The lock's reply to a [`ConnectionRequest`]: its own nonce plus firmware
/// version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub user_id: u8,
    pub remote_nonce: u64,
    pub bootloader: u8,
    pub application: u8,
}

impl ConnectionInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.push(TYPE_CONNECTION_INFO);
        out.push(self.user_id);
        out.extend_from_slice(&self.remote_nonce.to_be_bytes());
        out.push(0x00);
        out.push(self.bootloader);
        out.push(self.application);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 13)?;
        require_type(data, TYPE_CONNECTION_INFO)?;
        let user_id = data[1];
        let remote_nonce = u64::from_be_bytes(data[2..10].try_into().unwrap());
        let bootloader = data[11];
        let application = data[12];
        Ok(Self { user_id, remote_nonce, bootloader, application })
    }
}

/// Registers our user key with the lock, itself encrypted with the
/// lock's card key rather than carried in a [`SecureEnvelope`] (pairing
/// happens before any session key exists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub user_id: u8,
    pub encrypted_user_key: [u8; 22],
    pub counter: u16,
    pub authentication: [u8; TAG_LEN],
}

impl PairingRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30);
        out.push(TYPE_PAIRING_REQUEST);
        out.push(self.user_id);
        out.extend_from_slice(&self.encrypted_user_key);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.authentication);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 30)?;
        require_type(data, TYPE_PAIRING_REQUEST)?;
        let user_id = data[1];
        let mut encrypted_user_key = [0u8; 22];
        encrypted_user_key.copy_from_slice(&data[2..24]);
        let counter = u16::from_be_bytes([data[24], data[25]]);
        let mut authentication = [0u8; TAG_LEN];
        authentication.copy_from_slice(&data[26..30]);
        Ok(Self { user_id, encrypted_user_key, counter, authentication })
    }

    /// Builds a pairing request for `user_key`, encrypting it with the
    /// lock's card key and authenticating `[user_id || user_key || padding]`
    /// per §4.A, matching the reference implementation's pairing handshake.
    pub fn create(user_id: u8, user_key: &[u8; 16], remote_nonce: u64, counter: u16, card_key: &[u8; 16]) -> Self {
        let encrypted = crypto::crypt_data(user_key, TYPE_PAIRING_REQUEST, remote_nonce, counter, card_key);
        let mut encrypted_user_key = [0u8; 22];
        encrypted_user_key[..16].copy_from_slice(&encrypted);

        let mut auth_data = Vec::with_capacity(23);
        auth_data.push(user_id);
        auth_data.extend_from_slice(user_key);
        auth_data.extend_from_slice(&[0u8; 6]);
        let authentication = crypto::compute_authentication_value(&auth_data, TYPE_PAIRING_REQUEST, remote_nonce, counter, card_key);

        Self { user_id, encrypted_user_key, counter, authentication }
    }
}

/// Unsolicited notification that the lock's state changed; carries no body,
/// a fresh `StatusRequest` envelope is needed to learn the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChanged;

impl StatusChanged {
    pub fn encode(&self) -> Vec<u8> {
        vec![TYPE_STATUS_CHANGED]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 1)?;
        require_type(data, TYPE_STATUS_CHANGED)?;
        Ok(Self)
    }
}

/// Either side may send this to tear the connection down cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClose;

impl ConnectionClose {
    pub fn encode(&self) -> Vec<u8> {
        vec![TYPE_CONNECTION_CLOSE]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, 1)?;
        require_type(data, TYPE_CONNECTION_CLOSE)?;
        Ok(Self)
    }
}

/// The lock's reported state, carried inside a [`SecureEnvelope`] body once
/// decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    Open,
    Opening,
    Unknown,
    Moving,
}

impl LockState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => LockState::Locked,
            1 => LockState::Unlocked,
            2 => LockState::Open,
            3 => LockState::Opening,
            0xff => LockState::Moving,
            _ => LockState::Unknown,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            LockState::Locked => 0,
            LockState::Unlocked => 1,
            LockState::Open => 2,
            LockState::Opening => 3,
            LockState::Unknown => 4,
            LockState::Moving => 0xff,
        }
    }
}

/// The command a `Command` message requests the lock perform, carried
/// inside a [`SecureEnvelope`] body once decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    Lock,
    Unlock,
    Open,
}

impl LockCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            LockCommand::Lock => 0,
            LockCommand::Unlock => 1,
            LockCommand::Open => 2,
        }
    }
}

/// `[type_id][cipher_body][counter:u16_be][tag:4]`, the shared on-wire shape
/// of every message that carries an authenticated-encryption payload:
/// `AnswerWithSecurity`, `StatusRequest`, `StatusInfo`, `Command`,
/// `UserInfo`, and `UserNameSet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureEnvelope {
    pub type_id: u8,
    pub cipher_body: Vec<u8>,
    pub counter: u16,
    pub tag: [u8; TAG_LEN],
}

impl SecureEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.cipher_body.len() + 2 + TAG_LEN);
        out.push(self.type_id);
        out.extend_from_slice(&self.cipher_body);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn decode(type_id: u8, data: &[u8]) -> Result<Self> {
        require_len(data, 1 + 2 + TAG_LEN)?;
        require_type(data, type_id)?;
        let body_end = data.len() - 2 - TAG_LEN;
        let cipher_body = data[1..body_end].to_vec();
        let counter = u16::from_be_bytes([data[body_end], data[body_end + 1]]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[data.len() - TAG_LEN..]);
        Ok(Self { type_id, cipher_body, counter, tag })
    }

    /// Encrypts `body` under `key`, producing a ready-to-send envelope.
    pub fn seal(type_id: u8, body: &[u8], peer_nonce: u64, counter: u16, key: &[u8; 16]) -> Self {
        let envelope = crypto::encrypt_body(body, type_id, peer_nonce, counter, key);
        Self { type_id, cipher_body: envelope.cipher_body, counter: envelope.counter, tag: envelope.tag }
    }

    /// Decrypts and verifies the envelope; `None` on a tag mismatch. Does
    /// not check counter monotonicity, that's the session layer's job.
    pub fn open(&self, peer_nonce: u64, key: &[u8; 16]) -> Option<Vec<u8>> {
        crypto::decrypt_body(&self.cipher_body, &self.tag, self.type_id, self.counter, peer_nonce, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_ack_roundtrip() {
        let ack = FragmentAck { fragment_id: 0x07 };
        let encoded = ack.encode();
        assert_eq!(encoded, vec![0x00, 0x07]);
        assert_eq!(FragmentAck::decode(&encoded).unwrap(), ack);
    }

    #[test]
    fn connection_request_roundtrip() {
        let request = ConnectionRequest { user_id: 1, local_nonce: 0x0102030405060708 };
        let encoded = request.encode();
        assert_eq!(ConnectionRequest::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn connection_info_roundtrip_with_padding() {
        let info = ConnectionInfo { user_id: 1, remote_nonce: 42, bootloader: 2, application: 3 };
        let mut encoded = info.encode();
        encoded.extend_from_slice(&[0, 0]); // simulate fragment-layer padding
        assert_eq!(ConnectionInfo::decode(&encoded).unwrap(), info);
    }

    #[test]
    fn pairing_request_vector() {
        let request = PairingRequest::create(0x01, &[0u8; 16], 0, 1, &[0u8; 16]);
        let encoded = request.encode();
        let decoded = PairingRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn secure_envelope_roundtrip() {
        let key = [0x42u8; 16];
        let envelope = SecureEnvelope::seal(TYPE_COMMAND, &[LockCommand::Open.to_byte()], 7, 1, &key);
        let encoded = envelope.encode();
        let decoded = SecureEnvelope::decode(TYPE_COMMAND, &encoded).unwrap();
        let body = decoded.open(7, &key).expect("tag verifies");
        assert_eq!(body[0], LockCommand::Open.to_byte());
    }

    #[test]
    fn lock_state_from_byte() {
        assert_eq!(LockState::from_byte(0), LockState::Locked);
        assert_eq!(LockState::from_byte(1), LockState::Unlocked);
        assert_eq!(LockState::from_byte(0xff), LockState::Moving);
        assert_eq!(LockState::from_byte(0x42), LockState::Unknown);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let data = vec![TYPE_FRAGMENT_ACK, 0x00];
        assert!(AnswerWithoutSecurity::decode(&data).is_err());
    }
}
