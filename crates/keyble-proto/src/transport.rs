//! The byte-conduit abstraction between the fragment layer and a real BLE
//! stack, plus an in-process test double.
//!
//! A [`Transport`] does not interpret any byte it carries: it is keyed by
//! two GATT characteristic UUIDs and moves whole 16-byte fragments. The
//! fragment FSM in [`crate::lower`] is the only caller.

use std::collections::VecDeque;
use std::time::Duration;

use crate::codec::{FragmentAssembler, FRAGMENT_LEN};
use crate::crypto;
use crate::error::{Result, TransportError};

/// GATT service advertised by a KEY-BLE lock.
pub const SERVICE_UUID: &str = "58e06900-15d8-11e6-b737-0002a5d5c51b";
/// Characteristic the client writes fragments to.
pub const SEND_CHARACTERISTIC_UUID: &str = "3141dd40-15db-11e6-a24b-0002a5d5c51b";
/// Characteristic the lock notifies fragments on.
pub const RECV_CHARACTERISTIC_UUID: &str = "359d4820-15db-11e6-82bd-0002a5d5c51b";

/// A BLE peripheral discovered by [`Transport::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub mac: String,
    pub local_name: Option<String>,
}

/// The byte conduit the fragment layer drives. Implementors own exactly one
/// connection at a time; `connect` tears down any previous one first.
pub trait Transport: Send {
    /// Opens a connection to `mac`, discovers [`SERVICE_UUID`], and
    /// resolves the send/recv characteristics.
    fn connect(&mut self, mac: &str) -> Result<()>;

    /// Writes one 16-byte fragment as a GATT write-with-response.
    fn write(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Result<()>;

    /// Blocks up to `timeout` for one notification frame from the recv
    /// characteristic. `Ok(None)` on a timeout with nothing received.
    fn wait_for_notification(&mut self, timeout: Duration) -> Result<Option<[u8; FRAGMENT_LEN]>>;

    fn disconnect(&mut self) -> Result<()>;

    /// Performs a BLE inquiry filtered to devices advertising the local name
    /// `KEY-BLE`. Not every transport supports scanning.
    fn scan(&mut self, _duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        Err(TransportError::Scan("this transport does not support scanning".into()).into())
    }
}

/// Replies the simulated lock peer inside [`MemoryTransport`] sends back,
/// modeling just enough of the reference `keyble` daemon's behavior for the
/// fragment and session layers to be driven end-to-end without real BLE
/// hardware.
struct SimulatedLock {
    card_key: [u8; 16],
    user_key: Option<[u8; 16]>,
    provisioned_user_id: u8,
    nonce: u64,
    lock_state: crate::codec::LockState,
    user_name: Option<String>,
    assembler: FragmentAssembler,
}

impl SimulatedLock {
    fn new(card_key: [u8; 16], provisioned_user_id: u8, user_key: Option<[u8; 16]>, nonce: u64) -> Self {
        Self {
            card_key,
            user_key,
            provisioned_user_id,
            nonce,
            lock_state: crate::codec::LockState::Locked,
            user_name: None,
            assembler: FragmentAssembler::new(),
        }
    }

    /// Feeds one inbound (client -> lock) fragment. Returns the frames the
    /// lock sends in response, in order: a [`FragmentAck`](crate::codec::FragmentAck)
    /// for non-terminal fragments, then (once a message completes) whatever
    /// reply that message provokes.
    fn receive_fragment(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Vec<[u8; FRAGMENT_LEN]> {
        let mut replies = Vec::new();

        let remaining = frame[0] & 0x7f;
        if remaining != 0 {
            let ack = crate::codec::FragmentAck { fragment_id: frame[0] }.encode();
            replies.extend(crate::codec::encode_fragment(&ack).unwrap_or_default());
        }

        match self.assembler.push(frame) {
            Ok(Some(message)) => {
                if let Some(reply) = self.handle_message(&message) {
                    replies.extend(crate::codec::encode_fragment(&reply).unwrap_or_default());
                }
            }
            Ok(None) => {}
            Err(_) => {}
        }

        replies
    }

    fn handle_message(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        use crate::codec::message::*;

        if message.is_empty() {
            return None;
        }

        match message[0] {
            TYPE_CONNECTION_REQUEST => {
                let request = ConnectionRequest::decode(message).ok()?;
                let user_id = if request.user_id == 0xFF { self.provisioned_user_id } else { request.user_id };
                Some(
                    ConnectionInfo { user_id, remote_nonce: self.nonce, bootloader: 0x01, application: 0x02 }
                        .encode(),
                )
            }
            TYPE_PAIRING_REQUEST => {
                let request = PairingRequest::decode(message).ok()?;
                // The pairing key is encrypted/authenticated under the
                // lock's own nonce, same as every other secured exchange;
                // `self.client_nonce` is only ever used to identify the
                // connection attempt, never fed to the crypto construction.
                let decrypted = crypto::crypt_data(
                    &request.encrypted_user_key,
                    TYPE_PAIRING_REQUEST,
                    self.nonce,
                    request.counter,
                    &self.card_key,
                );
                let mut user_key = [0u8; 16];
                user_key.copy_from_slice(&decrypted[..16]);

                let mut auth_data = Vec::with_capacity(23);
                auth_data.push(request.user_id);
                auth_data.extend_from_slice(&user_key);
                auth_data.extend_from_slice(&[0u8; 6]);
                let expected = crypto::compute_authentication_value(
                    &auth_data,
                    TYPE_PAIRING_REQUEST,
                    self.nonce,
                    request.counter,
                    &self.card_key,
                );

                let accepted = expected == request.authentication;
                if accepted {
                    self.user_key = Some(user_key);
                    self.provisioned_user_id = request.user_id;
                }
                Some(AnswerWithoutSecurity { answer: if accepted { 0 } else { 1 } }.encode())
            }
            TYPE_STATUS_REQUEST => {
                let envelope = SecureEnvelope::decode(TYPE_STATUS_REQUEST, message).ok()?;
                let key = self.user_key?;
                envelope.open(self.nonce, &key)?;
                let body = [self.lock_state.to_byte()];
                let reply = SecureEnvelope::seal(TYPE_STATUS_INFO, &body, self.nonce, envelope.counter, &key);
                Some(reply.encode())
            }
            TYPE_COMMAND => {
                let envelope = SecureEnvelope::decode(TYPE_COMMAND, message).ok()?;
                let key = self.user_key?;
                let body = envelope.open(self.nonce, &key)?;
                self.lock_state = match body.first() {
                    Some(0) => crate::codec::LockState::Locked,
                    Some(1) => crate::codec::LockState::Unlocked,
                    Some(2) => crate::codec::LockState::Open,
                    _ => self.lock_state,
                };
                let reply = SecureEnvelope::seal(TYPE_ANSWER_WITH_SECURITY, &[0x00], self.nonce, envelope.counter, &key);
                Some(reply.encode())
            }
            TYPE_USER_NAME_SET => {
                let envelope = SecureEnvelope::decode(TYPE_USER_NAME_SET, message).ok()?;
                let key = self.user_key?;
                let body = envelope.open(self.nonce, &key)?;
                self.user_name = Some(String::from_utf8_lossy(&body).trim_end_matches('\0').to_string());
                let reply = SecureEnvelope::seal(TYPE_ANSWER_WITH_SECURITY, &[0x00], self.nonce, envelope.counter, &key);
                Some(reply.encode())
            }
            _ => None,
        }
    }
}

/// An in-process transport backed by a [`SimulatedLock`] instead of real BLE
/// hardware, for unit and integration tests.
pub struct MemoryTransport {
    connected: bool,
    peer: SimulatedLock,
    notifications: VecDeque<[u8; FRAGMENT_LEN]>,
    devices: Vec<DiscoveredDevice>,
}

impl MemoryTransport {
    /// The display name last accepted via a `UserNameSet` exchange, if any.
    /// Test-only introspection into the simulated peer.
    pub fn user_name(&self) -> Option<&str> {
        self.peer.user_name.as_deref()
    }

    /// Builds a transport fronting an already-paired lock.
    pub fn paired(card_key: [u8; 16], user_id: u8, user_key: [u8; 16], nonce: u64) -> Self {
        Self {
            connected: false,
            peer: SimulatedLock::new(card_key, user_id, Some(user_key), nonce),
            notifications: VecDeque::new(),
            devices: vec![DiscoveredDevice { mac: "AA:BB:CC:DD:EE:FF".into(), local_name: Some("KEY-BLE".into()) }],
        }
    }

    /// Builds a transport fronting an unpaired lock that only knows its card key.
    pub fn unpaired(card_key: [u8; 16], nonce: u64) -> Self {
        Self {
            connected: false,
            peer: SimulatedLock::new(card_key, 0, None, nonce),
            notifications: VecDeque::new(),
            devices: vec![DiscoveredDevice { mac: "AA:BB:CC:DD:EE:FF".into(), local_name: Some("KEY-BLE".into()) }],
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, _mac: &str) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn write(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Result<()> {
        if !self.connected {
            return Err(TransportError::NotConnected.into());
        }
        for reply in self.peer.receive_fragment(frame) {
            self.notifications.push_back(reply);
        }
        Ok(())
    }

    fn wait_for_notification(&mut self, _timeout: Duration) -> Result<Option<[u8; FRAGMENT_LEN]>> {
        if !self.connected {
            return Err(TransportError::NotConnected.into());
        }
        Ok(self.notifications.pop_front())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn scan(&mut self, _duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_fragment, FragmentAck};

    #[test]
    fn connect_request_yields_connection_info() {
        let card_key = [0x11u8; 16];
        let mut transport = MemoryTransport::unpaired(card_key, 0xAA);
        transport.connect("AA:BB:CC:DD:EE:FF").unwrap();

        let request = crate::codec::ConnectionRequest { user_id: 0xFF, local_nonce: 7 }.encode();
        for frame in encode_fragment(&request).unwrap() {
            transport.write(&frame).unwrap();
        }

        let notified = transport.wait_for_notification(Duration::from_millis(0)).unwrap().expect("a reply");
        let (messages, _) = crate::codec::decode_fragment(&[notified]).unwrap();
        let info = crate::codec::ConnectionInfo::decode(&messages[0]).unwrap();
        assert_eq!(info.remote_nonce, 0xAA);
    }

    #[test]
    fn write_without_connect_is_an_error() {
        let mut transport = MemoryTransport::unpaired([0u8; 16], 1);
        let frame = encode_fragment(&FragmentAck { fragment_id: 0 }.encode()).unwrap()[0];
        assert!(transport.write(&frame).is_err());
    }

    #[test]
    fn user_name_set_is_recorded_by_the_simulated_peer() {
        let card_key = [0x88u8; 16];
        let user_key = [0x99u8; 16];
        let mut transport = MemoryTransport::paired(card_key, 1, user_key, 42);
        transport.connect("AA:BB:CC:DD:EE:FF").unwrap();

        let envelope = crate::codec::SecureEnvelope::seal(
            crate::codec::message::TYPE_USER_NAME_SET,
            b"front door",
            42,
            1,
            &user_key,
        );
        for frame in encode_fragment(&envelope.encode()).unwrap() {
            transport.write(&frame).unwrap();
        }

        while transport.wait_for_notification(Duration::from_millis(0)).unwrap().is_some() {}
        assert_eq!(transport.user_name(), Some("front door"));
    }
}
