//! The session state machine: owns the nonce exchange, the security
//! counters, and the higher-level `discover`/`pair`/`status`/`lock`/
//! `unlock`/`open` operations built on top of the fragment layer (§4.E).
//!
//! A single nonce is used for every authenticated exchange in a session:
//! the lock's own nonce, learned from its `ConnectionInfo` reply. The
//! client's nonce (sent in `ConnectionRequest`) only identifies the
//! connection attempt; it never feeds the crypto construction itself. This
//! mirrors `PairingRequestMessage.create`'s `remote_session_nonce` parameter
//! in the reference implementation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::message::{TYPE_ANSWER_WITH_SECURITY, TYPE_STATUS_INFO, TYPE_STATUS_REQUEST, TYPE_USER_NAME_SET};
use crate::codec::{
    AnswerWithoutSecurity, ConnectionInfo, ConnectionRequest, LockCommand, LockState, PairingRequest, SecureEnvelope,
};
use crate::error::{ConfigError, Error, ProtocolError, Result};
use crate::lower::LowerLayer;
use crate::transport::{DiscoveredDevice, Transport};

/// Default per-operation deadline, matching the reference CLI's behavior of
/// never hanging indefinitely on an unresponsive lock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// `ConnectionInfo.{bootloader, application}` as reported by `discover`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bootloader: u8,
    pub application: u8,
}

fn now_timestamp() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

/// One KEY-BLE session against a single lock. Each public operation owns
/// its own connect/disconnect: the protocol has no notion of a
/// long-lived idle connection.
pub struct Session<T: Transport> {
    lower: LowerLayer<T>,
    user_id: u8,
    user_key: Option<[u8; 16]>,
    local_nonce: u64,
    remote_nonce: Option<u64>,
    local_counter: u16,
    remote_counter: u16,
    timeout: Duration,
}

impl<T: Transport> Session<T> {
    /// `user_id = 0xFF` requests the lock assign a fresh id, used for
    /// `pair`. `user_key` may be `None` until pairing completes.
    pub fn new(transport: T, user_id: u8, user_key: Option<[u8; 16]>, local_nonce: u64, timeout: Duration) -> Self {
        Self {
            lower: LowerLayer::new(transport),
            user_id,
            user_key,
            local_nonce,
            remote_nonce: None,
            local_counter: 1,
            remote_counter: 0,
            timeout,
        }
    }

    /// Same as [`Session::new`], generating `local_nonce` with the system
    /// RNG rather than requiring the caller to supply one; the production
    /// CLI uses this, tests use [`Session::new`] directly for determinism.
    pub fn connect_new(transport: T, user_id: u8, user_key: Option<[u8; 16]>, timeout: Duration) -> Self {
        Self::new(transport, user_id, user_key, rand::random(), timeout)
    }

    pub fn user_id(&self) -> u8 {
        self.user_id
    }

    pub fn scan(&mut self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.lower.scan(duration)
    }

    fn connect(&mut self, mac: &str) -> Result<ConnectionInfo> {
        self.lower.connect(mac)?;
        let request = ConnectionRequest { user_id: self.user_id, local_nonce: self.local_nonce }.encode();
        let reply = self.lower.exchange(&request, self.timeout)?;
        let info = ConnectionInfo::decode(&reply)?;
        self.user_id = info.user_id;
        self.remote_nonce = Some(info.remote_nonce);
        Ok(info)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.lower.disconnect()
    }

    fn require_key(&self) -> Result<[u8; 16]> {
        self.user_key.ok_or_else(|| Error::from(ConfigError::MissingField("user_key")))
    }

    fn require_remote_nonce(&self) -> Result<u64> {
        self.remote_nonce.ok_or_else(|| Error::from(ConfigError::MissingField("remote_nonce")))
    }

    fn take_counter(&mut self) -> Result<u16> {
        let counter = self.local_counter;
        self.local_counter = self.local_counter.checked_add(1).ok_or(ProtocolError::CounterOverflow)?;
        Ok(counter)
    }

    /// Callers must verify the envelope's tag (via `SecureEnvelope::open`)
    /// before calling this: only a tag-verified message may advance
    /// `remote_counter`, per §3/§8. Advancing it on an unverified envelope
    /// would let a forged counter value desynchronize the session against
    /// the real lock's subsequent, legitimately-lower counters.
    fn accept_remote_counter(&mut self, counter: u16) -> Result<()> {
        if counter <= self.remote_counter {
            return Err(ProtocolError::StaleCounter { counter, last: self.remote_counter }.into());
        }
        self.remote_counter = counter;
        Ok(())
    }

    /// Runs `body` inside a connect/disconnect bracket, disconnecting even
    /// on error so the next operation starts from a clean `Disconnected`
    /// state, per §5's cancellation contract.
    fn with_connection<R>(&mut self, mac: &str, body: impl FnOnce(&mut Self, ConnectionInfo) -> Result<R>) -> Result<R> {
        let info = self.connect(mac)?;
        let result = body(&mut *self, info);
        self.disconnect()?;
        result
    }

    /// Connects, reads `ConnectionInfo`, disconnects: reports the lock's
    /// firmware version without needing a user key.
    pub fn discover(&mut self, mac: &str) -> Result<DeviceInfo> {
        self.with_connection(mac, |_session, info| Ok(DeviceInfo { bootloader: info.bootloader, application: info.application }))
    }

    /// Registers `new_user_key` with the lock using the QR card's
    /// `card_key` as the temporary pairing key. `self` should have been
    /// constructed with `user_id = 0xFF` to request a fresh id.
    pub fn pair(&mut self, mac: &str, card_key: &[u8; 16], new_user_key: &[u8; 16]) -> Result<u8> {
        self.with_connection(mac, |session, _info| {
            let remote_nonce = session.require_remote_nonce()?;
            let counter = session.take_counter()?;
            let request = PairingRequest::create(session.user_id, new_user_key, remote_nonce, counter, card_key);
            let reply = session.lower.exchange(&request.encode(), session.timeout)?;
            let answer = AnswerWithoutSecurity::decode(&reply)?;
            if answer.answer != 0 {
                return Err(ProtocolError::UserIdRefused.into());
            }
            session.user_key = Some(*new_user_key);
            Ok(session.user_id)
        })
    }

    /// Reads the lock's current state.
    pub fn status(&mut self, mac: &str) -> Result<LockState> {
        self.with_connection(mac, |session, _info| {
            let key = session.require_key()?;
            let remote_nonce = session.require_remote_nonce()?;
            let counter = session.take_counter()?;
            let body = now_timestamp().to_be_bytes();
            let envelope = SecureEnvelope::seal(TYPE_STATUS_REQUEST, &body, remote_nonce, counter, &key);

            let reply = session.lower.exchange(&envelope.encode(), session.timeout)?;
            let info_envelope = SecureEnvelope::decode(TYPE_STATUS_INFO, &reply)?;
            let body = info_envelope.open(remote_nonce, &key).ok_or(ProtocolError::AuthenticationFailed)?;
            session.accept_remote_counter(info_envelope.counter)?;
            let state_byte = *body.first().ok_or(crate::error::InvalidData::TooShort { expected: 1, actual: 0 })?;
            Ok(LockState::from_byte(state_byte))
        })
    }

    /// Sends a `Command` message and waits for the lock's secured answer.
    fn command(&mut self, mac: &str, command: LockCommand) -> Result<()> {
        self.with_connection(mac, |session, _info| {
            let key = session.require_key()?;
            let remote_nonce = session.require_remote_nonce()?;
            let counter = session.take_counter()?;
            let envelope = SecureEnvelope::seal(crate::codec::message::TYPE_COMMAND, &[command.to_byte()], remote_nonce, counter, &key);

            let reply = session.lower.exchange(&envelope.encode(), session.timeout)?;
            let answer_envelope = SecureEnvelope::decode(TYPE_ANSWER_WITH_SECURITY, &reply)?;
            let body = answer_envelope.open(remote_nonce, &key).ok_or(ProtocolError::AuthenticationFailed)?;
            session.accept_remote_counter(answer_envelope.counter)?;
            if body.first() != Some(&0) {
                return Err(ProtocolError::UserIdRefused.into());
            }
            Ok(())
        })
    }

    /// Registers a display name for the current user, per the CLI's
    /// optional `--user-name` flag on `--register`. Not exercised by the
    /// reference implementation (`UserNameSet` is a stubbed message type
    /// there); composed the same way as `command` since both are a
    /// one-shot secured request answered by `AnswerWithSecurity`.
    pub fn set_user_name(&mut self, mac: &str, name: &str) -> Result<()> {
        self.with_connection(mac, |session, _info| {
            let key = session.require_key()?;
            let remote_nonce = session.require_remote_nonce()?;
            let counter = session.take_counter()?;
            let envelope = SecureEnvelope::seal(TYPE_USER_NAME_SET, name.as_bytes(), remote_nonce, counter, &key);

            let reply = session.lower.exchange(&envelope.encode(), session.timeout)?;
            let answer_envelope = SecureEnvelope::decode(TYPE_ANSWER_WITH_SECURITY, &reply)?;
            let body = answer_envelope.open(remote_nonce, &key).ok_or(ProtocolError::AuthenticationFailed)?;
            session.accept_remote_counter(answer_envelope.counter)?;
            if body.first() != Some(&0) {
                return Err(ProtocolError::UserIdRefused.into());
            }
            Ok(())
        })
    }

    pub fn lock(&mut self, mac: &str) -> Result<()> {
        self.command(mac, LockCommand::Lock)
    }

    pub fn unlock(&mut self, mac: &str) -> Result<()> {
        self.command(mac, LockCommand::Unlock)
    }

    pub fn open(&mut self, mac: &str) -> Result<()> {
        self.command(mac, LockCommand::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn discover_reports_firmware_version() {
        let mut session = Session::new(MemoryTransport::unpaired([0x11u8; 16], 99), 0xFF, None, 1, Duration::from_millis(100));
        let info = session.discover("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(info.bootloader, 0x01);
        assert_eq!(info.application, 0x02);
    }

    #[test]
    fn pair_then_status_then_lock_cycle() {
        let card_key = [0x22u8; 16];
        let user_key = [0x33u8; 16];
        let mut session = Session::new(MemoryTransport::unpaired(card_key, 77), 0xFF, None, 1, Duration::from_millis(100));

        let user_id = session.pair("AA:BB:CC:DD:EE:FF", &card_key, &user_key).unwrap();
        assert_eq!(session.user_id(), user_id);

        let state = session.status("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(state, LockState::Locked);

        session.unlock("AA:BB:CC:DD:EE:FF").unwrap();
        let state = session.status("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(state, LockState::Unlocked);
    }

    #[test]
    fn set_user_name_after_pairing() {
        let card_key = [0x66u8; 16];
        let user_key = [0x77u8; 16];
        let mut session = Session::new(MemoryTransport::unpaired(card_key, 5), 0xFF, None, 1, Duration::from_millis(100));
        session.pair("AA:BB:CC:DD:EE:FF", &card_key, &user_key).unwrap();
        session.set_user_name("AA:BB:CC:DD:EE:FF", "front door").unwrap();
    }

    #[test]
    fn status_without_pairing_fails() {
        let mut session = Session::new(MemoryTransport::unpaired([0u8; 16], 1), 1, None, 1, Duration::from_millis(100));
        assert!(session.status("AA:BB:CC:DD:EE:FF").is_err());
    }

    #[test]
    fn command_against_already_paired_lock() {
        let card_key = [0x44u8; 16];
        let user_key = [0x55u8; 16];
        let mut session =
            Session::new(MemoryTransport::paired(card_key, 3, user_key, 123), 3, Some(user_key), 9, Duration::from_millis(100));
        session.lock("AA:BB:CC:DD:EE:FF").unwrap();
        let state = session.status("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(state, LockState::Locked);
    }
}
