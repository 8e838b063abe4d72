//! The fragment state machine: turns one application message into a
//! send/ack/retry exchange over 16-byte BLE frames and reassembles whatever
//! comes back, per §4.D.
//!
//! This layer is deliberately synchronous and blocking — it has no opinion
//! on threading. The binary crate wraps a [`LowerLayer`] in a dedicated
//! worker thread (§5's "I/O worker"), generalizing the epoll-driven event
//! loop bo-tie's Linux host binding uses into a portable blocking-wait loop
//! since this protocol has no Linux-only transport of its own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::codec::message::TYPE_FRAGMENT_ACK;
use crate::codec::{encode_fragment, FragmentAck, FragmentAssembler, FRAGMENT_LEN};
use crate::error::{Result, TimeoutError};
use crate::transport::{DiscoveredDevice, Transport};

/// Resends per fragment before giving up: 3, matching §4.D.
const RETRY_BUDGET: u8 = 3;

/// Drives one [`Transport`] through the fragment protocol.
pub struct LowerLayer<T: Transport> {
    transport: T,
    assembler: FragmentAssembler,
    pending_inbound: VecDeque<Vec<u8>>,
}

impl<T: Transport> LowerLayer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, assembler: FragmentAssembler::new(), pending_inbound: VecDeque::new() }
    }

    pub fn connect(&mut self, mac: &str) -> Result<()> {
        self.transport.connect(mac)
    }

    /// Tears down the transport connection and discards anything left in
    /// `pending_inbound`: a reconnect starts a fresh session per §3's
    /// invariants, so a message stashed by a previous connection's unsolicited
    /// notification must not survive to be handed to the next one's caller.
    pub fn disconnect(&mut self) -> Result<()> {
        self.pending_inbound.clear();
        self.transport.disconnect()
    }

    pub fn scan(&mut self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.transport.scan(duration)
    }

    /// Drains messages that completed reassembly unsolicited — e.g. a
    /// `StatusChanged` notification arriving while an unrelated exchange was
    /// in flight. Callers that care about such notifications (rather than
    /// only request/reply exchanges) must call this explicitly; `exchange`
    /// never delivers a stashed message in place of a fresh send's own reply.
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        self.pending_inbound.drain(..).collect()
    }

    /// Sends `message` fragment by fragment, acking/retrying per the
    /// contracts in §4.D, then blocks for the lock's reply message. Always
    /// transmits `message` first — a message stashed in `pending_inbound` by
    /// an earlier, unrelated exchange is never substituted for the reply to
    /// this send, per §5's FIFO delivery guarantee.
    pub fn exchange(&mut self, message: &[u8], fragment_timeout: Duration) -> Result<Vec<u8>> {
        let fragments = encode_fragment(message)?;
        let last_index = fragments.len().saturating_sub(1);

        for (index, fragment) in fragments.iter().enumerate() {
            if index == last_index {
                return self.send_and_await_message(fragment, fragment_timeout);
            }
            self.send_and_await_ack(fragment, fragment_timeout)?;
        }

        // `message` was empty: nothing was sent, nothing to wait for.
        Ok(Vec::new())
    }

    fn send_and_await_ack(&mut self, fragment: &[u8; FRAGMENT_LEN], timeout: Duration) -> Result<()> {
        for attempt in 0..=RETRY_BUDGET {
            self.transport.write(fragment)?;
            let deadline = Instant::now() + timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.transport.wait_for_notification(remaining)? {
                    None => break,
                    Some(frame) => {
                        if frame[1] == TYPE_FRAGMENT_ACK && frame[2] == fragment[0] {
                            return Ok(());
                        }
                        self.absorb_unsolicited(&frame)?;
                    }
                }
            }

            if attempt == RETRY_BUDGET {
                return Err(TimeoutError::WaitAck { retries: RETRY_BUDGET }.into());
            }
        }
        unreachable!()
    }

    fn send_and_await_message(&mut self, fragment: &[u8; FRAGMENT_LEN], timeout: Duration) -> Result<Vec<u8>> {
        for attempt in 0..=RETRY_BUDGET {
            self.transport.write(fragment)?;
            let deadline = Instant::now() + timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.transport.wait_for_notification(remaining)? {
                    None => break,
                    Some(frame) => {
                        if let Some(message) = self.absorb_inbound(&frame)? {
                            return Ok(message);
                        }
                    }
                }
            }

            if attempt == RETRY_BUDGET {
                return Err(TimeoutError::WaitAnswer { retries: RETRY_BUDGET }.into());
            }
        }
        unreachable!()
    }

    /// Feeds an inbound frame that arrived while we were waiting for an ack
    /// into the reassembler, acking it if required; any message it
    /// completes is stashed for later delivery.
    fn absorb_unsolicited(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Result<()> {
        if let Some(message) = self.absorb_inbound(frame)? {
            self.pending_inbound.push_back(message);
        }
        Ok(())
    }

    /// Acks `frame` if it is non-terminal, feeds it to the reassembler, and
    /// returns the message it completed, if any.
    fn absorb_inbound(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Result<Option<Vec<u8>>> {
        if frame[0] & 0x7f != 0 {
            let ack = FragmentAck { fragment_id: frame[0] }.encode();
            for ack_fragment in encode_fragment(&ack)? {
                self.transport.write(&ack_fragment)?;
            }
        }
        self.assembler.push(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn single_fragment_exchange_gets_a_reply() {
        let mut lower = LowerLayer::new(MemoryTransport::unpaired([0x11u8; 16], 0xAA));
        lower.connect("AA:BB:CC:DD:EE:FF").unwrap();

        let request = crate::codec::ConnectionRequest { user_id: 0xFF, local_nonce: 1 }.encode();
        let reply = lower.exchange(&request, Duration::from_millis(50)).unwrap();
        let info = crate::codec::ConnectionInfo::decode(&reply).unwrap();
        assert_eq!(info.remote_nonce, 0xAA);
    }

    #[test]
    fn multi_fragment_pairing_request_gets_acked_and_answered() {
        let mut lower = LowerLayer::new(MemoryTransport::unpaired([0x22u8; 16], 7));
        lower.connect("AA:BB:CC:DD:EE:FF").unwrap();

        let connect_reply = lower
            .exchange(&crate::codec::ConnectionRequest { user_id: 0xFF, local_nonce: 1 }.encode(), Duration::from_millis(50))
            .unwrap();
        let info = crate::codec::ConnectionInfo::decode(&connect_reply).unwrap();

        let pairing = crate::codec::PairingRequest::create(0x01, &[0x33u8; 16], info.remote_nonce, 1, &[0x22u8; 16]);
        let reply = lower.exchange(&pairing.encode(), Duration::from_millis(50)).unwrap();
        let answer = crate::codec::AnswerWithoutSecurity::decode(&reply).unwrap();
        assert_eq!(answer.answer, 0);
    }

    #[test]
    fn timeout_surfaces_when_peer_is_unresponsive() {
        struct DeadTransport;
        impl Transport for DeadTransport {
            fn connect(&mut self, _mac: &str) -> Result<()> {
                Ok(())
            }
            fn write(&mut self, _frame: &[u8; FRAGMENT_LEN]) -> Result<()> {
                Ok(())
            }
            fn wait_for_notification(&mut self, _timeout: Duration) -> Result<Option<[u8; FRAGMENT_LEN]>> {
                Ok(None)
            }
            fn disconnect(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut lower = LowerLayer::new(DeadTransport);
        lower.connect("AA:BB:CC:DD:EE:FF").unwrap();
        let request = crate::codec::ConnectionRequest { user_id: 0xFF, local_nonce: 1 }.encode();
        assert!(lower.exchange(&request, Duration::from_millis(1)).is_err());
    }
}
