//! Splitting application messages into 16-byte BLE notification frames and
//! reassembling them on the receiving side.

use crate::error::{Error, InvalidData, ProtocolError, Result};

/// Size in bytes of one BLE notification frame (status byte + payload).
pub const FRAGMENT_LEN: usize = 16;

/// Size in bytes of a fragment's payload, excluding the status byte.
pub const PAYLOAD_LEN: usize = 15;

/// The largest fragment count a single message may span (low 7 bits of the
/// status byte).
pub const MAX_FRAGMENTS: usize = 0x7f;

/// Splits `message` into `ceil(len(message) / 15)` fragments, each 16 bytes:
/// a status byte followed by 15 payload bytes (zero-padded on the last
/// fragment). The status byte's top bit marks the first fragment; its low 7
/// bits count the fragments remaining after this one, ending at 0.
pub fn encode_fragment(message: &[u8]) -> Result<Vec<[u8; FRAGMENT_LEN]>> {
    let count = (message.len() + PAYLOAD_LEN - 1) / PAYLOAD_LEN;
    if count > MAX_FRAGMENTS {
        return Err(InvalidData::MessageTooBig { len: count }.into());
    }

    let mut fragments = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * PAYLOAD_LEN;
        let end = (start + PAYLOAD_LEN).min(message.len());

        let mut frame = [0u8; FRAGMENT_LEN];
        let mut status = ((count - 1 - i) & 0x7f) as u8;
        if i == 0 {
            status |= 0x80;
        }
        frame[0] = status;
        frame[1..1 + (end - start)].copy_from_slice(&message[start..end]);
        fragments.push(frame);
    }
    Ok(fragments)
}

/// Incremental reassembler for a stream of inbound fragments. Tracks the
/// "fragments remaining" counter carried in each status byte rather than
/// requiring the whole stream up front, since fragments arrive one BLE
/// notification at a time.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    expected: Option<u8>,
    buffer: Vec<u8>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a reassembly is in progress (a start fragment has been
    /// seen but the message is not yet complete).
    pub fn in_progress(&self) -> bool {
        self.expected.is_some()
    }

    /// Feeds one 16-byte notification frame. Returns the reassembled
    /// message once its last fragment arrives; the assembler is then reset
    /// and ready for the next message.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        if frame.len() != FRAGMENT_LEN {
            return Err(InvalidData::BadFragmentLength(frame.len()).into());
        }

        let status = frame[0];
        let is_start = status & 0x80 != 0;
        let remaining = status & 0x7f;

        let next_expected = match (self.expected, is_start) {
            (Some(_), true) => return Err(Error::from(ProtocolError::StartFragmentMidStream)),
            (None, false) => return Err(Error::from(ProtocolError::FragmentWithoutStart)),
            (None, true) => remaining,
            (Some(expected), false) => {
                let required = expected.checked_sub(1).unwrap_or(0);
                if remaining != required {
                    return Err(Error::from(ProtocolError::FragmentOutOfSequence {
                        expected: required,
                        actual: remaining,
                    }));
                }
                required
            }
        };

        self.buffer.extend_from_slice(&frame[1..FRAGMENT_LEN]);

        if next_expected == 0 {
            self.expected = None;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            self.expected = Some(next_expected);
            Ok(None)
        }
    }
}

/// Convenience wrapper around [`FragmentAssembler`] for feeding a complete,
/// already-collected list of fragments at once.
pub fn decode_fragment(frames: &[[u8; FRAGMENT_LEN]]) -> Result<(Vec<Vec<u8>>, usize)> {
    let mut assembler = FragmentAssembler::new();
    let mut messages = Vec::new();
    let mut consumed = 0;
    for frame in frames {
        match assembler.push(frame)? {
            Some(message) => {
                messages.push(message);
                consumed = 0;
            }
            None => consumed += 1,
        }
    }
    Ok((messages, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex16(s: &str) -> [u8; FRAGMENT_LEN] {
        let bytes = hex::decode(s).expect("valid hex");
        let mut frame = [0u8; FRAGMENT_LEN];
        frame.copy_from_slice(&bytes);
        frame
    }

    #[test]
    fn single_fragment_status_byte() {
        let message = vec![0x01, 0x02, 0x03];
        let fragments = encode_fragment(&message).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0][0], 0x80);
    }

    #[test]
    fn three_fragment_status_bytes() {
        let message = vec![0u8; 15 * 2 + 1];
        let fragments = encode_fragment(&message).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0][0], 0x82);
        assert_eq!(fragments[1][0], 0x01);
        assert_eq!(fragments[2][0], 0x00);
    }

    #[test]
    fn too_many_fragments_rejected() {
        let message = vec![0u8; (MAX_FRAGMENTS + 1) * PAYLOAD_LEN];
        assert!(encode_fragment(&message).is_err());
    }

    #[test]
    fn roundtrip() {
        let message: Vec<u8> = (0..40u8).collect();
        let fragments = encode_fragment(&message).unwrap();
        let (messages, leftover) = decode_fragment(&fragments).unwrap();
        assert_eq!(leftover, 0);
        assert_eq!(messages.len(), 1);
        // the last fragment is zero-padded, so the reassembled buffer can be
        // longer than the original message by up to 14 bytes.
        assert_eq!(&messages[0][..message.len()], &message[..]);
    }

    #[test]
    fn end_to_end_open_command_is_one_fragment() {
        let message = vec![0x87u8, 0x02, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD];
        let fragments = encode_fragment(&message).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0][0], 0x80);
    }

    #[test]
    fn decode_two_fragment_message() {
        let frames = [
            hex16("818f4d24bc21179af3dc74e0984c36b4"),
            hex16("00ce544580d09412264100030eedbc6b"),
        ];
        let (messages, leftover) = decode_fragment(&frames).unwrap();
        assert_eq!(leftover, 0);
        assert_eq!(messages.len(), 1);
        let expected: Vec<u8> = frames[0][1..]
            .iter()
            .chain(frames[1][1..].iter())
            .copied()
            .collect();
        assert_eq!(messages[0], expected);
    }

    #[test]
    fn non_start_fragment_without_start_is_an_error() {
        let mut assembler = FragmentAssembler::new();
        let frame = [0u8; FRAGMENT_LEN];
        assert!(assembler.push(&frame).is_err());
    }

    #[test]
    fn start_fragment_mid_stream_is_an_error() {
        let mut assembler = FragmentAssembler::new();
        let mut start = [0u8; FRAGMENT_LEN];
        start[0] = 0x81;
        assembler.push(&start).unwrap();
        assert!(assembler.push(&start).is_err());
    }

    #[test]
    fn out_of_sequence_fragment_is_an_error() {
        let mut assembler = FragmentAssembler::new();
        let mut start = [0u8; FRAGMENT_LEN];
        start[0] = 0x82;
        assembler.push(&start).unwrap();
        let mut bad = [0u8; FRAGMENT_LEN];
        bad[0] = 0x01;
        assert!(assembler.push(&bad).is_err());
    }

    proptest::proptest! {
        /// Every fragment `encode_fragment` produces is exactly 16 bytes,
        /// the first has its top status bit set and no other one does, and
        /// the low-7-bit sequence counter counts down to exactly 0.
        #[test]
        fn fragment_framing_invariants(message in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..15 * MAX_FRAGMENTS)) {
            let fragments = encode_fragment(&message).unwrap();
            for (i, fragment) in fragments.iter().enumerate() {
                proptest::prop_assert_eq!(fragment.len(), FRAGMENT_LEN);
                proptest::prop_assert_eq!(fragment[0] & 0x80 != 0, i == 0);
            }
            for window in fragments.windows(2) {
                proptest::prop_assert_eq!((window[0][0] & 0x7f) - 1, window[1][0] & 0x7f);
            }
            proptest::prop_assert_eq!(fragments.last().unwrap()[0] & 0x7f, 0);
        }

        /// Encoding then decoding any message up to the fragment-count limit
        /// reassembles to that same message (the final fragment may carry
        /// trailing zero padding beyond the original length).
        #[test]
        fn fragmentation_round_trip(message in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..15 * MAX_FRAGMENTS)) {
            let fragments = encode_fragment(&message).unwrap();
            let (messages, leftover) = decode_fragment(&fragments).unwrap();
            proptest::prop_assert_eq!(leftover, 0);
            proptest::prop_assert_eq!(messages.len(), 1);
            proptest::prop_assert_eq!(&messages[0][..message.len()], &message[..]);
        }
    }
}
