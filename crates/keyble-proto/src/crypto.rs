//! The KEY-BLE authenticated encryption construction.
//!
//! This is a bespoke AES-128-CTR-like keystream combined with a CBC-MAC-style
//! authentication tag, both built from a single AES-128-ECB block primitive.
//! It is not a standard AEAD mode (it predates widespread AES-CCM/GCM use in
//! this class of device) so it is hand-rolled here rather than borrowed from
//! an `aead`-trait crate; the only external dependency is the `aes` crate's
//! block cipher.
//!
//! All multi-byte integers in the wire format are big-endian. The
//! little-endian nonce packing that exists in one branch of the reference
//! implementation is dead code there; the big-endian packing is the one that
//! matches the published test vectors and is the only one implemented here.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

/// Length in bytes of the packed nonce (`B Q B B H`: 1 + 8 + 1 + 1 + 2).
const NONCE_LEN: usize = 13;

/// Length in bytes of an AES block.
const BLOCK_LEN: usize = 16;

/// Length in bytes of the authentication tag.
pub const TAG_LEN: usize = 4;

fn aes_ecb_encrypt_block(key: &[u8; 16], block: &[u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// Returns the smallest value `minimum + k*step` (for a natural number `k`)
/// that is `>= length`.
pub fn padding_length(length: usize, step: usize, minimum: usize) -> usize {
    if length <= minimum {
        return minimum;
    }
    let extra = length - minimum;
    let k = (extra + step - 1) / step;
    minimum + k * step
}

/// Grows `data` with trailing zero bytes up to `padding_length(data.len(), step, minimum)`.
/// Never truncates: an already-long input is returned unchanged.
pub fn pad_array(data: &[u8], step: usize, minimum: usize) -> Vec<u8> {
    let target = padding_length(data.len(), step, minimum);
    let mut out = data.to_vec();
    if out.len() < target {
        out.resize(target, 0);
    }
    out
}

/// XORs `data` with `xor_data`, wrapping around `xor_data` (starting at
/// `xor_data_offset`) if it is shorter than `data`.
pub fn xor_array(data: &[u8], xor_data: &[u8], xor_data_offset: usize) -> Vec<u8> {
    debug_assert!(!xor_data.is_empty());
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ xor_data[(xor_data_offset + i) % xor_data.len()])
        .collect()
}

fn block_from_parts(first_byte: u8, nonce: &[u8; NONCE_LEN], tail: &[u8]) -> [u8; BLOCK_LEN] {
    let mut v = Vec::with_capacity(1 + NONCE_LEN + tail.len());
    v.push(first_byte);
    v.extend_from_slice(nonce);
    v.extend_from_slice(tail);
    let padded = pad_array(&v, BLOCK_LEN, 0);
    let mut block = [0u8; BLOCK_LEN];
    block.copy_from_slice(&padded[..BLOCK_LEN]);
    block
}

/// Builds the 13-byte crypto nonce: `[type_id | peer_nonce:u64be | 0x00 | 0x00 | counter:u16be]`.
///
/// `session_open_nonce` is always the *peer's* nonce: the remote side's nonce
/// when encrypting an outbound message, our own local nonce when verifying
/// an inbound one.
pub fn compute_nonce(message_type_id: u8, session_open_nonce: u64, security_counter: u16) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = message_type_id;
    nonce[1..9].copy_from_slice(&session_open_nonce.to_be_bytes());
    nonce[9] = 0;
    nonce[10] = 0;
    nonce[11..13].copy_from_slice(&security_counter.to_be_bytes());
    nonce
}

/// AES-CTR-like keystream encryption/decryption. `message_data` must not
/// include the leading message-type byte. This function is its own inverse.
pub fn crypt_data(
    message_data: &[u8],
    message_type_id: u8,
    session_open_nonce: u64,
    security_counter: u16,
    key: &[u8; 16],
) -> Vec<u8> {
    let nonce = compute_nonce(message_type_id, session_open_nonce, security_counter);
    let block_count = padding_length(message_data.len(), BLOCK_LEN, 0) / BLOCK_LEN;

    let mut keystream = Vec::with_capacity(block_count * BLOCK_LEN);
    for index in 0..block_count {
        let counter = ((index + 1) as u16).to_be_bytes();
        let block = block_from_parts(0x01, &nonce, &counter);
        keystream.extend_from_slice(&aes_ecb_encrypt_block(key, &block));
    }

    xor_array(message_data, &keystream, 0)
}

/// Computes the 4-byte CBC-MAC-style authentication tag over the (already
/// padded-to-15/min-8) plaintext body.
pub fn compute_authentication_value(
    message_data: &[u8],
    message_type_id: u8,
    session_nonce: u64,
    security_counter: u16,
    user_key: &[u8; 16],
) -> [u8; TAG_LEN] {
    let nonce = compute_nonce(message_type_id, session_nonce, security_counter);
    let length = message_data.len() as u16;

    let padded_data = pad_array(message_data, BLOCK_LEN, 0);

    let header = block_from_parts(0x09, &nonce, &length.to_be_bytes());
    let mut x = aes_ecb_encrypt_block(user_key, &header);

    for chunk in padded_data.chunks(BLOCK_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        for (b, (xi, pi)) in block.iter_mut().zip(x.iter().zip(chunk.iter())) {
            *b = xi ^ pi;
        }
        x = aes_ecb_encrypt_block(user_key, &block);
    }

    // The length field that conceptually follows in the reference layout
    // lands entirely in a second AES block that this construction never
    // uses (only the first 4 bytes of the *first* block's output feed the
    // tag), so it has no effect here and is omitted; this block is the
    // "index 0" keystream block that masks the CBC-MAC chaining value.
    let tail = block_from_parts(0x01, &nonce, &[0x00, 0x00]);
    let keystream_block = aes_ecb_encrypt_block(user_key, &tail);

    let mut tag = [0u8; TAG_LEN];
    for i in 0..TAG_LEN {
        tag[i] = x[i] ^ keystream_block[i];
    }
    tag
}

/// The ciphertext envelope produced by [`encrypt_body`]: `[cipher_body][counter:u16be][tag:4]`,
/// to be prefixed with the message-type byte by the caller.
pub struct EncryptedEnvelope {
    pub cipher_body: Vec<u8>,
    pub counter: u16,
    pub tag: [u8; TAG_LEN],
}

/// Encrypts and authenticates a message body (everything after the type
/// byte) per §4.A: the body is padded to a `(step=15, min=8)` boundary before
/// both the keystream and the MAC are computed over it.
pub fn encrypt_body(body: &[u8], message_type_id: u8, peer_nonce: u64, counter: u16, key: &[u8; 16]) -> EncryptedEnvelope {
    let padded_body = pad_array(body, 15, 8);
    let cipher_body = crypt_data(&padded_body, message_type_id, peer_nonce, counter, key);
    let tag = compute_authentication_value(&padded_body, message_type_id, peer_nonce, counter, key);
    EncryptedEnvelope { cipher_body, counter, tag }
}

/// Decrypts a body that was encrypted with [`encrypt_body`] and verifies its
/// tag, without touching the security counter: the caller (the session
/// layer) owns the monotonicity check since it alone knows the last accepted
/// counter.
pub fn decrypt_body(
    cipher_body: &[u8],
    tag: &[u8; TAG_LEN],
    message_type_id: u8,
    counter: u16,
    peer_nonce: u64,
    key: &[u8; 16],
) -> Option<Vec<u8>> {
    let body = crypt_data(cipher_body, message_type_id, peer_nonce, counter, key);
    let expected_tag = compute_authentication_value(&body, message_type_id, peer_nonce, counter, key);
    if &expected_tag != tag {
        return None;
    }
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_vector() {
        let nonce = compute_nonce(0x17, 0x0102030405060708, 42);
        assert_eq!(
            nonce,
            [0x17, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0x00, 0x2A]
        );
    }

    #[test]
    fn auth_value_vector() {
        let key: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let tag = compute_authentication_value(&[1, 2, 3], 0x17, 0x0102030405060708, 1, &key);
        assert_eq!(tag, [0xDB, 0xDF, 0x89, 0xE9]);
    }

    #[test]
    fn padding_vector() {
        assert_eq!(pad_array(&[], 15, 8).len(), 8);
        assert_eq!(pad_array(&[0u8; 15], 15, 8).len(), 23);
        assert_eq!(pad_array(&vec![0u8; 2 * 15 + 8 - 1], 15, 8).len(), 2 * 15 + 8);
    }

    #[test]
    fn padding_never_truncates() {
        let long = vec![0u8; 100];
        assert_eq!(pad_array(&long, 15, 8).len(), 100);
    }

    #[test]
    fn xor_vector() {
        assert_eq!(xor_array(&[1, 2, 3, 4], &[0, 2, 0, 0], 0), vec![1, 0, 3, 4]);
        assert_eq!(xor_array(&[1, 2, 3, 4], &[0, 1, 0, 0], 1), vec![0, 2, 3, 4]);
    }

    #[test]
    fn xor_wraps_short_key() {
        assert_eq!(xor_array(&[1, 2, 3, 4], &[0, 0, 0, 0, 1, 2, 3, 4], 0), vec![1, 2, 3, 4]);
    }

    #[test]
    fn crypt_data_is_involution() {
        let key = [0u8; 16];
        let data = [1, 2, 3, 4];
        let ciphered = crypt_data(&data, 1, 0, 1, &key);
        assert_eq!(ciphered.len(), data.len());
        let deciphered = crypt_data(&ciphered, 1, 0, 1, &key);
        assert_eq!(deciphered, data);
    }

    #[test]
    fn decrypt_body_roundtrip() {
        let key = [0x42u8; 16];
        let body = b"open the door!!".to_vec();
        let env = encrypt_body(&body, 0x87, 0xABCD_EF01_2345_6789, 7, &key);
        let padded_body = pad_array(&body, 15, 8);
        let recovered = decrypt_body(&env.cipher_body, &env.tag, 0x87, env.counter, 0xABCD_EF01_2345_6789, &key)
            .expect("tag should verify");
        assert_eq!(recovered, padded_body);
    }

    #[test]
    fn decrypt_body_rejects_bad_tag() {
        let key = [0x42u8; 16];
        let env = encrypt_body(&[0x02], 0x87, 1, 1, &key);
        let mut bad_tag = env.tag;
        bad_tag[0] ^= 0xFF;
        assert!(decrypt_body(&env.cipher_body, &bad_tag, 0x87, env.counter, 1, &key).is_none());
    }

    proptest::proptest! {
        /// `crypt_data` is its own inverse for any key, nonce inputs, and
        /// plaintext, since it is a keystream XOR.
        #[test]
        fn crypt_data_is_involution_for_any_input(
            key: [u8; 16],
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..200),
            message_type_id: u8,
            peer_nonce: u64,
            counter: u16,
        ) {
            let ciphered = crypt_data(&data, message_type_id, peer_nonce, counter, &key);
            proptest::prop_assert_eq!(ciphered.len(), data.len());
            let deciphered = crypt_data(&ciphered, message_type_id, peer_nonce, counter, &key);
            proptest::prop_assert_eq!(deciphered, data);
        }

        /// A body encrypted with `encrypt_body` always decrypts back to its
        /// padded form under the same key and nonce inputs.
        #[test]
        fn encrypt_then_decrypt_body_roundtrips(
            key: [u8; 16],
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64),
            message_type_id: u8,
            peer_nonce: u64,
        ) {
            let env = encrypt_body(&body, message_type_id, peer_nonce, 1, &key);
            let padded_body = pad_array(&body, 15, 8);
            let recovered = decrypt_body(&env.cipher_body, &env.tag, message_type_id, env.counter, peer_nonce, &key);
            proptest::prop_assert_eq!(recovered, Some(padded_body));
        }
    }
}
