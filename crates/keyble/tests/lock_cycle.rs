//! End-to-end exercise of the protocol core against an in-process simulated
//! lock: discover, pair, read status, then lock/unlock/open, all through
//! `keyble_proto::Session` driving `MemoryTransport` (no real BLE hardware
//! or I/O worker thread involved).

use std::time::Duration;

use keyble_proto::codec::LockState;
use keyble_proto::transport::MemoryTransport;
use keyble_proto::Session;

const MAC: &str = "AA:BB:CC:DD:EE:FF";
const TIMEOUT: Duration = Duration::from_millis(200);

#[test]
fn discover_pair_status_lock_unlock_open_cycle() {
    let card_key = [0x5Au8; 16];
    let user_key = [0xA5u8; 16];

    let mut session = Session::new(MemoryTransport::unpaired(card_key, 0xC0FFEE), 0xFF, None, 1, TIMEOUT);

    let info = session.discover(MAC).expect("discover should succeed before pairing");
    assert_eq!(info.bootloader, 0x01);
    assert_eq!(info.application, 0x02);

    let user_id = session.pair(MAC, &card_key, &user_key).expect("pairing should be accepted");
    assert_eq!(session.user_id(), user_id);
    assert_ne!(user_id, 0xFF, "the lock should assign a real id rather than the pairing sentinel");

    assert_eq!(session.status(MAC).unwrap(), LockState::Locked, "a freshly paired lock starts locked");

    session.unlock(MAC).expect("unlock should be accepted with the freshly paired key");
    assert_eq!(session.status(MAC).unwrap(), LockState::Unlocked);

    session.open(MAC).expect("open should be accepted");
    assert_eq!(session.status(MAC).unwrap(), LockState::Open);

    session.lock(MAC).expect("lock should be accepted");
    assert_eq!(session.status(MAC).unwrap(), LockState::Locked);
}

#[test]
fn commands_are_rejected_before_pairing() {
    let mut session = Session::new(MemoryTransport::unpaired([0x11u8; 16], 1), 0xFF, None, 1, TIMEOUT);
    assert!(session.status(MAC).is_err(), "no user key yet, so a secured exchange cannot be composed");
}

#[test]
fn reconnecting_with_a_fresh_session_resets_counters() {
    let card_key = [0x2Bu8; 16];
    let user_key = [0x3Cu8; 16];

    let mut pairing_session = Session::new(MemoryTransport::unpaired(card_key, 7), 0xFF, None, 1, TIMEOUT);
    let user_id = pairing_session.pair(MAC, &card_key, &user_key).unwrap();
    drop(pairing_session);

    // A later process re-launching the CLI with the now-paired credentials
    // reconnects from scratch; the simulated lock is long-lived across that
    // boundary, a fresh `Session`/nonce is not.
    let mut session = Session::new(MemoryTransport::paired(card_key, user_id, user_key, 7), user_id, Some(user_key), 1, TIMEOUT);
    session.lock(MAC).unwrap();
    assert_eq!(session.status(MAC).unwrap(), LockState::Locked);
}
