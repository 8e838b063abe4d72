//! Thin orchestration layer (§4.F): validates hex-encoded keys, parses QR
//! payloads, and drives a [`Session`] on a dedicated I/O worker thread.
//!
//! The caller thread never touches the transport directly. It enqueues a
//! [`Command`] on a control channel and blocks on a per-call reply channel,
//! mirroring the split between `EventExpecter` (caller side) and
//! `EventProcessor` (worker side) in the teacher's HCI event layer — except
//! the reply here is a blocking `recv` rather than a polled `Future`, since
//! the session FSM underneath is itself synchronous (§5).

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use keyble_proto::codec::LockState;
use keyble_proto::error::{ConfigError, Result};
use keyble_proto::transport::DiscoveredDevice;
use keyble_proto::{DeviceInfo, Session, Transport};

/// The reference CLI's `scan()` inquiry window.
pub const SCAN_DURATION: Duration = Duration::from_secs(10);

enum Command {
    Scan { duration: Duration, reply: mpsc::Sender<Result<Vec<DiscoveredDevice>>> },
    Discover { mac: String, reply: mpsc::Sender<Result<DeviceInfo>> },
    Pair { mac: String, card_key: [u8; 16], new_user_key: [u8; 16], reply: mpsc::Sender<Result<u8>> },
    SetUserName { mac: String, name: String, reply: mpsc::Sender<Result<()>> },
    Status { mac: String, reply: mpsc::Sender<Result<LockState>> },
    Lock { mac: String, reply: mpsc::Sender<Result<()>> },
    Unlock { mac: String, reply: mpsc::Sender<Result<()>> },
    Open { mac: String, reply: mpsc::Sender<Result<()>> },
    Shutdown,
}

/// Owns the I/O worker thread and the control queue that feeds it. One
/// `Facade` talks to exactly one `Session`, which talks to exactly one
/// transport connection at a time.
pub struct Facade {
    control: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Facade {
    /// Spawns the worker thread, moving `transport` onto it. The caller
    /// thread gets back only the control handle.
    pub fn spawn<T: Transport + 'static>(
        transport: T,
        user_id: u8,
        user_key: Option<[u8; 16]>,
        local_nonce: u64,
        timeout: Duration,
    ) -> Self {
        let (control, rx) = mpsc::channel::<Command>();
        let worker = thread::spawn(move || {
            let mut session = Session::new(transport, user_id, user_key, local_nonce, timeout);
            Self::serve(&mut session, rx);
        });
        Self { control, worker: Some(worker) }
    }

    /// The worker's whole life: service control records until told to stop
    /// or the caller side has dropped the control channel.
    fn serve<T: Transport>(session: &mut Session<T>, rx: mpsc::Receiver<Command>) {
        for command in rx {
            match command {
                Command::Scan { duration, reply } => drop(reply.send(session.scan(duration))),
                Command::Discover { mac, reply } => drop(reply.send(session.discover(&mac))),
                Command::Pair { mac, card_key, new_user_key, reply } => {
                    drop(reply.send(session.pair(&mac, &card_key, &new_user_key)))
                }
                Command::SetUserName { mac, name, reply } => drop(reply.send(session.set_user_name(&mac, &name))),
                Command::Status { mac, reply } => drop(reply.send(session.status(&mac))),
                Command::Lock { mac, reply } => drop(reply.send(session.lock(&mac))),
                Command::Unlock { mac, reply } => drop(reply.send(session.unlock(&mac))),
                Command::Open { mac, reply } => drop(reply.send(session.open(&mac))),
                Command::Shutdown => break,
            }
        }
    }

    fn call<R>(&self, build: impl FnOnce(mpsc::Sender<Result<R>>) -> Command) -> Result<R> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.control.send(build(reply_tx)).expect("I/O worker thread has exited");
        reply_rx.recv().expect("I/O worker thread dropped its reply sender without answering")
    }

    pub fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.call(|reply| Command::Scan { duration, reply })
    }

    pub fn discover(&self, mac: &str) -> Result<DeviceInfo> {
        self.call(|reply| Command::Discover { mac: mac.to_string(), reply })
    }

    pub fn pair(&self, mac: &str, card_key: &[u8; 16], new_user_key: &[u8; 16]) -> Result<u8> {
        self.call(|reply| Command::Pair { mac: mac.to_string(), card_key: *card_key, new_user_key: *new_user_key, reply })
    }

    pub fn set_user_name(&self, mac: &str, name: &str) -> Result<()> {
        self.call(|reply| Command::SetUserName { mac: mac.to_string(), name: name.to_string(), reply })
    }

    pub fn status(&self, mac: &str) -> Result<LockState> {
        self.call(|reply| Command::Status { mac: mac.to_string(), reply })
    }

    pub fn lock(&self, mac: &str) -> Result<()> {
        self.call(|reply| Command::Lock { mac: mac.to_string(), reply })
    }

    pub fn unlock(&self, mac: &str) -> Result<()> {
        self.call(|reply| Command::Unlock { mac: mac.to_string(), reply })
    }

    pub fn open(&self, mac: &str) -> Result<()> {
        self.call(|reply| Command::Open { mac: mac.to_string(), reply })
    }
}

impl Drop for Facade {
    fn drop(&mut self) {
        let _ = self.control.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Decodes a 32-hex-character key, rejecting anything that isn't exactly 16
/// bytes once decoded.
pub fn parse_key(hex_str: &str) -> std::result::Result<[u8; 16], ConfigError> {
    let bytes = hex::decode(hex_str).map_err(|e| ConfigError::BadHex(e.to_string()))?;
    if bytes.len() != 16 {
        return Err(ConfigError::WrongKeyLength(bytes.len()));
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(key)
}
