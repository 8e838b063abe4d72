//! The KEY-BLE door lock application protocol: fragmentation and
//! reassembly over 16-byte BLE notifications, a bespoke AES-128 CTR+CBC-MAC
//! authenticated encryption construction, a typed message codec, the
//! session state machine built on top of them, and the [`Transport`]
//! abstraction that keeps this crate free of any concrete BLE stack.
//!
//! Layering, bottom to top: [`crypto`] -> [`codec`] -> [`transport`] ->
//! [`lower`] -> [`session`]. Host binaries depend on this crate for the
//! protocol and bring their own [`Transport`] implementation plus CLI,
//! configuration, and logging.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod lower;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::{DeviceInfo, Session, DEFAULT_TIMEOUT};
pub use transport::{DiscoveredDevice, MemoryTransport, Transport};
