//! Command-line surface, mirroring the reference `argparse` flag set
//! (§6) plus the additive config/timeout/mqtt/gpio flags from the
//! ambient stack section of SPEC_FULL.md.

use std::path::PathBuf;

use clap::Parser;

/// A single flat flag set, subcommand-free, matching the reference
/// implementation's `argparse` shape.
#[derive(Debug, Parser)]
#[command(name = "keyble", about = "Control a KEY-BLE door lock over Bluetooth LE")]
pub struct Cli {
    /// Scan for KEY-BLE devices for 10 seconds and list their addresses.
    #[arg(long)]
    pub scan: bool,

    /// Target device MAC address.
    #[arg(long)]
    pub device: Option<String>,

    /// Ask the lock for its bootloader/application version.
    #[arg(long)]
    pub discover: bool,

    /// The user id registered with the lock.
    #[arg(long = "user-id")]
    pub user_id: Option<u8>,

    /// The user key, 32 hex characters (16 bytes).
    #[arg(long = "user-key")]
    pub user_key: Option<String>,

    /// Read and print the lock's current state.
    #[arg(long)]
    pub status: bool,

    /// Unlock and open the door.
    #[arg(long)]
    pub open: bool,

    /// Lock the door.
    #[arg(long)]
    pub lock: bool,

    /// Unlock the door.
    #[arg(long)]
    pub unlock: bool,

    /// Register a new user with the lock. Requires `--qrdata`.
    #[arg(long)]
    pub register: bool,

    /// Optional display name to register alongside the new user.
    #[arg(long = "user-name")]
    pub user_name: Option<String>,

    /// The QR code payload: `M<mac>K<cardkey><serial>`.
    #[arg(long)]
    pub qrdata: Option<String>,

    /// Raise the log filter from `error` to `debug`.
    #[arg(long)]
    pub verbose: bool,

    /// Load defaults for device/user-id/user-key/mqtt-broker/timeout from
    /// a TOML file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Per-operation timeout in seconds. Defaults to 10.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Run the MQTT bridge instead of a one-shot command.
    #[arg(long)]
    pub mqtt: bool,

    /// MQTT broker address, `host:port`. Required with `--mqtt`.
    #[arg(long = "mqtt-broker")]
    pub mqtt_broker: Option<String>,

    /// Run the GPIO close-button watcher on this input pin alongside the
    /// MQTT bridge. Linux only, requires the `gpio` feature.
    #[arg(long = "gpio-close-button")]
    pub gpio_close_button: Option<u8>,
}
