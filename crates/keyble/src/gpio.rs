//! The optional GPIO close-button watcher (§6), feature-gated behind
//! `gpio` since GPIO access is Linux-SBC-specific and does not build
//! elsewhere.
//!
//! Grounded on `original_source/contrib/close_button_watcher.py`: poll an
//! input pin, and on a rising edge run `lock` directly (bypassing MQTT
//! entirely, matching the reference script's direct GPIO.output pulse
//! rather than going through its own `mosquitto_pub` call) while pulsing an
//! output pin to drive a physical door-closer. `rppal` replaces
//! `RPi.GPIO` as the idiomatic Rust crate for this (it is the crate
//! SPEC_FULL.md's ambient stack names and what Rust SBC GPIO code reaches
//! for generally, e.g. `rppal::gpio::Gpio`).

use std::thread;
use std::time::Duration;

use rppal::gpio::{Gpio, Level};
use tracing::{info, warn};

use crate::facade::Facade;

/// Matches the reference script's 0.1s poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Matches the reference script's 20 half-second pulses (`0.25s` high,
/// `0.25s` low, repeated 20 times) used to drive the door-closer relay.
const PULSE_COUNT: usize = 20;
const PULSE_HALF_PERIOD: Duration = Duration::from_millis(250);

/// Runs the watcher until the process is killed: polls `button_pin` for a
/// rising edge, then runs `lock` against `mac` and pulses `closer_pin`.
pub fn run(facade: &Facade, mac: &str, button_pin: u8, closer_pin: u8) -> anyhow::Result<()> {
    let gpio = Gpio::new()?;
    let button = gpio.get(button_pin)?.into_input();
    let mut closer = gpio.get(closer_pin)?.into_output_low();

    let mut was_high = false;
    loop {
        let is_high = button.read() == Level::High;
        if is_high && !was_high {
            info!(mac, "close button pressed");
            if let Err(e) = facade.lock(mac) {
                warn!(error = %e, "lock operation failed after button press");
            }
            pulse(&mut closer);
        }
        was_high = is_high;
        thread::sleep(POLL_INTERVAL);
    }
}

fn pulse(pin: &mut rppal::gpio::OutputPin) {
    for _ in 0..PULSE_COUNT {
        pin.set_high();
        thread::sleep(PULSE_HALF_PERIOD);
        pin.set_low();
        thread::sleep(PULSE_HALF_PERIOD);
    }
}
