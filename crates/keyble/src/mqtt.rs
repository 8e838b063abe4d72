//! The optional MQTT command bridge (§6): subscribes to the `door` topic
//! and maps `lock`/`unlock`/`open`/`toggle` payloads onto [`Facade`]
//! operations, serially, one message at a time.
//!
//! Grounded on `original_source/contrib/mqttdoorer/mqttdoorer.py`'s
//! `on_connect`/`on_message`/`ACTIONS` dispatch shape, reworked onto
//! `rumqttc`'s blocking client (the teacher lineage has no MQTT client of
//! its own; `rumqttc` is the crate SPEC_FULL.md's ambient stack names for
//! this). The reference script has no `toggle` action; this bridge adds one
//! per SPEC_FULL.md, tracked with the bridge's own `last_action` field
//! rather than a module-level global (the reference `close_button_watcher.py`
//! has no state at all — it always locks on press — so `toggle`'s
//! start-from-`Lock` default is this crate's own call, made explicit here
//! rather than inherited from a Python global).

use std::time::Duration;

use rumqttc::{Client, Event, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use crate::facade::Facade;

/// Topic the bridge subscribes to; every payload on it is one action.
pub const TOPIC: &str = "door";

/// `toggle`'s own memory only ever alternates between locking and
/// unlocking; `open` is a distinct, non-toggling action (see [`DoorAction`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAction {
    Lock,
    Unlock,
}

/// The concrete facade operation a payload resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoorAction {
    Lock,
    Unlock,
    Open,
}

/// Owns the bridge's `toggle` memory. Starts `None`, which `toggle`
/// resolves to `Lock` first, matching the reference close-button script's
/// lock-on-press default applied to this bridge's own alternation rule.
struct Bridge {
    last_action: Option<LastAction>,
}

impl Bridge {
    fn new() -> Self {
        Self { last_action: None }
    }

    /// Resolves `payload` to the concrete action it should run, advancing
    /// `last_action` for `toggle` (`open` does not participate in the
    /// toggle memory, it is its own action every time). Pure aside from
    /// that one field, so it is unit-testable without a broker or a lock.
    fn resolve(&mut self, payload: &str) -> Option<DoorAction> {
        match payload {
            "lock" => Some(DoorAction::Lock),
            "unlock" => Some(DoorAction::Unlock),
            "open" => Some(DoorAction::Open),
            "toggle" => {
                let next = match self.last_action {
                    Some(LastAction::Lock) => LastAction::Unlock,
                    Some(LastAction::Unlock) | None => LastAction::Lock,
                };
                self.last_action = Some(next);
                Some(match next {
                    LastAction::Lock => DoorAction::Lock,
                    LastAction::Unlock => DoorAction::Unlock,
                })
            }
            _ => None,
        }
    }
}

/// Runs the bridge until the process is killed. Reconnects to the broker
/// with `rumqttc`'s own backoff on connection loss; every processed action
/// and its outcome is logged.
pub fn run(facade: &Facade, mac: &str, broker_host: &str, broker_port: u16) -> anyhow::Result<()> {
    let mut options = MqttOptions::new("keyble-bridge", broker_host, broker_port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut connection) = Client::new(options, 10);
    client.subscribe(TOPIC, QoS::AtLeastOnce)?;

    let mut bridge = Bridge::new();

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                    warn!("received non-utf8 MQTT payload on {}", TOPIC);
                    continue;
                };

                let Some(action) = bridge.resolve(payload) else {
                    warn!(payload, "unknown door action");
                    continue;
                };

                let result = match action {
                    DoorAction::Lock => facade.lock(mac),
                    DoorAction::Unlock => facade.unlock(mac),
                    DoorAction::Open => facade.open(mac),
                };

                match result {
                    Ok(()) => info!(payload, "door action completed"),
                    Err(e) => warn!(payload, error = %e, "door action failed"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, rumqttc will reconnect with backoff");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_open_are_literal() {
        let mut bridge = Bridge::new();
        assert_eq!(bridge.resolve("lock"), Some(DoorAction::Lock));
        assert_eq!(bridge.resolve("unlock"), Some(DoorAction::Unlock));
        assert_eq!(bridge.resolve("open"), Some(DoorAction::Open));
    }

    #[test]
    fn open_does_not_perturb_the_toggle_memory() {
        let mut bridge = Bridge::new();
        bridge.resolve("unlock");
        bridge.resolve("open");
        assert_eq!(bridge.resolve("toggle"), Some(DoorAction::Lock));
    }

    #[test]
    fn unknown_payload_is_ignored() {
        let mut bridge = Bridge::new();
        assert_eq!(bridge.resolve("dance"), None);
    }

    #[test]
    fn toggle_starts_from_lock_and_alternates() {
        let mut bridge = Bridge::new();
        assert_eq!(bridge.resolve("toggle"), Some(DoorAction::Lock));
        assert_eq!(bridge.resolve("toggle"), Some(DoorAction::Unlock));
        assert_eq!(bridge.resolve("toggle"), Some(DoorAction::Lock));
    }

    #[test]
    fn toggle_continues_from_an_explicit_action() {
        let mut bridge = Bridge::new();
        bridge.resolve("unlock");
        assert_eq!(bridge.resolve("toggle"), Some(DoorAction::Lock));
    }
}
