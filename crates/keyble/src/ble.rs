//! The real BLE adapter: a [`keyble_proto::Transport`] backed by `btleplug`,
//! a cross-platform host BLE stack. Gated behind the `ble-transport`
//! feature so the rest of the crate (and all of `keyble-proto`) stays
//! testable without any Bluetooth hardware or permissions.
//!
//! `btleplug`'s API is asynchronous; this adapter owns a small current-thread
//! Tokio runtime and blocks on it for every call, since [`keyble_proto::lower::LowerLayer`]
//! expects a synchronous [`Transport`]. This mirrors the reference Linux
//! binding's own choice to hide an event-driven I/O model (there, epoll;
//! here, an async reactor) behind a blocking call surface.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use keyble_proto::codec::FRAGMENT_LEN;
use keyble_proto::error::{Result, TransportError};
use keyble_proto::transport::{DiscoveredDevice, Transport, RECV_CHARACTERISTIC_UUID, SEND_CHARACTERISTIC_UUID, SERVICE_UUID};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use uuid::Uuid;

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("protocol UUID constants are well-formed")
}

/// Local advertised name a KEY-BLE lock filters scans by.
const LOCAL_NAME: &str = "KEY-BLE";

struct Connection {
    peripheral: Peripheral,
    send_char: btleplug::api::Characteristic,
    notifications: mpsc::UnboundedReceiver<[u8; FRAGMENT_LEN]>,
}

/// A [`Transport`] backed by a real BLE adapter on this host.
pub struct BleTransport {
    runtime: Runtime,
    adapter: Adapter,
    connection: Option<Connection>,
}

impl BleTransport {
    /// Picks the host's first available BLE adapter. Errors if none is
    /// present (no Bluetooth hardware, or the `bluetoothd`/CoreBluetooth/
    /// WinRT stack is unavailable).
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| TransportError::Connect { mac: String::new(), reason: e.to_string() })?;
        let adapter = runtime.block_on(async {
            let manager = Manager::new().await.map_err(|e| e.to_string())?;
            let adapters = manager.adapters().await.map_err(|e| e.to_string())?;
            adapters.into_iter().next().ok_or_else(|| "no BLE adapter present on this host".to_string())
        });
        let adapter = adapter.map_err(|reason| TransportError::Connect { mac: String::new(), reason })?;
        Ok(Self { runtime, adapter, connection: None })
    }

    async fn find_by_mac(adapter: &Adapter, mac: &str) -> std::result::Result<Peripheral, String> {
        for peripheral in adapter.peripherals().await.map_err(|e| e.to_string())? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties.address.to_string().eq_ignore_ascii_case(mac) {
                    return Ok(peripheral);
                }
            }
        }
        Err(format!("no peripheral advertising address {mac} was found; run --scan first"))
    }
}

impl Transport for BleTransport {
    fn connect(&mut self, mac: &str) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            self.runtime.block_on(connection.peripheral.disconnect()).ok();
        }

        let adapter = self.adapter.clone();
        let mac = mac.to_string();
        let result = self.runtime.block_on(async move {
            adapter.start_scan(ScanFilter::default()).await.map_err(|e| e.to_string())?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            adapter.stop_scan().await.map_err(|e| e.to_string())?;

            let peripheral = Self::find_by_mac(&adapter, &mac).await?;
            peripheral.connect().await.map_err(|e| e.to_string())?;
            peripheral.discover_services().await.map_err(|e| e.to_string())?;

            let characteristics = peripheral.characteristics();
            let send_char = characteristics
                .iter()
                .find(|c| c.uuid == parse_uuid(SEND_CHARACTERISTIC_UUID))
                .cloned()
                .ok_or_else(|| "lock did not expose the expected send characteristic".to_string())?;
            let recv_char = characteristics
                .iter()
                .find(|c| c.uuid == parse_uuid(RECV_CHARACTERISTIC_UUID))
                .cloned()
                .ok_or_else(|| "lock did not expose the expected recv characteristic".to_string())?;

            peripheral.subscribe(&recv_char).await.map_err(|e| e.to_string())?;

            let (tx, rx) = mpsc::unbounded_channel();
            let mut notification_stream = peripheral.notifications().await.map_err(|e| e.to_string())?;
            let recv_uuid = recv_char.uuid;
            tokio::spawn(async move {
                while let Some(event) = notification_stream.next().await {
                    if event.uuid != recv_uuid || event.value.len() != FRAGMENT_LEN {
                        continue;
                    }
                    let mut frame = [0u8; FRAGMENT_LEN];
                    frame.copy_from_slice(&event.value);
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            Ok::<_, String>((peripheral, send_char, rx))
        });

        let (peripheral, send_char, notifications) =
            result.map_err(|reason| TransportError::Connect { mac: mac.clone(), reason })?;
        self.connection = Some(Connection { peripheral, send_char, notifications });
        Ok(())
    }

    fn write(&mut self, frame: &[u8; FRAGMENT_LEN]) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        let frame = *frame;
        self.runtime
            .block_on(connection.peripheral.write(&connection.send_char, &frame, WriteType::WithResponse))
            .map_err(|e| TransportError::Write(e.to_string()).into())
    }

    fn wait_for_notification(&mut self, timeout: Duration) -> Result<Option<[u8; FRAGMENT_LEN]>> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(self.runtime.block_on(async {
            tokio::time::timeout(timeout, connection.notifications.recv()).await.ok().flatten()
        }))
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            self.runtime.block_on(connection.peripheral.disconnect()).ok();
        }
        Ok(())
    }

    fn scan(&mut self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let adapter = self.adapter.clone();
        self.runtime.block_on(async move {
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(|e| TransportError::Scan(e.to_string()))?;
            tokio::time::sleep(duration).await;
            adapter.stop_scan().await.map_err(|e| TransportError::Scan(e.to_string()))?;

            let mut devices = Vec::new();
            for peripheral in adapter.peripherals().await.map_err(|e| TransportError::Scan(e.to_string()))? {
                if let Ok(Some(properties)) = peripheral.properties().await {
                    if properties.local_name.as_deref() == Some(LOCAL_NAME) {
                        devices.push(DiscoveredDevice { mac: properties.address.to_string(), local_name: properties.local_name });
                    }
                }
            }
            Ok(devices)
        })
    }
}
