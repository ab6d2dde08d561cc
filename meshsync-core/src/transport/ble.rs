//! btleplug backed transport.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LinkEvent, LinkId, LinkRegistry, LinkState, RadioLink, RadioTransport};
use crate::error::{ConnectionError, TransportError, WriteError};
use crate::settings::SyncSettings;

const SERVICE: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
const TORADIO: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
const FROMRADIO: Uuid = Uuid::from_u128(0x8ba2bcc2_ee02_4a55_a531_c525c5e454d5);
const FROMNUM: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// Adapter power changes the manager cares about; `Unknown` is not one.
fn adapter_event(state: CentralState) -> Option<LinkEvent> {
    match state {
        CentralState::PoweredOn => Some(LinkEvent::AdapterStateChanged { powered: true }),
        CentralState::PoweredOff => Some(LinkEvent::AdapterStateChanged { powered: false }),
        _ => None,
    }
}

struct ActiveLink {
    id: LinkId,
    peripheral: Peripheral,
    toradio: Option<Characteristic>,
    fromradio: Characteristic,
    notify_task: JoinHandle<()>,
}

pub struct BleTransport {
    adapter: Adapter,
    registry: Arc<Mutex<LinkRegistry>>,
    peripherals: Arc<Mutex<HashMap<LinkId, Peripheral>>>,
    scanning: Arc<AtomicBool>,
    active: Option<ActiveLink>,
    active_id: Arc<Mutex<Option<LinkId>>>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: Option<mpsc::Receiver<LinkEvent>>,
    event_pump: JoinHandle<()>,
    connect_timeout: Duration,
}

impl BleTransport {
    /// Open the first Bluetooth adapter and start listening for its events.
    pub async fn new(settings: &SyncSettings) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|_| ConnectionError::AdapterOff)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| ConnectionError::AdapterOff)?
            .into_iter()
            .next()
            .ok_or(ConnectionError::AdapterOff)?;

        let (events_tx, events_rx) = mpsc::channel(settings.event_capacity);
        let registry = Arc::new(Mutex::new(LinkRegistry::new()));
        let peripherals = Arc::new(Mutex::new(HashMap::new()));
        let scanning = Arc::new(AtomicBool::new(false));
        let active_id = Arc::new(Mutex::new(None));

        let mut central_events = adapter
            .events()
            .await
            .map_err(|_| ConnectionError::AdapterOff)?;

        let event_pump = {
            let adapter = adapter.clone();
            let registry = registry.clone();
            let peripherals = peripherals.clone();
            let scanning = scanning.clone();
            let active_id = active_id.clone();
            let tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = central_events.next().await {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            if !scanning.load(Ordering::SeqCst) {
                                continue;
                            }
                            let Ok(peripheral) = adapter.peripheral(&id).await else {
                                continue;
                            };
                            let Ok(Some(props)) = peripheral.properties().await else {
                                continue;
                            };
                            if !props.services.contains(&SERVICE) {
                                continue;
                            }
                            let link_id = id.to_string();
                            peripherals
                                .lock()
                                .await
                                .insert(link_id.clone(), peripheral);
                            let link = registry.lock().await.discovered(
                                &link_id,
                                props.local_name.as_deref(),
                                props.rssi,
                            );
                            let _ = tx.send(LinkEvent::Discovered(link)).await;
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            let link_id = id.to_string();
                            let mut active = active_id.lock().await;
                            if active.as_deref() == Some(link_id.as_str()) {
                                active.take();
                                registry
                                    .lock()
                                    .await
                                    .set_state(&link_id, LinkState::Disconnected);
                                warn!("Radio {link_id} dropped the connection");
                                let _ = tx.send(LinkEvent::Disconnected(link_id)).await;
                            }
                        }
                        CentralEvent::StateUpdate(state) => {
                            let Some(event) = adapter_event(state) else {
                                continue;
                            };
                            if event == (LinkEvent::AdapterStateChanged { powered: false }) {
                                warn!("Bluetooth adapter powered off");
                                scanning.store(false, Ordering::SeqCst);
                                if let Some(link_id) = active_id.lock().await.take() {
                                    registry
                                        .lock()
                                        .await
                                        .set_state(&link_id, LinkState::Disconnected);
                                }
                            }
                            let _ = tx.send(event).await;
                        }
                        _ => {}
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            registry,
            peripherals,
            scanning,
            active: None,
            active_id,
            events_tx,
            events_rx: Some(events_rx),
            event_pump,
            connect_timeout: settings.connect_timeout,
        })
    }

    async fn open_link(
        &self,
        link: &LinkId,
        peripheral: Peripheral,
    ) -> Result<ActiveLink, ConnectionError> {
        let rejected = |reason: String| ConnectionError::Rejected {
            link: link.clone(),
            reason,
        };

        match timeout(self.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(rejected(e.to_string())),
            Err(_) => return Err(rejected("timed out".to_string())),
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| rejected(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();

        let fromradio = find(FROMRADIO)
            .ok_or_else(|| rejected("FROMRADIO characteristic missing".to_string()))?;
        let fromnum = find(FROMNUM)
            .ok_or_else(|| rejected("FROMNUM characteristic missing".to_string()))?;
        let toradio = find(TORADIO);

        peripheral
            .subscribe(&fromnum)
            .await
            .map_err(|e| rejected(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| rejected(e.to_string()))?;

        let tx = self.events_tx.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == FROMNUM
                    && tx.send(LinkEvent::DataAvailable).await.is_err()
                {
                    break;
                }
            }
        });

        Ok(ActiveLink {
            id: link.clone(),
            peripheral,
            toradio,
            fromradio,
            notify_task,
        })
    }

    async fn close_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.notify_task.abort();
            *self.active_id.lock().await = None;
            if let Err(e) = active.peripheral.disconnect().await {
                debug!("Disconnect from {} reported: {e}", active.id);
            }
            self.registry
                .lock()
                .await
                .set_state(&active.id, LinkState::Disconnected);
            let _ = self.events_tx.send(LinkEvent::Disconnected(active.id)).await;
        }
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.event_pump.abort();
        if let Some(active) = &self.active {
            active.notify_task.abort();
        }
    }
}

#[async_trait]
impl RadioTransport for BleTransport {
    async fn start_scan(&mut self) -> Result<(), TransportError> {
        self.scanning.store(true, Ordering::SeqCst);
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE],
            })
            .await
            .map_err(|_| ConnectionError::AdapterOff)?;
        info!("Scanning for Meshtastic radios");
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter
            .stop_scan()
            .await
            .map_err(|_| ConnectionError::AdapterOff)?;
        Ok(())
    }

    async fn connect(&mut self, link: &LinkId) -> Result<(), TransportError> {
        self.close_active().await;

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(link)
            .cloned()
            .ok_or_else(|| ConnectionError::LinkNotFound(link.clone()))?;

        self.registry
            .lock()
            .await
            .set_state(link, LinkState::Connecting);

        match self.open_link(link, peripheral).await {
            Ok(active) => {
                *self.active_id.lock().await = Some(link.clone());
                self.active = Some(active);
                self.registry
                    .lock()
                    .await
                    .set_state(link, LinkState::Connected);
                info!("Connected to radio {link}");
                let _ = self.events_tx.send(LinkEvent::Connected(link.clone())).await;
                Ok(())
            }
            Err(e) => {
                self.registry
                    .lock()
                    .await
                    .set_state(link, LinkState::Disconnected);
                Err(e.into())
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.close_active().await;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let active = self.active.as_ref().ok_or(ConnectionError::NotConnected)?;
        let toradio = active
            .toradio
            .as_ref()
            .ok_or(WriteError::CharacteristicUnavailable)?;
        active
            .peripheral
            .write(toradio, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| WriteError::Failed(e.to_string()))?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let active = self.active.as_ref().ok_or(ConnectionError::NotConnected)?;
        let value = active
            .peripheral
            .read(&active.fromradio)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        Ok((!value.is_empty()).then_some(value))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events_rx.take()
    }

    async fn links(&self) -> Vec<RadioLink> {
        self.registry.lock().await.list()
    }

    /// Cleared by the event pump as soon as the radio or the adapter goes away.
    async fn connected(&self) -> Option<LinkId> {
        self.active_id.lock().await.clone()
    }
}
