//! In-process radio for tests and `--simulate`.
//!
//! The [`SimulatedRadio`] is handed to the connection manager like any other
//! transport; the matching [`RadioHandle`] stays with the test (or the CLI) and
//! plays the radio's side: advertising, queueing FROMRADIO values, dropping the
//! link and inspecting what was written to TORADIO.

use async_trait::async_trait;
use meshtastic::Message as ProstMessage;
use meshtastic::protobufs;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{LinkEvent, LinkId, LinkRegistry, LinkState, RadioLink, RadioTransport};
use crate::error::{ConnectionError, TransportError, WriteError};
use crate::message::BROADCAST_ADDR;

struct SimState {
    powered: bool,
    scanning: bool,
    /// Radios currently in range.
    in_range: Vec<(LinkId, Option<String>, Option<i16>)>,
    registry: LinkRegistry,
    connected: Option<LinkId>,
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<protobufs::ToRadio>,
    write_failure: Option<String>,
    toradio_missing: bool,
    reject_reason: Option<String>,
    /// Streamed in reply to `want_config_id`.
    config_script: Vec<protobufs::FromRadio>,
    complete_config: bool,
    /// Answer every `want_ack` packet with a routing ack.
    auto_ack: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            powered: true,
            scanning: false,
            in_range: Vec::new(),
            registry: LinkRegistry::new(),
            connected: None,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            write_failure: None,
            toradio_missing: false,
            reject_reason: None,
            config_script: Vec::new(),
            complete_config: true,
            auto_ack: false,
        }
    }

    fn drop_link(&mut self, events: &mut Vec<LinkEvent>) {
        if let Some(id) = self.connected.take() {
            self.registry.set_state(&id, LinkState::Disconnected);
            self.inbound.clear();
            events.push(LinkEvent::Disconnected(id));
        }
    }
}

async fn publish(tx: &mpsc::Sender<LinkEvent>, events: Vec<LinkEvent>) {
    for event in events {
        // The manager may already be gone.
        let _ = tx.send(event).await;
    }
}

pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: Option<mpsc::Receiver<LinkEvent>>,
}

impl SimulatedRadio {
    pub fn new(event_capacity: usize) -> (Self, RadioHandle) {
        let (events_tx, events_rx) = mpsc::channel(event_capacity);
        let state = Arc::new(Mutex::new(SimState::new()));
        let handle = RadioHandle {
            state: state.clone(),
            events_tx: events_tx.clone(),
        };
        let radio = Self {
            state,
            events_tx,
            events_rx: Some(events_rx),
        };
        (radio, handle)
    }
}

#[async_trait]
impl RadioTransport for SimulatedRadio {
    async fn start_scan(&mut self) -> Result<(), TransportError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if !state.powered {
                return Err(ConnectionError::AdapterOff.into());
            }
            state.scanning = true;
            let in_range = state.in_range.clone();
            for (id, name, rssi) in in_range {
                let link = state.registry.discovered(&id, name.as_deref(), rssi);
                events.push(LinkEvent::Discovered(link));
            }
        }
        publish(&self.events_tx, events).await;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.state.lock().await.scanning = false;
        Ok(())
    }

    async fn connect(&mut self, link: &LinkId) -> Result<(), TransportError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock().await;
            if !state.powered {
                Err(ConnectionError::AdapterOff)
            } else if !state.in_range.iter().any(|(id, _, _)| id == link) {
                Err(ConnectionError::LinkNotFound(link.clone()))
            } else if let Some(reason) = state.reject_reason.clone() {
                Err(ConnectionError::Rejected {
                    link: link.clone(),
                    reason,
                })
            } else {
                state.drop_link(&mut events);
                if state.registry.get(link).is_none() {
                    let (id, name, rssi) = state
                        .in_range
                        .iter()
                        .find(|(id, _, _)| id == link)
                        .cloned()
                        .unwrap_or_else(|| (link.clone(), None, None));
                    state.registry.discovered(&id, name.as_deref(), rssi);
                }
                state.registry.set_state(link, LinkState::Connected);
                state.connected = Some(link.clone());
                events.push(LinkEvent::Connected(link.clone()));
                Ok(())
            }
        };
        publish(&self.events_tx, events).await;
        result.map_err(TransportError::from)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut events = Vec::new();
        self.state.lock().await.drop_link(&mut events);
        publish(&self.events_tx, events).await;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.connected.is_none() {
                return Err(ConnectionError::NotConnected.into());
            }
            if state.toradio_missing {
                return Err(WriteError::CharacteristicUnavailable.into());
            }
            if let Some(reason) = state.write_failure.clone() {
                return Err(WriteError::Failed(reason).into());
            }

            let to_radio = protobufs::ToRadio::decode(bytes)
                .map_err(|e| WriteError::Failed(format!("radio rejected frame: {e}")))?;

            if let Some(protobufs::to_radio::PayloadVariant::WantConfigId(id)) =
                &to_radio.payload_variant
            {
                let id = *id;
                debug!("Simulated radio streaming config for request {id}");
                let script: Vec<Vec<u8>> = state
                    .config_script
                    .iter()
                    .map(|f| f.encode_to_vec())
                    .collect();
                state.inbound.extend(script);
                if state.complete_config {
                    state.inbound.push_back(config_complete(id).encode_to_vec());
                }
            }

            if let Some(protobufs::to_radio::PayloadVariant::Packet(packet)) =
                &to_radio.payload_variant
                && packet.want_ack
                && state.auto_ack
            {
                state.inbound.push_back(routing_ack(packet).encode_to_vec());
                events.push(LinkEvent::DataAvailable);
            }

            state.sent.push(to_radio);
        }
        publish(&self.events_tx, events).await;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.state.lock().await;
        if state.connected.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(state.inbound.pop_front())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events_rx.take()
    }

    async fn links(&self) -> Vec<RadioLink> {
        self.state.lock().await.registry.list()
    }

    async fn connected(&self) -> Option<LinkId> {
        self.state.lock().await.connected.clone()
    }
}

/// The radio's side of a [`SimulatedRadio`].
#[derive(Clone)]
pub struct RadioHandle {
    state: Arc<Mutex<SimState>>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl RadioHandle {
    /// Bring a radio into range; announced immediately while scanning.
    pub async fn advertise(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            let entry = (id.to_string(), name.map(str::to_string), rssi);
            match state.in_range.iter_mut().find(|(known, _, _)| known == id) {
                Some(existing) => *existing = entry,
                None => state.in_range.push(entry),
            }
            if state.scanning && state.powered {
                let link = state.registry.discovered(id, name, rssi);
                events.push(LinkEvent::Discovered(link));
            }
        }
        publish(&self.events_tx, events).await;
    }

    /// Take a radio out of range, dropping the link if it was connected.
    pub async fn vanish(&self, id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.in_range.retain(|(known, _, _)| known != id);
            if state.connected.as_deref() == Some(id) {
                state.drop_link(&mut events);
            }
            state.registry.remove(id);
        }
        publish(&self.events_tx, events).await;
    }

    pub async fn set_powered(&self, powered: bool) {
        let mut events = vec![LinkEvent::AdapterStateChanged { powered }];
        {
            let mut state = self.state.lock().await;
            state.powered = powered;
            if !powered {
                state.scanning = false;
                state.drop_link(&mut events);
            }
        }
        publish(&self.events_tx, events).await;
    }

    /// Queue a FROMRADIO value and notify FROMNUM.
    pub async fn push(&self, from_radio: protobufs::FromRadio) {
        self.push_raw(from_radio.encode_to_vec()).await;
    }

    pub async fn push_raw(&self, bytes: Vec<u8>) {
        let connected = {
            let mut state = self.state.lock().await;
            state.inbound.push_back(bytes);
            state.connected.is_some()
        };
        if connected {
            publish(&self.events_tx, vec![LinkEvent::DataAvailable]).await;
        }
    }

    /// Drop the link from the radio's side.
    pub async fn drop_connection(&self) {
        let mut events = Vec::new();
        self.state.lock().await.drop_link(&mut events);
        publish(&self.events_tx, events).await;
    }

    /// Frames the client wrote, oldest first.
    pub async fn sent(&self) -> Vec<protobufs::ToRadio> {
        self.state.lock().await.sent.clone()
    }

    pub async fn fail_writes(&self, reason: Option<&str>) {
        self.state.lock().await.write_failure = reason.map(str::to_string);
    }

    pub async fn hide_toradio(&self, hidden: bool) {
        self.state.lock().await.toradio_missing = hidden;
    }

    pub async fn reject_connections(&self, reason: Option<&str>) {
        self.state.lock().await.reject_reason = reason.map(str::to_string);
    }

    pub async fn set_config_script(&self, script: Vec<protobufs::FromRadio>) {
        self.state.lock().await.config_script = script;
    }

    pub async fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().await.auto_ack = enabled;
    }

    /// When off the radio streams its script but never sends the completion marker.
    pub async fn set_complete_config(&self, complete: bool) {
        self.state.lock().await.complete_config = complete;
    }
}

fn from_radio(variant: protobufs::from_radio::PayloadVariant) -> protobufs::FromRadio {
    protobufs::FromRadio {
        payload_variant: Some(variant),
        ..Default::default()
    }
}

/// The routing reply a radio sends once `packet` was delivered.
pub fn routing_ack(packet: &protobufs::MeshPacket) -> protobufs::FromRadio {
    let routing = protobufs::Routing {
        variant: Some(protobufs::routing::Variant::ErrorReason(
            protobufs::routing::Error::None as i32,
        )),
        ..Default::default()
    };
    // Broadcasts are acked by the local radio itself.
    let from = if packet.to == BROADCAST_ADDR {
        packet.from
    } else {
        packet.to
    };
    from_radio(protobufs::from_radio::PayloadVariant::Packet(
        protobufs::MeshPacket {
            from,
            to: packet.from,
            id: rand::random::<u32>(),
            channel: packet.channel,
            payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                protobufs::Data {
                    portnum: protobufs::PortNum::RoutingApp as i32,
                    payload: routing.encode_to_vec(),
                    request_id: packet.id,
                    ..Default::default()
                },
            )),
            ..Default::default()
        },
    ))
}

pub fn config_complete(config_id: u32) -> protobufs::FromRadio {
    from_radio(protobufs::from_radio::PayloadVariant::ConfigCompleteId(
        config_id,
    ))
}

/// A plausible configuration stream for a radio numbered `node_num`.
pub fn default_script(node_num: u32, long_name: &str) -> Vec<protobufs::FromRadio> {
    use protobufs::from_radio::PayloadVariant;

    let short_name: String = long_name.chars().take(4).collect();
    let user = protobufs::User {
        id: format!("!{node_num:08x}"),
        long_name: long_name.to_string(),
        short_name,
        macaddr: node_num.to_be_bytes().to_vec(),
        ..Default::default()
    };

    vec![
        from_radio(PayloadVariant::MyInfo(protobufs::MyNodeInfo {
            my_node_num: node_num,
            reboot_count: 1,
            min_app_version: 30200,
            ..Default::default()
        })),
        from_radio(PayloadVariant::Metadata(protobufs::DeviceMetadata {
            firmware_version: "2.5.6.simulated".to_string(),
            ..Default::default()
        })),
        from_radio(PayloadVariant::NodeInfo(protobufs::NodeInfo {
            num: node_num,
            user: Some(user),
            snr: 10.0,
            ..Default::default()
        })),
        from_radio(PayloadVariant::Channel(protobufs::Channel {
            index: 0,
            settings: Some(protobufs::ChannelSettings {
                name: "LongFast".to_string(),
                psk: vec![1],
                ..Default::default()
            }),
            role: protobufs::channel::Role::Primary as i32,
            ..Default::default()
        })),
        from_radio(PayloadVariant::Config(protobufs::Config {
            payload_variant: Some(protobufs::config::PayloadVariant::Device(
                protobufs::config::DeviceConfig {
                    role: protobufs::config::device_config::Role::Client as i32,
                    node_info_broadcast_secs: 10800,
                    ..Default::default()
                },
            )),
        })),
        from_radio(PayloadVariant::Config(protobufs::Config {
            payload_variant: Some(protobufs::config::PayloadVariant::Lora(
                protobufs::config::LoRaConfig {
                    use_preset: true,
                    region: protobufs::config::lo_ra_config::RegionCode::Us as i32,
                    hop_limit: 3,
                    tx_enabled: true,
                    ..Default::default()
                },
            )),
        })),
        from_radio(PayloadVariant::ModuleConfig(protobufs::ModuleConfig {
            payload_variant: Some(protobufs::module_config::PayloadVariant::Mqtt(
                protobufs::module_config::MqttConfig {
                    address: "mqtt.meshtastic.org".to_string(),
                    username: "meshdev".to_string(),
                    ..Default::default()
                },
            )),
        })),
    ]
}
