use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConfigSections;

/// Everything the client knows about the mesh, as persisted by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshModel {
    pub nodes: BTreeMap<u32, Node>,
    pub messages: Vec<MessageRecord>,
    pub channels: Vec<ChannelRecord>,
    /// Node number of the radio we are (or were last) connected to.
    pub my_node_num: Option<u32>,
}

impl MeshModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, num: u32) -> Option<&Node> {
        self.nodes.get(&num)
    }

    pub fn my_node(&self) -> Option<&Node> {
        self.my_node_num.and_then(|num| self.nodes.get(&num))
    }

    pub fn get_node_by_id(&self, node_id: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.id() == node_id || n.user.as_ref().is_some_and(|u| u.id == node_id))
    }

    pub fn messages_for(&self, num: u32) -> impl Iterator<Item = &MessageRecord> {
        self.messages
            .iter()
            .filter(move |m| m.from == num || m.to == num)
    }

    pub fn channel(&self, index: u32) -> Option<&ChannelRecord> {
        self.channels.iter().find(|c| c.index == index)
    }
}

/// A radio on the mesh, keyed by its 32-bit node number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub num: u32,
    pub user: Option<User>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    /// Only populated for the radio the client is connected to.
    pub my_info: Option<MyNodeInfo>,
    pub positions: Vec<Position>,
    pub telemetry: Vec<TelemetrySample>,
    pub config: ConfigSections,
}

impl Node {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            user: None,
            last_heard: None,
            snr: None,
            my_info: None,
            positions: Vec::new(),
            telemetry: Vec::new(),
            config: ConfigSections::default(),
        }
    }

    /// Meshtastic-style node id, e.g. `!a1b2c3d4`.
    pub fn id(&self) -> String {
        format!("!{:08x}", self.num)
    }

    pub fn display_name(&self) -> String {
        self.user
            .as_ref()
            .filter(|u| !u.long_name.is_empty())
            .map(|u| u.long_name.clone())
            .unwrap_or_else(|| self.id())
    }

    pub fn latest_position(&self) -> Option<&Position> {
        self.positions.last()
    }

    pub fn latest_telemetry(&self) -> Option<&TelemetrySample> {
        self.telemetry.last()
    }

    pub(crate) fn heard(&mut self, at: DateTime<Utc>, snr: Option<f32>) {
        self.last_heard = Some(at);
        if snr.is_some() {
            self.snr = snr;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: String,
    /// Hex encoded, empty when the radio did not report one.
    pub macaddr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyNodeInfo {
    pub node_num: u32,
    pub reboot_count: u32,
    pub min_app_version: u32,
    pub device_id: String,
    pub firmware_version: Option<String>,
}

/// A single GPS fix. Coordinates are in 1e-7 degrees, as on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: Option<i32>,
    pub sats_in_view: u32,
    pub ground_speed: Option<u32>,
    pub ground_track: Option<u32>,
    pub seq_number: u32,
    pub snr: Option<f32>,
    pub time: DateTime<Utc>,
}

impl Position {
    pub fn latitude(&self) -> f64 {
        self.latitude_i as f64 / 1e7
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_i as f64 / 1e7
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub time: DateTime<Utc>,
    pub device_metrics: Option<DeviceMetrics>,
    pub environment_metrics: Option<EnvironmentMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentMetrics {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub gas_resistance: Option<f32>,
    pub iaq: Option<u32>,
    pub lux: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    /// Inbound message, nothing to acknowledge.
    Received,
    /// Sent by us, waiting for a routing acknowledgement.
    Pending,
    Acknowledged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
    pub rx_time: DateTime<Utc>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub index: u32,
    pub name: String,
    pub role: String,
    pub has_psk: bool,
}
