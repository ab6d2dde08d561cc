//! The BLE central side of a radio connection.
//!
//! A [`RadioTransport`] scans, keeps at most one radio connected and moves raw
//! characteristic values in and out. Everything it observes is published, in
//! order, on a single [`LinkEvent`] channel.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[cfg(feature = "bluetooth")]
pub mod ble;
pub mod simulated;

#[cfg(feature = "bluetooth")]
pub use ble::BleTransport;
pub use simulated::{RadioHandle, SimulatedRadio};

/// Meshtastic GATT service.
pub const SERVICE_UUID: &str = "6ba1b218-15a8-461f-9fa8-5dcae273eafd";
/// Host to radio, write.
pub const TORADIO_UUID: &str = "f75c76d2-129e-4dad-a1dd-7866124401e7";
/// Radio to host, read until empty.
pub const FROMRADIO_UUID: &str = "8ba2bcc2-ee02-4a55-a531-c525c5e454d5";
/// Notify: new data is waiting on FROMRADIO.
pub const FROMNUM_UUID: &str = "ed9da18c-a800-4f66-a670-aa7547e34453";

/// Platform identifier of a peripheral.
pub type LinkId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioLink {
    pub id: LinkId,
    pub name: String,
    pub rssi: Option<i16>,
    pub state: LinkState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Discovered(RadioLink),
    Connected(LinkId),
    Disconnected(LinkId),
    /// FROMNUM notified; drain FROMRADIO with [`RadioTransport::read`].
    DataAvailable,
    AdapterStateChanged { powered: bool },
}

#[async_trait]
pub trait RadioTransport: Send + Sync {
    async fn start_scan(&mut self) -> Result<(), TransportError>;
    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    /// Connect to `link`, dropping any radio that is currently connected.
    async fn connect(&mut self, link: &LinkId) -> Result<(), TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write one value to TORADIO.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one value from FROMRADIO; `None` once the radio's queue is empty.
    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// The event stream. Can only be taken once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>>;

    async fn links(&self) -> Vec<RadioLink>;

    async fn connected(&self) -> Option<LinkId>;
}

/// Lets the transport be picked at runtime, e.g. `Box<dyn RadioTransport>`.
#[async_trait]
impl<T: RadioTransport + ?Sized> RadioTransport for Box<T> {
    async fn start_scan(&mut self) -> Result<(), TransportError> {
        (**self).start_scan().await
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        (**self).stop_scan().await
    }

    async fn connect(&mut self, link: &LinkId) -> Result<(), TransportError> {
        (**self).connect(link).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        (**self).disconnect().await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes).await
    }

    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read().await
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        (**self).take_events()
    }

    async fn links(&self) -> Vec<RadioLink> {
        (**self).links().await
    }

    async fn connected(&self) -> Option<LinkId> {
        (**self).connected().await
    }
}

/// Discovered radios, one entry per id.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: Vec<RadioLink>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Repeats refresh name and rssi in place.
    pub fn discovered(&mut self, id: &str, name: Option<&str>, rssi: Option<i16>) -> RadioLink {
        let name = name
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        if let Some(link) = self.links.iter_mut().find(|l| l.id == id) {
            if let Some(name) = name {
                link.name = name;
            }
            if rssi.is_some() {
                link.rssi = rssi;
            }
            return link.clone();
        }

        let link = RadioLink {
            id: id.to_string(),
            name: name.unwrap_or_else(|| "Unknown".to_string()),
            rssi,
            state: LinkState::Discovered,
        };
        self.links.push(link.clone());
        link
    }

    pub fn set_state(&mut self, id: &str, state: LinkState) {
        if let Some(link) = self.links.iter_mut().find(|l| l.id == id) {
            link.state = state;
        }
    }

    pub fn get(&self, id: &str) -> Option<&RadioLink> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn remove(&mut self, id: &str) {
        self.links.retain(|l| l.id != id);
    }

    pub fn list(&self) -> Vec<RadioLink> {
        self.links.clone()
    }
}
