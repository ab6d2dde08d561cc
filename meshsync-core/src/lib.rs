//! Core library for syncing with Meshtastic radios over Bluetooth LE
//!
//! This crate provides the client side of the radio protocol: link management,
//! frame encoding, the configuration handshake, reconciliation of everything the
//! radio reports into a local node store, and admin commands.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod message;
pub mod position;
pub mod reconcile;
pub mod settings;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigKind, ConfigSection, ModuleKind, SectionKind};
pub use connection::{ConnectionManager, SyncEvent};
pub use error::{Result, SyncError};
pub use handshake::HandshakePhase;
pub use settings::SyncSettings;
pub use store::{JsonFileBackend, MemoryBackend, Store, StoreBackend};
pub use transport::{LinkEvent, LinkState, RadioHandle, RadioLink, RadioTransport, SimulatedRadio};

// Re-export meshtastic types for convenience
pub use meshtastic::{Message, protobufs};

#[cfg(test)]
mod tests;
