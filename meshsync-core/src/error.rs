use thiserror::Error;

/// Why a connection attempt (or an operation needing one) failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Bluetooth adapter is powered off or unavailable")]
    AdapterOff,

    #[error("Radio {0} is no longer in range")]
    LinkNotFound(String),

    #[error("Connection to {link} rejected: {reason}")]
    Rejected { link: String, reason: String },

    #[error("No radio connected")]
    NotConnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("TORADIO characteristic not available")]
    CharacteristicUnavailable,

    #[error("Write failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Read failed: {0}")]
    Read(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed FromRadio frame: {0}")]
    Envelope(String),

    #[error("Malformed {port} payload from {from:08x}: {reason}")]
    Payload {
        port: &'static str,
        from: u32,
        reason: String,
    },

    #[error("Frame length {0} exceeds the maximum of {max}", max = crate::codec::MAX_FRAME_LEN)]
    Oversized(usize),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store backend rejected the save: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No node {0:08x} in the store")]
    UnknownNode(u32),

    #[error("Node {0:08x} has no user profile")]
    MissingUser(u32),

    #[error("Radio has not reported its own node number")]
    NoLocalNode,

    #[error("Radio configuration has not been fully received")]
    NotReady,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("A configuration request is already in progress")]
    AlreadyInProgress,

    #[error("No radio connected")]
    NotConnected,

    #[error("Radio did not finish streaming configuration within {0:?}")]
    TimedOut(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl From<ConnectionError> for SyncError {
    fn from(err: ConnectionError) -> Self {
        SyncError::Transport(err.into())
    }
}

impl From<WriteError> for SyncError {
    fn from(err: WriteError) -> Self {
        SyncError::Transport(err.into())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
