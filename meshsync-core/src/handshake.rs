use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::codec::RadioMessage;
use crate::error::HandshakeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HandshakePhase {
    Idle,
    /// `want_config_id` sent, nothing streamed yet.
    AwaitingConfig,
    Streaming,
    Complete,
}

/// Kinds of message the radio streams in reply to `want_config_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    MyInfo,
    NodeInfo,
    Channel,
    Config,
    ModuleConfig,
    Metadata,
}

impl FragmentKind {
    pub fn of(message: &RadioMessage) -> Option<Self> {
        match message {
            RadioMessage::MyInfo(_) => Some(FragmentKind::MyInfo),
            RadioMessage::NodeInfo(_) => Some(FragmentKind::NodeInfo),
            RadioMessage::Channel(_) => Some(FragmentKind::Channel),
            RadioMessage::Config(_) => Some(FragmentKind::Config),
            RadioMessage::ModuleConfig(_) => Some(FragmentKind::ModuleConfig),
            RadioMessage::Metadata(_) => Some(FragmentKind::Metadata),
            _ => None,
        }
    }
}

/// What a message did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Not part of a handshake in progress.
    Ignored,
    /// First fragment of the stream.
    Started,
    Fragment,
    Completed,
    /// Completion marker for a request that is no longer current.
    Stale(u32),
}

/// Per-connection handshake state. Dropped on disconnect.
#[derive(Debug)]
pub struct HandshakeSession {
    config_id: u32,
    phase: HandshakePhase,
    fragments: Vec<FragmentKind>,
    my_node_num: Option<u32>,
    firmware_version: Option<String>,
    started_at: Option<Instant>,
}

impl Default for HandshakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeSession {
    pub fn new() -> Self {
        Self::with_seed(rand::random::<u32>())
    }

    /// Start request ids after `seed`; used by tests to pin ids.
    pub fn with_seed(seed: u32) -> Self {
        Self {
            config_id: seed,
            phase: HandshakePhase::Idle,
            fragments: Vec::new(),
            my_node_num: None,
            firmware_version: None,
            started_at: None,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.phase,
            HandshakePhase::AwaitingConfig | HandshakePhase::Streaming
        )
    }

    /// The id of the most recent request.
    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Fragments received since the last request, in arrival order.
    pub fn fragments(&self) -> &[FragmentKind] {
        &self.fragments
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.my_node_num
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    /// Move to `AwaitingConfig` and return the fresh id to send.
    pub fn begin(&mut self) -> Result<u32, HandshakeError> {
        if self.phase != HandshakePhase::Idle {
            return Err(HandshakeError::AlreadyInProgress);
        }

        let mut next = self.config_id.wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.config_id = next;
        self.phase = HandshakePhase::AwaitingConfig;
        self.fragments.clear();
        self.started_at = Some(Instant::now());
        info!("Requesting radio configuration (id {next})");
        Ok(next)
    }

    /// Back to `Idle` without completing, e.g. the request could not be written.
    pub fn abort(&mut self) {
        self.phase = HandshakePhase::Idle;
        self.started_at = None;
    }

    /// `true` once a request has been outstanding longer than `limit`.
    pub fn expired(&self, limit: Duration) -> bool {
        self.in_progress()
            && self
                .started_at
                .is_some_and(|started| started.elapsed() >= limit)
    }

    pub fn observe(&mut self, message: &RadioMessage) -> HandshakeStep {
        if let RadioMessage::MyInfo(info) = message {
            self.my_node_num = Some(info.my_node_num);
        }
        if let RadioMessage::Metadata(metadata) = message
            && !metadata.firmware_version.is_empty()
        {
            self.firmware_version = Some(metadata.firmware_version.clone());
        }

        if let RadioMessage::ConfigComplete(id) = message {
            return self.complete(*id);
        }

        let Some(kind) = FragmentKind::of(message) else {
            return HandshakeStep::Ignored;
        };

        match self.phase {
            HandshakePhase::AwaitingConfig => {
                self.phase = HandshakePhase::Streaming;
                self.fragments.push(kind);
                debug!("Configuration stream started");
                HandshakeStep::Started
            }
            HandshakePhase::Streaming => {
                self.fragments.push(kind);
                HandshakeStep::Fragment
            }
            HandshakePhase::Idle | HandshakePhase::Complete => HandshakeStep::Ignored,
        }
    }

    fn complete(&mut self, id: u32) -> HandshakeStep {
        if !self.in_progress() || id != self.config_id {
            debug!(
                "Ignoring completion marker {id} (current request {}, {:?})",
                self.config_id, self.phase
            );
            return HandshakeStep::Stale(id);
        }

        self.phase = HandshakePhase::Complete;
        self.started_at = None;
        info!(
            "Radio configuration complete ({} fragments)",
            self.fragments.len()
        );
        HandshakeStep::Completed
    }
}
