use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::codec::{self, RadioMessage};
use crate::config::{ConfigKind, ConfigSection, ModuleKind};
use crate::dispatch::{CommandDispatcher, PendingCommand};
use crate::error::{DecodeError, HandshakeError, Result, TransportError};
use crate::handshake::{HandshakePhase, HandshakeSession, HandshakeStep};
use crate::reconcile::{Applied, Reconciler};
use crate::settings::{SyncSettings, firmware_supported};
use crate::store::Store;
use crate::transport::{LinkEvent, LinkId, LinkState, RadioLink, RadioTransport};

/// Notifications for whatever sits on top of the manager (the CLI, a UI).
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    LinkDiscovered(RadioLink),
    Connected(LinkId),
    Disconnected(LinkId),
    AdapterStateChanged { powered: bool },
    HandshakeStarted(u32),
    HandshakeComplete { config_id: u32, fragments: usize },
    HandshakeTimedOut,
    UnsupportedFirmware { reported: String, minimum: String },
    Applied(Applied),
    Acked(PendingCommand),
    Nacked { command: PendingCommand, reason: String },
    DecodeFailed(DecodeError),
    UpdateDropped(String),
}

/// Owns the transport and drives it: link events in, frames decoded, handshake
/// advanced, store reconciled, commands out.
pub struct ConnectionManager<T: RadioTransport> {
    transport: T,
    events: mpsc::Receiver<LinkEvent>,
    settings: SyncSettings,
    session: Option<HandshakeSession>,
    session_link: Option<LinkId>,
    reconciler: Reconciler,
    dispatcher: CommandDispatcher,
    sync_events: broadcast::Sender<SyncEvent>,
}

impl<T: RadioTransport> ConnectionManager<T> {
    pub fn new(mut transport: T, store: Store, settings: SyncSettings) -> Result<Self> {
        let events = transport
            .take_events()
            .ok_or_else(|| TransportError::Read("link event stream already taken".to_string()))?;
        let reconciler = Reconciler::new(store);
        let dispatcher = CommandDispatcher::new(reconciler.clone(), &settings);
        let (sync_events, _) = broadcast::channel(settings.event_capacity);

        Ok(Self {
            transport,
            events,
            settings,
            session: None,
            session_link: None,
            reconciler,
            dispatcher,
            sync_events,
        })
    }

    pub fn store(&self) -> &Store {
        self.reconciler.store()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync_events.subscribe()
    }

    pub async fn links(&self) -> Vec<RadioLink> {
        self.transport.links().await
    }

    pub async fn link_state(&self, link: &str) -> Option<LinkState> {
        self.transport
            .links()
            .await
            .into_iter()
            .find(|l| l.id == link)
            .map(|l| l.state)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&HandshakeSession> {
        self.session.as_ref()
    }

    pub fn handshake_phase(&self) -> HandshakePhase {
        self.session
            .as_ref()
            .map(HandshakeSession::phase)
            .unwrap_or(HandshakePhase::Idle)
    }

    /// Node number of the connected radio, once it has told us.
    pub async fn local_node(&self) -> Option<u32> {
        match self.session.as_ref().and_then(HandshakeSession::my_node_num) {
            Some(num) => Some(num),
            None => self.store().read().await.my_node_num,
        }
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.dispatcher.pending().cloned().collect()
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.sync_events.send(event);
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        self.transport.start_scan().await?;
        Ok(())
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        self.transport.stop_scan().await?;
        Ok(())
    }

    /// Scan for `duration` and return everything seen.
    pub async fn scan_for(&mut self, duration: Duration) -> Result<Vec<RadioLink>> {
        info!("Scanning for {}", humantime::format_duration(duration));
        self.start_scan().await?;
        self.pump_for(duration).await;
        self.stop_scan().await?;
        Ok(self.links().await)
    }

    /// Connect to `link`, replacing any current connection and its session.
    pub async fn connect(&mut self, link: &LinkId) -> Result<()> {
        if let Some(previous) = self.session_link.take() {
            debug!("Dropping session with {previous}");
        }
        self.session = None;
        self.dispatcher.clear_pending();

        self.transport.connect(link).await?;
        info!("Connected to {link}");
        self.session = Some(HandshakeSession::new());
        self.session_link = Some(link.clone());
        // Anything the radio queued before we subscribed is not announced.
        self.drain().await;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await?;
        self.end_session();
        Ok(())
    }

    fn end_session(&mut self) {
        if self.session.take().is_some() {
            let dropped = self.dispatcher.clear_pending();
            if dropped > 0 {
                debug!("Discarded {dropped} unanswered commands");
            }
        }
        self.session_link = None;
    }

    /// Send `want_config_id`; the radio answers by streaming its configuration.
    pub async fn request_config(&mut self) -> Result<u32> {
        let config_id = self
            .dispatcher
            .request_config(&mut self.transport, self.session.as_mut())
            .await?;
        self.emit(SyncEvent::HandshakeStarted(config_id));
        // The radio starts streaming without notifying FROMNUM first.
        self.drain().await;
        Ok(config_id)
    }

    /// Request configuration and process events until it is complete.
    pub async fn sync(&mut self) -> Result<()> {
        self.request_config().await?;
        self.wait_for_config().await
    }

    /// Process events until the handshake completes, the link drops, or the
    /// configured timeout passes. A timeout returns the session to `Idle`.
    pub async fn wait_for_config(&mut self) -> Result<()> {
        let limit = self.settings.handshake_timeout;
        let deadline = Instant::now() + limit;

        loop {
            match self.session.as_ref() {
                None => return Err(HandshakeError::NotConnected.into()),
                Some(session) if session.is_complete() => return Ok(()),
                Some(session) if !session.in_progress() => {
                    return Err(HandshakeError::NotConnected.into());
                }
                Some(_) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => self.process_event(event).await,
                Ok(None) => return Err(HandshakeError::NotConnected.into()),
                Err(_) => {
                    self.expire_handshake();
                    return Err(HandshakeError::TimedOut(limit).into());
                }
            }
            if self.check_timeout() {
                return Err(HandshakeError::TimedOut(limit).into());
            }
        }
    }

    /// Reset a handshake that has been outstanding longer than the timeout.
    /// Returns `true` if it did.
    pub fn check_timeout(&mut self) -> bool {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|s| s.expired(self.settings.handshake_timeout));
        if expired {
            self.expire_handshake();
        }
        expired
    }

    fn expire_handshake(&mut self) {
        if let Some(session) = self.session.as_mut()
            && session.in_progress()
        {
            warn!(
                "Radio did not finish sending configuration within {}",
                humantime::format_duration(self.settings.handshake_timeout)
            );
            session.abort();
            self.emit(SyncEvent::HandshakeTimedOut);
        }
    }

    /// Handle every event that arrives within `duration`.
    pub async fn pump_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => self.process_event(event).await,
                Ok(None) | Err(_) => break,
            }
            self.check_timeout();
        }
    }

    /// Handle events already queued without waiting for more.
    pub async fn pump_pending(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.process_event(event).await;
        }
        self.check_timeout();
    }

    pub async fn process_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered(link) => {
                debug!("Discovered {} ({}) rssi {:?}", link.name, link.id, link.rssi);
                self.emit(SyncEvent::LinkDiscovered(link));
            }
            LinkEvent::Connected(link) => {
                if self.session_link.as_ref() != Some(&link) {
                    self.session = Some(HandshakeSession::new());
                    self.session_link = Some(link.clone());
                }
                self.emit(SyncEvent::Connected(link));
            }
            LinkEvent::Disconnected(link) => {
                // Queued by a connection that has since been replaced.
                if self.transport.connected().await.as_ref() == Some(&link) {
                    debug!("Ignoring stale disconnect from {link}");
                    return;
                }
                if self.session_link.as_ref() == Some(&link) {
                    info!("Radio {link} disconnected");
                    self.end_session();
                }
                self.emit(SyncEvent::Disconnected(link));
            }
            LinkEvent::DataAvailable => self.drain().await,
            LinkEvent::AdapterStateChanged { powered } => {
                if !powered {
                    warn!("Bluetooth adapter powered off");
                    self.end_session();
                }
                self.emit(SyncEvent::AdapterStateChanged { powered });
            }
        }
    }

    /// Read FROMRADIO until it is empty, handling each value before the next read.
    async fn drain(&mut self) {
        if self.session.is_none() {
            return;
        }
        loop {
            match self.transport.read().await {
                Ok(Some(bytes)) => self.handle_frame(&bytes).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("FROMRADIO read failed: {e}");
                    break;
                }
            }
        }
    }

    /// Decode one FROMRADIO value and apply it.
    pub async fn handle_frame(&mut self, bytes: &[u8]) {
        let message = match codec::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame: {e}");
                self.emit(SyncEvent::DecodeFailed(e));
                return;
            }
        };
        debug!("FromRadio {}", message.label());
        self.handle_message(message).await;
    }

    async fn handle_message(&mut self, message: RadioMessage) {
        if let Some(session) = self.session.as_mut() {
            match session.observe(&message) {
                HandshakeStep::Completed => {
                    let config_id = session.config_id();
                    let fragments = session.fragments().len();
                    self.emit(SyncEvent::HandshakeComplete {
                        config_id,
                        fragments,
                    });
                }
                HandshakeStep::Stale(id) => debug!("Stale completion marker {id}"),
                HandshakeStep::Started | HandshakeStep::Fragment | HandshakeStep::Ignored => {}
            }
        }

        if let RadioMessage::Metadata(metadata) = &message {
            self.check_firmware(&metadata.firmware_version);
        }

        let local_node = self.local_node().await;
        match self.reconciler.apply(&message, local_node).await {
            Ok(Applied::Nothing) => {}
            Ok(Applied::Routing { request_id, error }) => {
                if let Some(command) = self.dispatcher.resolve(request_id) {
                    match error.clone() {
                        None => {
                            debug!("Request {request_id} acknowledged");
                            self.emit(SyncEvent::Acked(command));
                        }
                        Some(reason) => {
                            warn!("Request {request_id} failed: {reason}");
                            self.emit(SyncEvent::Nacked { command, reason });
                        }
                    }
                }
                self.emit(SyncEvent::Applied(Applied::Routing { request_id, error }));
            }
            Ok(applied) => self.emit(SyncEvent::Applied(applied)),
            Err(e) => self.emit(SyncEvent::UpdateDropped(e.to_string())),
        }
    }

    fn check_firmware(&self, reported: &str) {
        if reported.is_empty() {
            return;
        }
        let minimum = &self.settings.min_firmware_version;
        if !firmware_supported(reported, minimum) {
            warn!("Radio firmware {reported} is older than the supported minimum {minimum}");
            self.emit(SyncEvent::UnsupportedFirmware {
                reported: reported.to_string(),
                minimum: minimum.clone(),
            });
        }
    }

    pub async fn request_config_section(&mut self, to: u32, kind: ConfigKind) -> u32 {
        self.dispatcher
            .request_config_section(&mut self.transport, self.session.as_ref(), to, kind)
            .await
    }

    pub async fn request_module_config(&mut self, to: u32, kind: ModuleKind) -> u32 {
        self.dispatcher
            .request_module_config(&mut self.transport, self.session.as_ref(), to, kind)
            .await
    }

    pub async fn save_config(&mut self, to: u32, section: ConfigSection) -> u32 {
        self.dispatcher
            .save_config(&mut self.transport, self.session.as_ref(), to, section)
            .await
    }

    pub async fn reboot(&mut self, to: u32, delay_secs: i32) -> u32 {
        self.dispatcher
            .reboot(&mut self.transport, self.session.as_ref(), to, delay_secs)
            .await
    }

    pub async fn shutdown(&mut self, to: u32, delay_secs: i32) -> u32 {
        self.dispatcher
            .shutdown(&mut self.transport, self.session.as_ref(), to, delay_secs)
            .await
    }

    pub async fn send_text(&mut self, text: &str, to: u32, channel: u32) -> u32 {
        self.dispatcher
            .send_text(&mut self.transport, self.session.as_ref(), text, to, channel)
            .await
    }

    pub async fn clear_positions(&self, num: u32) -> Result<usize> {
        self.reconciler.clear_positions(num).await
    }

    pub async fn clear_telemetry(&self, num: u32) -> Result<usize> {
        self.reconciler.clear_telemetry(num).await
    }

    pub async fn delete_messages_for(&self, num: u32) -> Result<usize> {
        self.reconciler.delete_messages_for(num).await
    }

    pub async fn delete_channel_messages(&self, channel: u32) -> Result<usize> {
        self.reconciler.delete_channel_messages(channel).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.reconciler.clear_all().await
    }
}
