//! Outbound admin and text requests.
//!
//! Every request gets a random non-zero packet id that is returned to the
//! caller and kept until a routing reply names it. An id of 0 means nothing
//! was sent.

use chrono::{DateTime, Utc};
use meshtastic::Message as ProstMessage;
use meshtastic::protobufs;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{ConfigKind, ConfigSection, ModuleKind, SectionKind, WireSection};
use crate::error::{HandshakeError, ProtocolError, Result, SyncError};
use crate::handshake::HandshakeSession;
use crate::message::BROADCAST_ADDR;
use crate::reconcile::Reconciler;
use crate::settings::SyncSettings;
use crate::state::{Delivery, MessageRecord};
use crate::store::StoreChange;
use crate::transport::RadioTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    RequestConfig(ConfigKind),
    RequestModuleConfig(ModuleKind),
    SaveConfig(SectionKind),
    Reboot,
    Shutdown,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: u32,
    pub to: u32,
    pub kind: CommandKind,
    pub sent_at: DateTime<Utc>,
}

pub struct CommandDispatcher {
    reconciler: Reconciler,
    hop_limit: u32,
    admin_channel: u32,
    pending: HashMap<u32, PendingCommand>,
}

impl CommandDispatcher {
    pub fn new(reconciler: Reconciler, settings: &SyncSettings) -> Self {
        Self {
            reconciler,
            hop_limit: settings.hop_limit,
            admin_channel: settings.admin_channel,
            pending: HashMap::new(),
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingCommand> {
        self.pending.values()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Forget a request once the radio has answered it.
    pub fn resolve(&mut self, id: u32) -> Option<PendingCommand> {
        self.pending.remove(&id)
    }

    /// Drop every outstanding request, e.g. on disconnect.
    pub fn clear_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = rand::random::<u32>();
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Start the handshake: write `want_config_id` with a fresh id.
    pub async fn request_config<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&mut HandshakeSession>,
    ) -> Result<u32> {
        let session = session.ok_or(HandshakeError::NotConnected)?;
        let config_id = session.begin()?;

        let frame = codec::encode(&codec::want_config(config_id));
        if let Err(e) = transport.write(&frame).await {
            warn!("Failed to request configuration: {e}");
            session.abort();
            return Err(e.into());
        }
        Ok(config_id)
    }

    pub async fn request_config_section<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        kind: ConfigKind,
    ) -> u32 {
        let admin = protobufs::admin_message::PayloadVariant::GetConfigRequest(
            kind.admin_request() as i32,
        );
        self.send_admin(transport, session, to, admin, true, CommandKind::RequestConfig(kind))
            .await
    }

    pub async fn request_module_config<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        kind: ModuleKind,
    ) -> u32 {
        let admin = protobufs::admin_message::PayloadVariant::GetModuleConfigRequest(
            kind.admin_request() as i32,
        );
        self.send_admin(
            transport,
            session,
            to,
            admin,
            true,
            CommandKind::RequestModuleConfig(kind),
        )
        .await
    }

    /// Write `section` to node `to`. Only allowed once the handshake is complete;
    /// on success the section is also upserted locally.
    pub async fn save_config<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        section: ConfigSection,
    ) -> u32 {
        if !session.is_some_and(HandshakeSession::is_complete) {
            warn!("Not saving {} config: {}", section.kind(), ProtocolError::NotReady);
            return 0;
        }

        let kind = section.kind();
        let admin = match section.to_wire() {
            WireSection::Config(config) => {
                protobufs::admin_message::PayloadVariant::SetConfig(config)
            }
            WireSection::Module(config) => {
                protobufs::admin_message::PayloadVariant::SetModuleConfig(config)
            }
        };

        let id = self
            .send_admin(transport, session, to, admin, false, CommandKind::SaveConfig(kind))
            .await;
        if id != 0
            && let Err(e) = self.reconciler.apply_section(to, section).await
        {
            warn!("Saved {kind} config for {to:08x} but could not store it locally: {e}");
        }
        id
    }

    pub async fn reboot<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        delay_secs: i32,
    ) -> u32 {
        let admin = protobufs::admin_message::PayloadVariant::RebootSeconds(delay_secs);
        self.send_admin(transport, session, to, admin, false, CommandKind::Reboot)
            .await
    }

    pub async fn shutdown<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        delay_secs: i32,
    ) -> u32 {
        let admin = protobufs::admin_message::PayloadVariant::ShutdownSeconds(delay_secs);
        self.send_admin(transport, session, to, admin, false, CommandKind::Shutdown)
            .await
    }

    /// Send a text message; `to` may be [`BROADCAST_ADDR`]. The message is
    /// stored as pending until the radio acknowledges it.
    pub async fn send_text<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        text: &str,
        to: u32,
        channel: u32,
    ) -> u32 {
        let Some(from) = self.addressing(session, to, to != BROADCAST_ADDR).await else {
            return 0;
        };

        let id = self.next_id();
        let data = protobufs::Data {
            portnum: protobufs::PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        };
        let packet = self.mesh_packet(id, from, to, channel, data);

        if !self.write_packet(transport, packet).await {
            return 0;
        }

        let record = MessageRecord {
            id,
            from,
            to,
            channel,
            text: text.to_string(),
            rx_time: Utc::now(),
            snr: None,
            rssi: None,
            delivery: Delivery::Pending,
        };
        let stored = self
            .reconciler
            .store()
            .write(|tx| {
                tx.messages_mut().push(record);
                tx.notify(StoreChange::MessageAdded(id));
                Ok(())
            })
            .await;
        if let Err(e) = stored {
            warn!("Sent message {id} but could not store it: {e}");
        }

        self.track(id, to, CommandKind::Text);
        id
    }

    /// Resolve `(from, to)` for a request to `to`. `None` when there is no
    /// connection, the radio's own number is unknown, or `to` has no user.
    async fn addressing(
        &self,
        session: Option<&HandshakeSession>,
        to: u32,
        needs_user: bool,
    ) -> Option<u32> {
        let Some(session) = session else {
            debug!("Not sending to {to:08x}: {}", HandshakeError::NotConnected);
            return None;
        };

        let model = self.reconciler.store().read().await;
        let Some(from) = session.my_node_num().or(model.my_node_num) else {
            debug!("Not sending to {to:08x}: {}", ProtocolError::NoLocalNode);
            return None;
        };

        if needs_user {
            let has_user = model.node(to).is_some_and(|n| n.user.is_some());
            if !has_user {
                let reason = match model.node(to) {
                    Some(_) => ProtocolError::MissingUser(to),
                    None => ProtocolError::UnknownNode(to),
                };
                debug!("Not sending: {reason}");
                return None;
            }
        }

        Some(from)
    }

    async fn send_admin<T: RadioTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: Option<&HandshakeSession>,
        to: u32,
        payload: protobufs::admin_message::PayloadVariant,
        want_response: bool,
        kind: CommandKind,
    ) -> u32 {
        let Some(from) = self.addressing(session, to, true).await else {
            return 0;
        };

        let admin = protobufs::AdminMessage {
            payload_variant: Some(payload),
            session_passkey: Vec::new(),
        };
        let id = self.next_id();
        let data = protobufs::Data {
            portnum: protobufs::PortNum::AdminApp as i32,
            payload: admin.encode_to_vec(),
            want_response,
            ..Default::default()
        };
        let packet = self.mesh_packet(id, from, to, self.admin_channel, data);

        if !self.write_packet(transport, packet).await {
            return 0;
        }

        info!("Sent {kind:?} to {to:08x} (id {id})");
        self.track(id, to, kind);
        id
    }

    fn mesh_packet(
        &self,
        id: u32,
        from: u32,
        to: u32,
        channel: u32,
        data: protobufs::Data,
    ) -> protobufs::MeshPacket {
        protobufs::MeshPacket {
            payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)),
            from,
            to,
            id,
            channel,
            hop_limit: self.hop_limit,
            want_ack: true,
            priority: protobufs::mesh_packet::Priority::Reliable as i32,
            ..Default::default()
        }
    }

    async fn write_packet<T: RadioTransport + ?Sized>(
        &self,
        transport: &mut T,
        packet: protobufs::MeshPacket,
    ) -> bool {
        let frame = codec::encode(&codec::packet(packet));
        match transport.write(&frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send failed: {}", SyncError::from(e));
                false
            }
        }
    }

    fn track(&mut self, id: u32, to: u32, kind: CommandKind) {
        self.pending.insert(
            id,
            PendingCommand {
                id,
                to,
                kind,
                sent_at: Utc::now(),
            },
        );
    }
}
