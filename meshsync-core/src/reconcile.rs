//! Applies decoded radio messages to the store.
//!
//! Every message is one [`Store::write`] transaction keyed by node number.
//! Nodes are created the first time anything references them, except for
//! configuration sections, which are only accepted for a node the store
//! already knows.

use chrono::Utc;
use meshtastic::protobufs;
use tracing::{debug, warn};

use crate::channel::{channel_record, upsert_channel};
use crate::codec::{MeshEnvelope, PacketPayload, RadioMessage};
use crate::config::{ConfigSection, SectionKind, UpsertOutcome};
use crate::error::{ProtocolError, Result};
use crate::message::{
    delete_channel_messages, delete_messages_for, inbound_record, record_message,
    resolve_delivery,
};
use crate::position::{apply_position, clear_positions, timestamp};
use crate::state::{Delivery, MyNodeInfo, User};
use crate::store::{Store, StoreChange, Transaction};
use crate::telemetry::{apply_telemetry, clear_telemetry};

/// What a message changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Nothing,
    Node(u32),
    Position(u32),
    Telemetry(u32),
    Config {
        node: u32,
        kind: SectionKind,
        outcome: UpsertOutcome,
    },
    Message(u32),
    Channel(u32),
    /// Routing reply for one of our packets; `error` is `None` for a plain ack.
    Routing {
        request_id: u32,
        error: Option<String>,
    },
}

pub(crate) fn user_from_proto(user: &protobufs::User) -> User {
    User {
        id: user.id.clone(),
        long_name: user.long_name.clone(),
        short_name: user.short_name.clone(),
        hw_model: format!("{:?}", user.hw_model()),
        macaddr: hex::encode(&user.macaddr),
    }
}

/// Create or update the section in place. Unknown nodes are refused.
pub fn upsert_config(
    tx: &mut Transaction<'_>,
    num: u32,
    section: ConfigSection,
) -> Result<UpsertOutcome> {
    let kind = section.kind();
    let node = tx.node_mut(num).ok_or(ProtocolError::UnknownNode(num))?;
    let outcome = node.config.upsert(section);
    debug!("{kind} config for {num:08x}: {outcome:?}");
    tx.notify(StoreChange::ConfigUpdated { node: num, kind });
    Ok(outcome)
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Apply one message. `local_node` is the connected radio's number, the
    /// owner of config fragments streamed during the handshake.
    pub async fn apply(
        &self,
        message: &RadioMessage,
        local_node: Option<u32>,
    ) -> Result<Applied> {
        let result = match message {
            RadioMessage::MyInfo(info) => self.apply_my_info(info).await,
            RadioMessage::NodeInfo(info) => self.apply_node_info(info).await,
            RadioMessage::Channel(channel) => {
                let record = channel_record(channel);
                let index = record.index;
                self.store
                    .write(|tx| {
                        upsert_channel(tx, record);
                        Ok(Applied::Channel(index))
                    })
                    .await
            }
            RadioMessage::Config(config) => match ConfigSection::from_config(config.clone()) {
                Some(section) => self.apply_local_section(section, local_node).await,
                None => Ok(Applied::Nothing),
            },
            RadioMessage::ModuleConfig(config) => {
                match ConfigSection::from_module_config(config.clone()) {
                    Some(section) => self.apply_local_section(section, local_node).await,
                    None => Ok(Applied::Nothing),
                }
            }
            RadioMessage::Metadata(metadata) => {
                self.apply_metadata(&metadata.firmware_version, local_node)
                    .await
            }
            RadioMessage::Packet(envelope) => self.apply_packet(envelope).await,
            RadioMessage::ConfigComplete(_) | RadioMessage::Ignored => Ok(Applied::Nothing),
        };

        if let Err(e) = &result {
            warn!("Dropped {} update: {e}", message.label());
        }
        result
    }

    /// Upsert a section for `num`; used for local echoes of saved config.
    pub async fn apply_section(&self, num: u32, section: ConfigSection) -> Result<Applied> {
        self.store
            .write(|tx| {
                let kind = section.kind();
                let outcome = upsert_config(tx, num, section)?;
                Ok(Applied::Config {
                    node: num,
                    kind,
                    outcome,
                })
            })
            .await
    }

    async fn apply_local_section(
        &self,
        section: ConfigSection,
        local_node: Option<u32>,
    ) -> Result<Applied> {
        let num = local_node.ok_or(ProtocolError::NoLocalNode)?;
        self.apply_section(num, section).await
    }

    async fn apply_my_info(&self, info: &protobufs::MyNodeInfo) -> Result<Applied> {
        let num = info.my_node_num;
        let my_info = MyNodeInfo {
            node_num: num,
            reboot_count: info.reboot_count,
            min_app_version: info.min_app_version,
            device_id: hex::encode(&info.device_id),
            firmware_version: None,
        };

        self.store
            .write(|tx| {
                tx.set_my_node_num(num);
                let node = tx.node_or_insert(num);
                let firmware_version = node
                    .my_info
                    .as_ref()
                    .and_then(|existing| existing.firmware_version.clone());
                node.my_info = Some(MyNodeInfo {
                    firmware_version,
                    ..my_info
                });
                tx.notify(StoreChange::NodeUpdated(num));
                Ok(Applied::Node(num))
            })
            .await
    }

    async fn apply_node_info(&self, info: &protobufs::NodeInfo) -> Result<Applied> {
        let num = info.num;
        let heard_at = timestamp(info.last_heard);
        let snr = (info.snr != 0.0).then_some(info.snr);

        self.store
            .write(|tx| {
                let node = tx.node_or_insert(num);
                if let Some(user) = &info.user {
                    node.user = Some(user_from_proto(user));
                }
                if let Some(heard) = heard_at {
                    node.heard(heard, snr);
                }
                if let Some(position) = &info.position {
                    apply_position(tx, num, position, heard_at, snr);
                }
                tx.notify(StoreChange::NodeUpdated(num));
                Ok(Applied::Node(num))
            })
            .await
    }

    async fn apply_metadata(&self, firmware: &str, local_node: Option<u32>) -> Result<Applied> {
        let Some(num) = local_node else {
            return Ok(Applied::Nothing);
        };
        if firmware.is_empty() {
            return Ok(Applied::Nothing);
        }

        self.store
            .write(|tx| {
                let Some(my_info) = tx.node_mut(num).and_then(|n| n.my_info.as_mut()) else {
                    return Ok(Applied::Nothing);
                };
                my_info.firmware_version = Some(firmware.to_string());
                tx.notify(StoreChange::NodeUpdated(num));
                Ok(Applied::Node(num))
            })
            .await
    }

    async fn apply_packet(&self, envelope: &MeshEnvelope) -> Result<Applied> {
        let from = envelope.from;
        let heard_at = timestamp(envelope.rx_time);
        let snr = (envelope.rx_snr != 0.0).then_some(envelope.rx_snr);

        match &envelope.payload {
            PacketPayload::Text(text) => {
                let received = heard_at.unwrap_or_else(Utc::now);
                let record = inbound_record(envelope, text, received);
                self.store
                    .write(|tx| {
                        tx.node_or_insert(from).heard(received, snr);
                        record_message(tx, record);
                        Ok(Applied::Message(envelope.id))
                    })
                    .await
            }
            PacketPayload::Position(position) => {
                self.store
                    .write(|tx| {
                        if apply_position(tx, from, position, heard_at, snr) {
                            Ok(Applied::Position(from))
                        } else {
                            Ok(Applied::Nothing)
                        }
                    })
                    .await
            }
            PacketPayload::Telemetry(telemetry) => {
                let received = heard_at.unwrap_or_else(Utc::now);
                self.store
                    .write(|tx| {
                        if apply_telemetry(tx, from, telemetry, received, snr) {
                            Ok(Applied::Telemetry(from))
                        } else {
                            Ok(Applied::Nothing)
                        }
                    })
                    .await
            }
            PacketPayload::NodeInfo(user) => {
                let user = user_from_proto(user);
                let received = heard_at.unwrap_or_else(Utc::now);
                self.store
                    .write(|tx| {
                        let node = tx.node_or_insert(from);
                        node.user = Some(user);
                        node.heard(received, snr);
                        tx.notify(StoreChange::NodeUpdated(from));
                        Ok(Applied::Node(from))
                    })
                    .await
            }
            PacketPayload::Admin(admin) => self.apply_admin(from, admin).await,
            PacketPayload::Routing(routing) => self.apply_routing(envelope, routing).await,
            PacketPayload::Encrypted | PacketPayload::Other(_) => Ok(Applied::Nothing),
        }
    }

    async fn apply_admin(&self, from: u32, admin: &protobufs::AdminMessage) -> Result<Applied> {
        use protobufs::admin_message::PayloadVariant;

        let section = match admin.payload_variant.clone() {
            Some(PayloadVariant::GetConfigResponse(config)) => ConfigSection::from_config(config),
            Some(PayloadVariant::GetModuleConfigResponse(config)) => {
                ConfigSection::from_module_config(config)
            }
            Some(PayloadVariant::GetOwnerResponse(user)) => {
                let user = user_from_proto(&user);
                return self
                    .store
                    .write(|tx| {
                        let node = tx.node_mut(from).ok_or(ProtocolError::UnknownNode(from))?;
                        node.user = Some(user);
                        tx.notify(StoreChange::NodeUpdated(from));
                        Ok(Applied::Node(from))
                    })
                    .await;
            }
            _ => None,
        };

        match section {
            Some(section) => self.apply_section(from, section).await,
            None => Ok(Applied::Nothing),
        }
    }

    async fn apply_routing(
        &self,
        envelope: &MeshEnvelope,
        routing: &protobufs::Routing,
    ) -> Result<Applied> {
        let request_id = envelope.request_id;
        if request_id == 0 {
            return Ok(Applied::Nothing);
        }

        let error = match routing.variant {
            Some(protobufs::routing::Variant::ErrorReason(code)) if code != 0 => Some(
                protobufs::routing::Error::try_from(code)
                    .map(|e| format!("{e:?}"))
                    .unwrap_or_else(|_| format!("error {code}")),
            ),
            _ => None,
        };

        let delivery = match &error {
            Some(reason) => Delivery::Failed(reason.clone()),
            None => Delivery::Acknowledged,
        };

        self.store
            .write(|tx| {
                resolve_delivery(tx, request_id, delivery);
                Ok(Applied::Routing { request_id, error })
            })
            .await
    }

    pub async fn clear_positions(&self, num: u32) -> Result<usize> {
        self.store
            .write(|tx| clear_positions(tx, num).ok_or(ProtocolError::UnknownNode(num).into()))
            .await
    }

    pub async fn clear_telemetry(&self, num: u32) -> Result<usize> {
        self.store
            .write(|tx| clear_telemetry(tx, num).ok_or(ProtocolError::UnknownNode(num).into()))
            .await
    }

    pub async fn delete_messages_for(&self, num: u32) -> Result<usize> {
        self.store
            .write(|tx| Ok(delete_messages_for(tx, num)))
            .await
    }

    pub async fn delete_channel_messages(&self, channel: u32) -> Result<usize> {
        self.store
            .write(|tx| Ok(delete_channel_messages(tx, channel)))
            .await
    }

    /// Forget every node, message and channel.
    pub async fn clear_all(&self) -> Result<()> {
        self.store
            .write(|tx| {
                tx.clear();
                tx.notify(StoreChange::Cleared);
                Ok(())
            })
            .await
    }
}
