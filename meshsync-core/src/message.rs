use chrono::{DateTime, Utc};
use tracing::debug;

use crate::codec::MeshEnvelope;
use crate::state::{Delivery, MessageRecord};
use crate::store::{StoreChange, Transaction};

/// Broadcast destination.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

pub fn inbound_record(
    envelope: &MeshEnvelope,
    text: &str,
    received: DateTime<Utc>,
) -> MessageRecord {
    MessageRecord {
        id: envelope.id,
        from: envelope.from,
        to: envelope.to,
        channel: envelope.channel,
        text: text.to_string(),
        rx_time: received,
        snr: (envelope.rx_snr != 0.0).then_some(envelope.rx_snr),
        rssi: (envelope.rx_rssi != 0).then_some(envelope.rx_rssi),
        delivery: Delivery::Received,
    }
}

/// Append a message; a repeat of an id already stored from the same sender is dropped.
pub fn record_message(tx: &mut Transaction<'_>, record: MessageRecord) -> bool {
    let duplicate = record.id != 0
        && tx
            .model()
            .messages
            .iter()
            .any(|m| m.id == record.id && m.from == record.from);
    if duplicate {
        debug!(
            "Dropping duplicate message {} from {:08x}",
            record.id, record.from
        );
        return false;
    }

    let id = record.id;
    tx.messages_mut().push(record);
    tx.notify(StoreChange::MessageAdded(id));
    true
}

/// Set the delivery state of our own message `id`. `false` if no such message.
pub fn resolve_delivery(tx: &mut Transaction<'_>, id: u32, delivery: Delivery) -> bool {
    let Some(message) = tx
        .messages_mut()
        .iter_mut()
        .find(|m| m.id == id && m.delivery == Delivery::Pending)
    else {
        return false;
    };
    message.delivery = delivery;
    tx.notify(StoreChange::MessageUpdated(id));
    true
}

/// Delete every message sent by or to node `num`.
pub fn delete_messages_for(tx: &mut Transaction<'_>, num: u32) -> usize {
    let messages = tx.messages_mut();
    let before = messages.len();
    messages.retain(|m| m.from != num && m.to != num);
    let removed = before - messages.len();
    tx.notify(StoreChange::MessagesDeleted(removed));
    removed
}

/// Delete every broadcast message on `channel`.
pub fn delete_channel_messages(tx: &mut Transaction<'_>, channel: u32) -> usize {
    let messages = tx.messages_mut();
    let before = messages.len();
    messages.retain(|m| !(m.channel == channel && m.to == BROADCAST_ADDR));
    let removed = before - messages.len();
    tx.notify(StoreChange::MessagesDeleted(removed));
    removed
}
