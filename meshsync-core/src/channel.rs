use meshtastic::protobufs;
use tracing::debug;

use crate::config::UpsertOutcome;
use crate::state::ChannelRecord;
use crate::store::{StoreChange, Transaction};

pub fn channel_record(channel: &protobufs::Channel) -> ChannelRecord {
    ChannelRecord {
        index: channel.index as u32,
        name: channel
            .settings
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Channel {index}", index = channel.index)),
        role: format!("{:?}", channel.role()),
        has_psk: channel
            .settings
            .as_ref()
            .map(|s| !s.psk.is_empty())
            .unwrap_or(false),
    }
}

/// Insert or replace the channel at `record.index`.
pub fn upsert_channel(tx: &mut Transaction<'_>, record: ChannelRecord) -> UpsertOutcome {
    let index = record.index;
    let channels = tx.channels_mut();
    let outcome = match channels.iter_mut().find(|c| c.index == index) {
        Some(existing) => {
            *existing = record;
            UpsertOutcome::Updated
        }
        None => {
            channels.push(record);
            channels.sort_by_key(|c| c.index);
            UpsertOutcome::Created
        }
    };
    debug!("Channel {index} {outcome:?}");
    tx.notify(StoreChange::ChannelUpdated(index));
    outcome
}
