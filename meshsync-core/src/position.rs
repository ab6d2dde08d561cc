use chrono::{DateTime, Utc};
use meshtastic::protobufs;
use tracing::{debug, info};

use crate::state::Position;
use crate::store::{StoreChange, Transaction};

/// Coordinates some firmware reports before it has a GPS fix.
pub const SENTINEL_LATITUDE_I: i32 = 373346000;
pub const SENTINEL_LONGITUDE_I: i32 = -1220090000;

/// `true` for payloads that mean "no fix": all zero, or the sentinel pair.
pub fn is_unset_fix(latitude_i: i32, longitude_i: i32) -> bool {
    (latitude_i == 0 && longitude_i == 0)
        || (latitude_i == SENTINEL_LATITUDE_I && longitude_i == SENTINEL_LONGITUDE_I)
}

pub(crate) fn timestamp(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

/// Convert a position payload, or `None` when it carries no fix.
pub fn position_from_proto(
    proto: &protobufs::Position,
    snr: Option<f32>,
    received: DateTime<Utc>,
) -> Option<Position> {
    let latitude_i = proto.latitude_i.unwrap_or(0);
    let longitude_i = proto.longitude_i.unwrap_or(0);
    if is_unset_fix(latitude_i, longitude_i) {
        return None;
    }

    let time = timestamp(proto.timestamp)
        .or_else(|| timestamp(proto.time))
        .unwrap_or(received);

    Some(Position {
        latitude_i,
        longitude_i,
        altitude: proto.altitude,
        sats_in_view: proto.sats_in_view,
        ground_speed: proto.ground_speed,
        ground_track: proto.ground_track,
        seq_number: proto.seq_number,
        snr,
        time,
    })
}

/// Append a fix to node `num`, creating the node if needed.
///
/// `heard_at` is the receive time of the enclosing packet; when the radio did
/// not stamp one the fix's own time is used. Returns `false` when the payload
/// was dropped as "no fix".
pub fn apply_position(
    tx: &mut Transaction<'_>,
    num: u32,
    proto: &protobufs::Position,
    heard_at: Option<DateTime<Utc>>,
    snr: Option<f32>,
) -> bool {
    let now = Utc::now();
    let Some(position) = position_from_proto(proto, snr, heard_at.unwrap_or(now)) else {
        info!(
            "Dropping position from {num:08x}: no fix ({}, {})",
            proto.latitude_i.unwrap_or(0),
            proto.longitude_i.unwrap_or(0)
        );
        return false;
    };

    let heard = heard_at
        .or_else(|| timestamp(proto.time))
        .or_else(|| timestamp(proto.timestamp))
        .unwrap_or(now);

    let node = tx.node_or_insert(num);
    node.heard(heard, snr);
    debug!(
        "Position for {num:08x}: {:.5}, {:.5}",
        position.latitude(),
        position.longitude()
    );
    node.positions.push(position);
    tx.notify(StoreChange::PositionAdded(num));
    true
}

/// Remove every stored fix of node `num`. Returns how many were removed.
pub fn clear_positions(tx: &mut Transaction<'_>, num: u32) -> Option<usize> {
    let node = tx.node_mut(num)?;
    let removed = node.positions.len();
    node.positions.clear();
    tx.notify(StoreChange::PositionsCleared(num));
    Some(removed)
}
