use chrono::{DateTime, Utc};
use meshtastic::protobufs;
use tracing::debug;

use crate::position::timestamp;
use crate::state::{DeviceMetrics, EnvironmentMetrics, TelemetrySample};
use crate::store::{StoreChange, Transaction};

/// Convert a telemetry payload. Variants the client does not record
/// (air quality, power, health) give `None`.
pub fn sample_from_proto(
    telemetry: &protobufs::Telemetry,
    received: DateTime<Utc>,
) -> Option<TelemetrySample> {
    let time = timestamp(telemetry.time).unwrap_or(received);

    match telemetry.variant.as_ref()? {
        protobufs::telemetry::Variant::DeviceMetrics(m) => Some(TelemetrySample {
            time,
            device_metrics: Some(DeviceMetrics {
                battery_level: m.battery_level,
                voltage: m.voltage,
                channel_utilization: m.channel_utilization,
                air_util_tx: m.air_util_tx,
                uptime_seconds: m.uptime_seconds,
            }),
            environment_metrics: None,
        }),
        protobufs::telemetry::Variant::EnvironmentMetrics(m) => Some(TelemetrySample {
            time,
            device_metrics: None,
            environment_metrics: Some(EnvironmentMetrics {
                temperature: m.temperature,
                relative_humidity: m.relative_humidity,
                barometric_pressure: m.barometric_pressure,
                gas_resistance: m.gas_resistance,
                iaq: m.iaq,
                lux: m.lux,
            }),
        }),
        _ => None,
    }
}

pub fn apply_telemetry(
    tx: &mut Transaction<'_>,
    num: u32,
    telemetry: &protobufs::Telemetry,
    heard_at: DateTime<Utc>,
    snr: Option<f32>,
) -> bool {
    let Some(sample) = sample_from_proto(telemetry, heard_at) else {
        debug!("Ignoring unsupported telemetry variant from {num:08x}");
        return false;
    };

    let node = tx.node_or_insert(num);
    node.heard(heard_at, snr);
    node.telemetry.push(sample);
    tx.notify(StoreChange::TelemetryAdded(num));
    true
}

pub fn clear_telemetry(tx: &mut Transaction<'_>, num: u32) -> Option<usize> {
    let node = tx.node_mut(num)?;
    let removed = node.telemetry.len();
    node.telemetry.clear();
    tx.notify(StoreChange::TelemetryCleared(num));
    Some(removed)
}
