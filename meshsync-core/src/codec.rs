//! Wire framing for `ToRadio`/`FromRadio` envelopes.
//!
//! Over BLE each characteristic value is one bare protobuf. Serial and TCP
//! links wrap the same protobuf in a four byte header: `0x94 0xC3` followed by
//! the payload length as a big-endian `u16`.

use meshtastic::Message as ProstMessage;
use meshtastic::protobufs;
use tracing::debug;

use crate::error::DecodeError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xc3;
pub const HEADER_LEN: usize = 4;
/// Largest payload a radio will send or accept.
pub const MAX_FRAME_LEN: usize = 512;

/// A decoded `FromRadio` envelope, discriminated by its populated variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioMessage {
    MyInfo(protobufs::MyNodeInfo),
    NodeInfo(protobufs::NodeInfo),
    Channel(protobufs::Channel),
    Config(protobufs::Config),
    ModuleConfig(protobufs::ModuleConfig),
    Metadata(protobufs::DeviceMetadata),
    ConfigComplete(u32),
    Packet(Box<MeshEnvelope>),
    /// Nothing the client acts on (log records, queue status, empty envelope).
    Ignored,
}

impl RadioMessage {
    pub fn label(&self) -> &'static str {
        match self {
            RadioMessage::MyInfo(_) => "my_info",
            RadioMessage::NodeInfo(_) => "node_info",
            RadioMessage::Channel(_) => "channel",
            RadioMessage::Config(_) => "config",
            RadioMessage::ModuleConfig(_) => "module_config",
            RadioMessage::Metadata(_) => "metadata",
            RadioMessage::ConfigComplete(_) => "config_complete",
            RadioMessage::Packet(_) => "packet",
            RadioMessage::Ignored => "ignored",
        }
    }
}

/// Header fields of a mesh packet plus its classified payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEnvelope {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    /// Seconds since the epoch, 0 when the radio had no clock.
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    /// Id of the packet this one answers, 0 if none.
    pub request_id: u32,
    pub payload: PacketPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    Text(String),
    Position(protobufs::Position),
    NodeInfo(protobufs::User),
    Telemetry(protobufs::Telemetry),
    Admin(protobufs::AdminMessage),
    Routing(protobufs::Routing),
    /// Encrypted for a channel we hold no key for.
    Encrypted,
    Other(protobufs::PortNum),
}

pub fn encode(message: &protobufs::ToRadio) -> Vec<u8> {
    message.encode_to_vec()
}

/// Encode with the stream header prepended.
pub fn encode_framed(message: &protobufs::ToRadio) -> Vec<u8> {
    let payload = message.encode_to_vec();
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[START1, START2]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

pub fn want_config(config_id: u32) -> protobufs::ToRadio {
    protobufs::ToRadio {
        payload_variant: Some(protobufs::to_radio::PayloadVariant::WantConfigId(config_id)),
    }
}

pub fn packet(packet: protobufs::MeshPacket) -> protobufs::ToRadio {
    protobufs::ToRadio {
        payload_variant: Some(protobufs::to_radio::PayloadVariant::Packet(packet)),
    }
}

/// Decode one bare `FromRadio` protobuf.
pub fn decode(bytes: &[u8]) -> Result<RadioMessage, DecodeError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(DecodeError::Oversized(bytes.len()));
    }

    let from_radio = protobufs::FromRadio::decode(bytes)
        .map_err(|e| DecodeError::Envelope(e.to_string()))?;

    use protobufs::from_radio::PayloadVariant;
    let message = match from_radio.payload_variant {
        Some(PayloadVariant::MyInfo(info)) => RadioMessage::MyInfo(info),
        Some(PayloadVariant::NodeInfo(info)) => RadioMessage::NodeInfo(info),
        Some(PayloadVariant::Channel(channel)) => RadioMessage::Channel(channel),
        Some(PayloadVariant::Config(config)) => RadioMessage::Config(config),
        Some(PayloadVariant::ModuleConfig(config)) => RadioMessage::ModuleConfig(config),
        Some(PayloadVariant::Metadata(metadata)) => RadioMessage::Metadata(metadata),
        Some(PayloadVariant::ConfigCompleteId(id)) => RadioMessage::ConfigComplete(id),
        Some(PayloadVariant::Packet(packet)) => {
            RadioMessage::Packet(Box::new(classify_packet(packet)?))
        }
        Some(_) | None => RadioMessage::Ignored,
    };

    Ok(message)
}

fn classify_packet(packet: protobufs::MeshPacket) -> Result<MeshEnvelope, DecodeError> {
    use protobufs::PortNum;

    let mut envelope = MeshEnvelope {
        id: packet.id,
        from: packet.from,
        to: packet.to,
        channel: packet.channel,
        rx_time: packet.rx_time,
        rx_snr: packet.rx_snr,
        rx_rssi: packet.rx_rssi,
        request_id: 0,
        payload: PacketPayload::Encrypted,
    };

    let data = match packet.payload_variant {
        Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)) => data,
        Some(protobufs::mesh_packet::PayloadVariant::Encrypted(_)) | None => return Ok(envelope),
    };
    envelope.request_id = data.request_id;

    let from = packet.from;
    let port = data.portnum();
    let bytes = data.payload.as_slice();
    let invalid = |port: &'static str, reason: String| DecodeError::Payload { port, from, reason };

    envelope.payload = match port {
        PortNum::TextMessageApp => PacketPayload::Text(
            String::from_utf8(data.payload.clone())
                .map_err(|e| invalid("text", e.to_string()))?,
        ),
        PortNum::PositionApp => PacketPayload::Position(
            protobufs::Position::decode(bytes).map_err(|e| invalid("position", e.to_string()))?,
        ),
        PortNum::NodeinfoApp => PacketPayload::NodeInfo(
            protobufs::User::decode(bytes).map_err(|e| invalid("nodeinfo", e.to_string()))?,
        ),
        PortNum::TelemetryApp => PacketPayload::Telemetry(
            protobufs::Telemetry::decode(bytes)
                .map_err(|e| invalid("telemetry", e.to_string()))?,
        ),
        PortNum::AdminApp => PacketPayload::Admin(
            protobufs::AdminMessage::decode(bytes).map_err(|e| invalid("admin", e.to_string()))?,
        ),
        PortNum::RoutingApp => PacketPayload::Routing(
            protobufs::Routing::decode(bytes).map_err(|e| invalid("routing", e.to_string()))?,
        ),
        other => PacketPayload::Other(other),
    };

    Ok(envelope)
}

/// Reassembles stream-framed messages from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Result<RadioMessage, DecodeError>> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            // Skip anything before the start marker (debug console output, line noise).
            let Some(start) = self
                .buffer
                .windows(2)
                .position(|w| w[0] == START1 && w[1] == START2)
            else {
                // Keep a trailing START1 in case its partner is in the next chunk.
                let keep = usize::from(self.buffer.last() == Some(&START1));
                let drop = self.buffer.len() - keep;
                if drop > 0 {
                    debug!("Discarding {drop} bytes of stream noise");
                }
                self.buffer.drain(..drop);
                break;
            };
            if start > 0 {
                debug!("Discarding {start} bytes of stream noise");
                self.buffer.drain(..start);
            }

            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if len > MAX_FRAME_LEN {
                out.push(Err(DecodeError::Oversized(len)));
                // Resync past this marker.
                self.buffer.drain(..2);
                continue;
            }

            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
            out.push(decode(&frame));
        }

        out
    }
}
