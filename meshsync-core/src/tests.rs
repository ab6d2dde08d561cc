#[cfg(test)]
mod support {
    use crate::error::PersistenceError;
    use crate::state::MeshModel;
    use crate::store::StoreBackend;
    use async_trait::async_trait;
    use meshtastic::Message;
    use meshtastic::protobufs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub const RADIO: &str = "radio-1";
    pub const LOCAL: u32 = 0x1234_abcd;
    pub const REMOTE: u32 = 0x0bad_cafe;

    /// Saves succeed until `fail` is raised.
    pub struct FlakyBackend {
        pub fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StoreBackend for FlakyBackend {
        async fn load(&self) -> Result<Option<MeshModel>, PersistenceError> {
            Ok(None)
        }

        async fn save(&self, _model: &MeshModel) -> Result<(), PersistenceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PersistenceError::Backend("disk full".to_string()));
            }
            Ok(())
        }
    }

    pub fn from_radio(variant: protobufs::from_radio::PayloadVariant) -> protobufs::FromRadio {
        protobufs::FromRadio {
            payload_variant: Some(variant),
            ..Default::default()
        }
    }

    pub fn node_info(num: u32, long_name: &str) -> protobufs::FromRadio {
        from_radio(protobufs::from_radio::PayloadVariant::NodeInfo(
            protobufs::NodeInfo {
                num,
                user: Some(protobufs::User {
                    id: format!("!{num:08x}"),
                    long_name: long_name.to_string(),
                    short_name: long_name.chars().take(4).collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    pub fn packet(
        from: u32,
        port: protobufs::PortNum,
        payload: Vec<u8>,
        request_id: u32,
    ) -> protobufs::FromRadio {
        from_radio(protobufs::from_radio::PayloadVariant::Packet(
            protobufs::MeshPacket {
                from,
                to: LOCAL,
                id: rand::random::<u32>() | 1,
                rx_time: 1_700_000_000,
                rx_snr: 6.5,
                payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                    protobufs::Data {
                        portnum: port as i32,
                        payload,
                        request_id,
                        ..Default::default()
                    },
                )),
                ..Default::default()
            },
        ))
    }

    pub fn position_packet(from: u32, latitude_i: i32, longitude_i: i32) -> protobufs::FromRadio {
        let position = protobufs::Position {
            latitude_i: Some(latitude_i),
            longitude_i: Some(longitude_i),
            altitude: Some(12),
            sats_in_view: 7,
            ..Default::default()
        };
        packet(
            from,
            protobufs::PortNum::PositionApp,
            position.encode_to_vec(),
            0,
        )
    }

    pub fn admin_config_response(from: u32, config: protobufs::Config) -> protobufs::FromRadio {
        let admin = protobufs::AdminMessage {
            payload_variant: Some(
                protobufs::admin_message::PayloadVariant::GetConfigResponse(config),
            ),
            session_passkey: Vec::new(),
        };
        packet(
            from,
            protobufs::PortNum::AdminApp,
            admin.encode_to_vec(),
            0,
        )
    }

    pub fn routing_reply(from: u32, request_id: u32, error: protobufs::routing::Error) -> protobufs::FromRadio {
        let routing = protobufs::Routing {
            variant: Some(protobufs::routing::Variant::ErrorReason(error as i32)),
            ..Default::default()
        };
        packet(
            from,
            protobufs::PortNum::RoutingApp,
            routing.encode_to_vec(),
            request_id,
        )
    }

    pub fn device_config(role: protobufs::config::device_config::Role) -> protobufs::Config {
        protobufs::Config {
            payload_variant: Some(protobufs::config::PayloadVariant::Device(
                protobufs::config::DeviceConfig {
                    role: role as i32,
                    ..Default::default()
                },
            )),
        }
    }

    pub fn lora_config(region: protobufs::config::lo_ra_config::RegionCode) -> protobufs::Config {
        protobufs::Config {
            payload_variant: Some(protobufs::config::PayloadVariant::Lora(
                protobufs::config::LoRaConfig {
                    region: region as i32,
                    use_preset: true,
                    ..Default::default()
                },
            )),
        }
    }
}

#[cfg(test)]
mod codec_tests {
    use super::support::*;
    use crate::codec::{self, MAX_FRAME_LEN, PacketPayload, RadioMessage, StreamDecoder};
    use crate::error::DecodeError;
    use anyhow::{Context, Result};
    use meshtastic::Message;
    use meshtastic::protobufs;

    #[test]
    fn test_decode_discriminates_on_populated_variant() -> Result<()> {
        let complete = crate::transport::simulated::config_complete(42);
        let message = codec::decode(&complete.encode_to_vec())?;
        assert_eq!(message, RadioMessage::ConfigComplete(42));

        let message = codec::decode(&node_info(REMOTE, "Hilltop").encode_to_vec())?;
        let RadioMessage::NodeInfo(info) = message else {
            anyhow::bail!("expected node info, got {message:?}");
        };
        assert_eq!(info.num, REMOTE);
        Ok(())
    }

    #[test]
    fn test_empty_envelope_is_ignored() -> Result<()> {
        let empty = protobufs::FromRadio::default();
        assert_eq!(codec::decode(&empty.encode_to_vec())?, RadioMessage::Ignored);
        assert_eq!(codec::decode(&[])?, RadioMessage::Ignored);
        Ok(())
    }

    #[test]
    fn test_malformed_envelope_is_an_error() {
        let result = codec::decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(DecodeError::Envelope(_))));
    }

    #[test]
    fn test_malformed_payload_names_the_port() {
        let bad = packet(REMOTE, protobufs::PortNum::PositionApp, vec![0xff, 0xff], 0);
        match codec::decode(&bad.encode_to_vec()) {
            Err(DecodeError::Payload { port, from, .. }) => {
                assert_eq!(port, "position");
                assert_eq!(from, REMOTE);
            }
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[test]
    fn test_text_packet_classified() -> Result<()> {
        let frame = packet(REMOTE, protobufs::PortNum::TextMessageApp, b"hello".to_vec(), 0);
        let RadioMessage::Packet(envelope) = codec::decode(&frame.encode_to_vec())? else {
            anyhow::bail!("expected a packet");
        };
        assert_eq!(envelope.payload, PacketPayload::Text("hello".to_string()));
        assert_eq!(envelope.from, REMOTE);
        assert_eq!(envelope.rx_time, 1_700_000_000);
        Ok(())
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let bytes = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(
            codec::decode(&bytes),
            Err(DecodeError::Oversized(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn test_framed_encoding_header() {
        let to_radio = codec::want_config(7);
        let body = codec::encode(&to_radio);
        let framed = codec::encode_framed(&to_radio);

        assert_eq!(&framed[..2], &[codec::START1, codec::START2]);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]) as usize, body.len());
        assert_eq!(&framed[codec::HEADER_LEN..], body.as_slice());
    }

    #[test]
    fn test_stream_decoder_reassembles_and_skips_noise() -> Result<()> {
        let frame = node_info(REMOTE, "Hilltop").encode_to_vec();
        let mut stream = b"INFO | boot ok\r\n".to_vec();
        stream.extend_from_slice(&[codec::START1, codec::START2]);
        stream.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        stream.extend_from_slice(&frame);

        let split = stream.len() - 5;
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(&stream[..split]).is_empty());
        assert!(decoder.pending() > 0);

        let out = decoder.push(&stream[split..]);
        assert_eq!(out.len(), 1);
        let message = out
            .into_iter()
            .next()
            .context("no frame decoded")??;
        assert!(matches!(message, RadioMessage::NodeInfo(_)));
        assert_eq!(decoder.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_decoder_resyncs_after_bad_length() -> Result<()> {
        let frame = crate::transport::simulated::config_complete(9).encode_to_vec();
        let mut stream = vec![codec::START1, codec::START2, 0xff, 0xff];
        stream.extend_from_slice(&[codec::START1, codec::START2]);
        stream.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        stream.extend_from_slice(&frame);

        let out = StreamDecoder::new().push(&stream);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Err(DecodeError::Oversized(0xffff)));
        assert_eq!(out[1], Ok(RadioMessage::ConfigComplete(9)));
        Ok(())
    }
}

#[cfg(test)]
mod handshake_tests {
    use super::support::*;
    use crate::codec::RadioMessage;
    use crate::error::HandshakeError;
    use crate::handshake::{FragmentKind, HandshakePhase, HandshakeSession, HandshakeStep};
    use anyhow::Result;
    use meshtastic::protobufs;
    use std::time::Duration;

    fn my_info() -> RadioMessage {
        RadioMessage::MyInfo(protobufs::MyNodeInfo {
            my_node_num: LOCAL,
            ..Default::default()
        })
    }

    fn config() -> RadioMessage {
        RadioMessage::Config(device_config(
            protobufs::config::device_config::Role::Client,
        ))
    }

    #[test]
    fn test_full_handshake_completes_once() -> Result<()> {
        let mut session = HandshakeSession::with_seed(100);
        assert_eq!(session.phase(), HandshakePhase::Idle);

        let id = session.begin()?;
        assert_eq!(id, 101);
        assert_eq!(session.phase(), HandshakePhase::AwaitingConfig);

        assert_eq!(session.observe(&my_info()), HandshakeStep::Started);
        assert_eq!(session.phase(), HandshakePhase::Streaming);
        assert_eq!(session.observe(&config()), HandshakeStep::Fragment);
        assert_eq!(
            session.observe(&RadioMessage::ConfigComplete(id)),
            HandshakeStep::Completed
        );
        assert!(session.is_complete());
        assert_eq!(session.my_node_num(), Some(LOCAL));
        assert_eq!(
            session.fragments(),
            &[FragmentKind::MyInfo, FragmentKind::Config]
        );

        // A repeated marker does not complete twice.
        assert_eq!(
            session.observe(&RadioMessage::ConfigComplete(id)),
            HandshakeStep::Stale(id)
        );
        assert_eq!(session.begin(), Err(HandshakeError::AlreadyInProgress));
        Ok(())
    }

    #[test]
    fn test_stale_marker_leaves_session_streaming() -> Result<()> {
        let mut session = HandshakeSession::with_seed(500);
        let id = session.begin()?;
        session.observe(&my_info());
        session.observe(&config());

        assert_eq!(
            session.observe(&RadioMessage::ConfigComplete(id - 1)),
            HandshakeStep::Stale(id - 1)
        );
        assert_eq!(session.phase(), HandshakePhase::Streaming);
        assert_eq!(session.fragments().len(), 2);
        assert_eq!(session.config_id(), id);

        assert_eq!(
            session.observe(&RadioMessage::ConfigComplete(id)),
            HandshakeStep::Completed
        );
        Ok(())
    }

    #[test]
    fn test_request_while_in_progress_rejected() -> Result<()> {
        let mut session = HandshakeSession::new();
        session.begin()?;
        assert_eq!(session.begin(), Err(HandshakeError::AlreadyInProgress));
        session.observe(&my_info());
        assert_eq!(session.begin(), Err(HandshakeError::AlreadyInProgress));
        Ok(())
    }

    #[test]
    fn test_config_id_skips_zero() -> Result<()> {
        let mut session = HandshakeSession::with_seed(u32::MAX);
        assert_eq!(session.begin()?, 1);
        Ok(())
    }

    #[test]
    fn test_empty_stream_completes() -> Result<()> {
        let mut session = HandshakeSession::with_seed(1);
        let id = session.begin()?;
        assert_eq!(
            session.observe(&RadioMessage::ConfigComplete(id)),
            HandshakeStep::Completed
        );
        Ok(())
    }

    #[test]
    fn test_fragments_outside_handshake_ignored() {
        let mut session = HandshakeSession::new();
        assert_eq!(session.observe(&config()), HandshakeStep::Ignored);
        assert_eq!(session.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_expiry_and_abort() -> Result<()> {
        let mut session = HandshakeSession::new();
        assert!(!session.expired(Duration::ZERO));
        session.begin()?;
        assert!(session.expired(Duration::ZERO));
        assert!(!session.expired(Duration::from_secs(3600)));
        session.abort();
        assert_eq!(session.phase(), HandshakePhase::Idle);
        assert!(!session.expired(Duration::ZERO));
        Ok(())
    }
}

#[cfg(test)]
mod reconcile_tests {
    use super::support::*;
    use crate::codec::{self, RadioMessage};
    use crate::config::{ConfigKind, ConfigSection, SectionKind, UpsertOutcome};
    use crate::error::{ProtocolError, SyncError};
    use crate::position::{SENTINEL_LATITUDE_I, SENTINEL_LONGITUDE_I};
    use crate::reconcile::{Applied, Reconciler};
    use crate::store::{JsonFileBackend, Store, StoreChange};
    use anyhow::{Context, Result};
    use meshtastic::Message;
    use meshtastic::protobufs;
    use protobufs::config::device_config::Role;
    use protobufs::config::lo_ra_config::RegionCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn decode(frame: protobufs::FromRadio) -> Result<RadioMessage> {
        Ok(codec::decode(&frame.encode_to_vec())?)
    }

    async fn reconciler() -> Result<Reconciler> {
        Ok(Reconciler::new(Store::in_memory().await?))
    }

    #[tokio::test]
    async fn test_zero_position_never_stored() -> Result<()> {
        let reconciler = reconciler().await?;
        let applied = reconciler
            .apply(&decode(position_packet(REMOTE, 0, 0))?, None)
            .await?;

        assert_eq!(applied, Applied::Nothing);
        let model = reconciler.store().read().await;
        assert!(model.node(REMOTE).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_sentinel_position_never_stored() -> Result<()> {
        let reconciler = reconciler().await?;
        reconciler
            .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
            .await?;
        reconciler
            .apply(
                &decode(position_packet(
                    REMOTE,
                    SENTINEL_LATITUDE_I,
                    SENTINEL_LONGITUDE_I,
                ))?,
                None,
            )
            .await?;

        let model = reconciler.store().read().await;
        let node = model.node(REMOTE).context("node missing")?;
        assert!(node.positions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_position_appends_and_refreshes_last_heard() -> Result<()> {
        let reconciler = reconciler().await?;
        let applied = reconciler
            .apply(&decode(position_packet(REMOTE, 473_977_000, 85_456_000))?, None)
            .await?;
        assert_eq!(applied, Applied::Position(REMOTE));

        reconciler
            .apply(&decode(position_packet(REMOTE, 473_978_000, 85_457_000))?, None)
            .await?;

        let model = reconciler.store().read().await;
        let node = model.node(REMOTE).context("node missing")?;
        assert_eq!(node.positions.len(), 2);
        assert_eq!(node.snr, Some(6.5));
        assert_eq!(
            node.last_heard.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        let latest = node.latest_position().context("no position")?;
        assert_eq!(latest.latitude_i, 473_978_000);
        assert_eq!(latest.altitude, Some(12));
        Ok(())
    }

    #[tokio::test]
    async fn test_config_for_unknown_node_dropped() -> Result<()> {
        let reconciler = reconciler().await?;
        let before = reconciler.store().snapshot().await;

        let result = reconciler
            .apply(
                &decode(admin_config_response(REMOTE, device_config(Role::Router)))?,
                None,
            )
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Protocol(ProtocolError::UnknownNode(REMOTE)))
        ));
        assert_eq!(reconciler.store().snapshot().await, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_config_without_local_node_dropped() -> Result<()> {
        let reconciler = reconciler().await?;
        let message = RadioMessage::Config(device_config(Role::Client));
        let result = reconciler.apply(&message, None).await;
        assert!(matches!(
            result,
            Err(SyncError::Protocol(ProtocolError::NoLocalNode))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_config_upsert_never_duplicates() -> Result<()> {
        let reconciler = reconciler().await?;
        reconciler
            .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
            .await?;

        let first = reconciler
            .apply(
                &decode(admin_config_response(REMOTE, device_config(Role::Client)))?,
                None,
            )
            .await?;
        let second = reconciler
            .apply(
                &decode(admin_config_response(REMOTE, device_config(Role::Router)))?,
                None,
            )
            .await?;

        let kind = SectionKind::Config(ConfigKind::Device);
        assert_eq!(
            first,
            Applied::Config {
                node: REMOTE,
                kind,
                outcome: UpsertOutcome::Created
            }
        );
        assert_eq!(
            second,
            Applied::Config {
                node: REMOTE,
                kind,
                outcome: UpsertOutcome::Updated
            }
        );

        let model = reconciler.store().read().await;
        let node = model.node(REMOTE).context("node missing")?;
        assert_eq!(node.config.count(), 1);
        let device = node.config.device.as_ref().context("no device config")?;
        assert_eq!(device.role, Role::Router as i32);
        assert_eq!(device.role_name(), "Router");
        Ok(())
    }

    #[tokio::test]
    async fn test_node_info_then_lora_config_end_to_end() -> Result<()> {
        let reconciler = reconciler().await?;
        reconciler
            .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
            .await?;
        reconciler
            .apply(
                &decode(admin_config_response(REMOTE, lora_config(RegionCode::Us)))?,
                None,
            )
            .await?;

        let model = reconciler.store().read().await;
        assert_eq!(model.nodes.len(), 1);
        let node = model.node(REMOTE).context("node missing")?;
        assert_eq!(node.display_name(), "Hilltop");
        let lora = node.config.lora.as_ref().context("no lora config")?;
        assert_eq!(lora.region, RegionCode::Us as i32);
        assert_eq!(lora.region_name(), "Us");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_config() -> Result<()> {
        let fail = Arc::new(AtomicBool::new(false));
        let store = Store::open(FlakyBackend { fail: fail.clone() }).await?;
        let reconciler = Reconciler::new(store);
        let mut changes = reconciler.store().subscribe();

        reconciler
            .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
            .await?;
        reconciler
            .apply(
                &decode(admin_config_response(REMOTE, device_config(Role::Client)))?,
                None,
            )
            .await?;
        let committed = reconciler.store().snapshot().await;
        while changes.try_recv().is_ok() {}

        fail.store(true, Ordering::SeqCst);
        let result = reconciler
            .apply(
                &decode(admin_config_response(REMOTE, device_config(Role::Router)))?,
                None,
            )
            .await;

        assert!(matches!(result, Err(SyncError::Persistence(_))));
        assert_eq!(reconciler.store().snapshot().await, committed);
        let model = reconciler.store().read().await;
        let device = model
            .node(REMOTE)
            .and_then(|n| n.config.device.as_ref())
            .context("device config missing")?;
        assert_eq!(device.role, Role::Client as i32);
        assert!(changes.try_recv().is_err(), "rolled back change was published");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_save_removes_created_node() -> Result<()> {
        let fail = Arc::new(AtomicBool::new(true));
        let reconciler = Reconciler::new(Store::open(FlakyBackend { fail }).await?);

        let result = reconciler
            .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
            .await;
        assert!(result.is_err());
        assert!(reconciler.store().read().await.nodes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mqtt_fields_map_by_name() -> Result<()> {
        let reconciler = reconciler().await?;
        reconciler
            .apply(&decode(node_info(LOCAL, "Base"))?, None)
            .await?;

        let mqtt = protobufs::ModuleConfig {
            payload_variant: Some(protobufs::module_config::PayloadVariant::Mqtt(
                protobufs::module_config::MqttConfig {
                    enabled: true,
                    address: "broker.example.org".to_string(),
                    username: "meshdev".to_string(),
                    password: "large4cats".to_string(),
                    ..Default::default()
                },
            )),
        };
        reconciler
            .apply(&RadioMessage::ModuleConfig(mqtt), Some(LOCAL))
            .await?;

        let model = reconciler.store().read().await;
        let stored = model
            .node(LOCAL)
            .and_then(|n| n.config.mqtt.as_ref())
            .context("mqtt config missing")?;
        assert_eq!(stored.address, "broker.example.org");
        assert_eq!(stored.username, "meshdev");
        assert_eq!(stored.password, "large4cats");
        Ok(())
    }

    #[test]
    fn test_section_round_trips_to_wire() -> Result<()> {
        let config = lora_config(RegionCode::Eu868);
        let section = ConfigSection::from_config(config.clone()).context("not tracked")?;
        let crate::config::WireSection::Config(wire) = section.to_wire() else {
            anyhow::bail!("lora should be a radio config");
        };
        assert_eq!(wire, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_telemetry_and_text_recorded() -> Result<()> {
        let reconciler = reconciler().await?;
        let telemetry = protobufs::Telemetry {
            time: 1_700_000_100,
            variant: Some(protobufs::telemetry::Variant::DeviceMetrics(
                protobufs::DeviceMetrics {
                    battery_level: Some(87),
                    voltage: Some(4.01),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        reconciler
            .apply(
                &decode(packet(
                    REMOTE,
                    protobufs::PortNum::TelemetryApp,
                    telemetry.encode_to_vec(),
                    0,
                ))?,
                None,
            )
            .await?;
        reconciler
            .apply(
                &decode(packet(
                    REMOTE,
                    protobufs::PortNum::TextMessageApp,
                    b"anyone on?".to_vec(),
                    0,
                ))?,
                None,
            )
            .await?;

        let model = reconciler.store().read().await;
        let node = model.node(REMOTE).context("node missing")?;
        let sample = node.latest_telemetry().context("no telemetry")?;
        assert_eq!(
            sample.device_metrics.as_ref().and_then(|m| m.battery_level),
            Some(87)
        );
        assert_eq!(sample.time.timestamp(), 1_700_000_100);

        let messages: Vec<_> = model.messages_for(REMOTE).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "anyone on?");
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_clears() -> Result<()> {
        let reconciler = reconciler().await?;
        reconciler
            .apply(&decode(position_packet(REMOTE, 473_977_000, 85_456_000))?, None)
            .await?;
        reconciler
            .apply(
                &decode(packet(
                    REMOTE,
                    protobufs::PortNum::TextMessageApp,
                    b"hi".to_vec(),
                    0,
                ))?,
                None,
            )
            .await?;

        assert_eq!(reconciler.clear_positions(REMOTE).await?, 1);
        assert_eq!(reconciler.delete_messages_for(REMOTE).await?, 1);
        assert!(matches!(
            reconciler.clear_telemetry(0xdead_beef).await,
            Err(SyncError::Protocol(ProtocolError::UnknownNode(0xdead_beef)))
        ));

        {
            let model = reconciler.store().read().await;
            let node = model.node(REMOTE).context("node missing")?;
            assert!(node.positions.is_empty());
            assert!(model.messages.is_empty());
        }

        let mut changes = reconciler.store().subscribe();
        reconciler.clear_all().await?;
        assert!(reconciler.store().read().await.nodes.is_empty());
        assert_eq!(changes.try_recv()?, StoreChange::Cleared);
        Ok(())
    }

    #[tokio::test]
    async fn test_json_backend_persists_across_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mesh.json");

        {
            let store = Store::open(JsonFileBackend::new(&path)).await?;
            let reconciler = Reconciler::new(store.clone());
            reconciler
                .apply(&decode(node_info(REMOTE, "Hilltop"))?, None)
                .await?;
            store.close().await?;
        }

        let reopened = Store::open(JsonFileBackend::new(&path)).await?;
        let model = reopened.read().await;
        let node = model.node(REMOTE).context("node not persisted")?;
        assert_eq!(node.display_name(), "Hilltop");
        assert_eq!(node.id(), "!0badcafe");
        Ok(())
    }
}

#[cfg(test)]
mod manager_tests {
    use super::support::*;
    use crate::config::{ConfigKind, ConfigSection, DeviceConfig};
    use crate::connection::{ConnectionManager, SyncEvent};
    use crate::error::{ConnectionError, HandshakeError, SyncError, TransportError};
    use crate::handshake::HandshakePhase;
    use crate::message::BROADCAST_ADDR;
    use crate::settings::SyncSettings;
    use crate::state::Delivery;
    use crate::store::Store;
    use crate::transport::simulated::{config_complete, default_script};
    use crate::transport::{LinkState, RadioHandle, RadioTransport, SimulatedRadio};
    use anyhow::{Context, Result};
    use meshtastic::protobufs;
    use std::time::Duration;
    use tokio::sync::broadcast;

    async fn manager_with(
        settings: SyncSettings,
    ) -> Result<(ConnectionManager<SimulatedRadio>, RadioHandle)> {
        let (radio, handle) = SimulatedRadio::new(settings.event_capacity);
        handle.advertise(RADIO, Some("Meshtastic_abcd"), Some(-61)).await;
        handle.set_config_script(default_script(LOCAL, "Base Station")).await;
        let store = Store::in_memory().await?;
        let manager = ConnectionManager::new(radio, store, settings)?;
        Ok((manager, handle))
    }

    async fn connected() -> Result<(ConnectionManager<SimulatedRadio>, RadioHandle)> {
        let (mut manager, handle) = manager_with(SyncSettings::default()).await?;
        manager.connect(&RADIO.to_string()).await?;
        Ok((manager, handle))
    }

    async fn synced() -> Result<(ConnectionManager<SimulatedRadio>, RadioHandle)> {
        let (mut manager, handle) = connected().await?;
        manager.sync().await?;
        Ok((manager, handle))
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_sync_populates_store() -> Result<()> {
        let (manager, handle) = synced().await?;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        assert_eq!(manager.link_state(RADIO).await, Some(LinkState::Connected));

        let sent = handle.sent().await;
        assert_eq!(sent.len(), 1);
        let session = manager.session().context("no session")?;
        assert_eq!(
            sent[0].payload_variant,
            Some(protobufs::to_radio::PayloadVariant::WantConfigId(
                session.config_id()
            ))
        );

        let model = manager.store().read().await;
        assert_eq!(model.my_node_num, Some(LOCAL));
        let node = model.my_node().context("local node missing")?;
        assert_eq!(node.display_name(), "Base Station");
        assert_eq!(
            node.my_info
                .as_ref()
                .and_then(|i| i.firmware_version.as_deref()),
            Some("2.5.6.simulated")
        );
        let lora = node.config.lora.as_ref().context("no lora config")?;
        assert_eq!(lora.region_name(), "Us");
        let mqtt = node.config.mqtt.as_ref().context("no mqtt config")?;
        assert_eq!(mqtt.username, "meshdev");
        assert_eq!(mqtt.address, "mqtt.meshtastic.org");
        assert_eq!(model.channels.len(), 1);
        assert!(model.channels[0].has_psk);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_request_rejected_until_disconnect() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let result = manager.request_config().await;
        assert!(matches!(
            result,
            Err(SyncError::Handshake(HandshakeError::AlreadyInProgress))
        ));

        handle.drop_connection().await;
        manager.pump_pending().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);
        assert!(matches!(
            manager.request_config().await,
            Err(SyncError::Handshake(HandshakeError::NotConnected))
        ));

        manager.connect(&RADIO.to_string()).await?;
        manager.sync().await?;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_completion_marker_ignored() -> Result<()> {
        let (mut manager, handle) = connected().await?;
        handle.set_complete_config(false).await;

        let id = manager.request_config().await?;
        manager.pump_pending().await;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Streaming);

        handle.push(config_complete(id.wrapping_sub(1))).await;
        manager.pump_pending().await;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Streaming);

        handle.push(config_complete(id)).await;
        manager.pump_pending().await;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_timeout_resets_to_idle() -> Result<()> {
        let settings = SyncSettings {
            handshake_timeout: Duration::from_millis(50),
            ..SyncSettings::default()
        };
        let (mut manager, handle) = manager_with(settings).await?;
        handle.set_complete_config(false).await;
        manager.connect(&RADIO.to_string()).await?;
        let mut events = manager.subscribe();

        let result = manager.sync().await;
        assert!(matches!(
            result,
            Err(SyncError::Handshake(HandshakeError::TimedOut(_)))
        ));
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);
        assert!(drain(&mut events).contains(&SyncEvent::HandshakeTimedOut));

        // Config is not re-requested on its own, but a new request is allowed.
        assert_eq!(handle.sent().await.len(), 1);
        manager.request_config().await?;
        assert_eq!(handle.sent().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_discovery_single_link() -> Result<()> {
        let (mut manager, handle) = manager_with(SyncSettings::default()).await?;
        let mut events = manager.subscribe();

        manager.start_scan().await?;
        handle.advertise(RADIO, None, Some(-40)).await;
        handle.advertise("radio-2", None, None).await;
        manager.pump_pending().await;
        manager.stop_scan().await?;

        let links = manager.links().await;
        assert_eq!(links.len(), 2);
        let first = links
            .iter()
            .find(|l| l.id == RADIO)
            .context("radio-1 missing")?;
        assert_eq!(first.name, "Meshtastic_abcd");
        assert_eq!(first.rssi, Some(-40));
        let second = links
            .iter()
            .find(|l| l.id == "radio-2")
            .context("radio-2 missing")?;
        assert_eq!(second.name, "Unknown");

        let discovered = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SyncEvent::LinkDiscovered(_)))
            .count();
        assert_eq!(discovered, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_stop_drain() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let mut events = manager.subscribe();

        handle.push_raw(vec![0xff, 0xff, 0xff]).await;
        handle.push(node_info(REMOTE, "Hilltop")).await;
        manager.pump_pending().await;

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(e, SyncEvent::DecodeFailed(_))));
        let model = manager.store().read().await;
        let node = model.node(REMOTE).context("node after bad frame missing")?;
        assert_eq!(node.display_name(), "Hilltop");
        Ok(())
    }

    #[tokio::test]
    async fn test_routing_ack_resolves_pending_command() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let mut events = manager.subscribe();

        let id = manager.reboot(LOCAL, 5).await;
        assert_ne!(id, 0);
        assert_eq!(manager.pending_commands().len(), 1);

        handle
            .push(routing_reply(LOCAL, id, protobufs::routing::Error::None))
            .await;
        manager.pump_pending().await;

        assert!(manager.pending_commands().is_empty());
        let acked = drain(&mut events)
            .into_iter()
            .any(|e| matches!(e, SyncEvent::Acked(command) if command.id == id));
        assert!(acked);
        Ok(())
    }

    #[tokio::test]
    async fn test_routing_error_marks_message_failed() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let mut events = manager.subscribe();

        let id = manager.send_text("ping", LOCAL, 0).await;
        assert_ne!(id, 0);
        handle
            .push(routing_reply(
                LOCAL,
                id,
                protobufs::routing::Error::MaxRetransmit,
            ))
            .await;
        manager.pump_pending().await;

        let nacked = drain(&mut events).into_iter().any(|e| {
            matches!(e, SyncEvent::Nacked { command, reason } if command.id == id && reason == "MaxRetransmit")
        });
        assert!(nacked);

        let model = manager.store().read().await;
        let message = model
            .messages
            .iter()
            .find(|m| m.id == id)
            .context("sent message not stored")?;
        assert_eq!(message.delivery, Delivery::Failed("MaxRetransmit".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_save_config_before_complete_not_sent() -> Result<()> {
        let (mut manager, handle) = connected().await?;
        let section = ConfigSection::Device(DeviceConfig {
            role: protobufs::config::device_config::Role::Router as i32,
            button_gpio: 0,
            buzzer_gpio: 0,
            rebroadcast_mode: 0,
            node_info_broadcast_secs: 900,
            tzdef: String::new(),
            disable_triple_click: false,
        });

        assert_eq!(manager.save_config(LOCAL, section).await, 0);
        assert!(handle.sent().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_config_after_complete_upserts_locally() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let section = {
            let model = manager.store().read().await;
            let mut device = model
                .my_node()
                .and_then(|n| n.config.device.clone())
                .context("no device config after sync")?;
            device.role = protobufs::config::device_config::Role::Router as i32;
            ConfigSection::Device(device)
        };

        let id = manager.save_config(LOCAL, section).await;
        assert_ne!(id, 0);
        assert_eq!(handle.sent().await.len(), 2);

        let model = manager.store().read().await;
        let device = model
            .my_node()
            .and_then(|n| n.config.device.as_ref())
            .context("device config missing")?;
        assert_eq!(device.role_name(), "Router");
        Ok(())
    }

    #[tokio::test]
    async fn test_commands_need_a_destination_user() -> Result<()> {
        let (mut manager, _handle) = synced().await?;
        assert_eq!(
            manager.request_config_section(REMOTE, ConfigKind::LoRa).await,
            0
        );
        assert_ne!(
            manager.request_config_section(LOCAL, ConfigKind::LoRa).await,
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_commands_without_connection_not_sent() -> Result<()> {
        let (mut manager, _handle) = manager_with(SyncSettings::default()).await?;
        assert_eq!(manager.shutdown(LOCAL, 0).await, 0);
        assert_eq!(manager.send_text("hi", LOCAL, 0).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_failure_returns_zero() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        handle.fail_writes(Some("gatt error 133")).await;
        assert_eq!(manager.reboot(LOCAL, 1).await, 0);
        assert!(manager.pending_commands().is_empty());

        handle.fail_writes(None).await;
        handle.hide_toradio(true).await;
        assert_eq!(manager.reboot(LOCAL, 1).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_config_request_returns_to_idle() -> Result<()> {
        let (mut manager, handle) = connected().await?;
        handle.fail_writes(Some("gatt error 133")).await;

        let result = manager.request_config().await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Write(_)))
        ));
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_errors() -> Result<()> {
        let (mut manager, handle) = manager_with(SyncSettings::default()).await?;

        let missing = manager.connect(&"nowhere".to_string()).await;
        assert!(matches!(
            missing,
            Err(SyncError::Transport(TransportError::Connection(
                ConnectionError::LinkNotFound(_)
            )))
        ));

        handle.reject_connections(Some("bonding failed")).await;
        let rejected = manager.connect(&RADIO.to_string()).await;
        assert!(matches!(
            rejected,
            Err(SyncError::Transport(TransportError::Connection(
                ConnectionError::Rejected { .. }
            )))
        ));

        handle.reject_connections(None).await;
        handle.set_powered(false).await;
        let off = manager.connect(&RADIO.to_string()).await;
        assert!(matches!(
            off,
            Err(SyncError::Transport(TransportError::Connection(
                ConnectionError::AdapterOff
            )))
        ));
        assert!(!manager.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_replaces_previous_session() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        handle.advertise("radio-2", Some("Other"), None).await;

        manager.connect(&"radio-2".to_string()).await?;
        manager.pump_pending().await;

        assert!(manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);
        assert_eq!(
            manager.link_state(RADIO).await,
            Some(LinkState::Disconnected)
        );
        assert_eq!(
            manager.link_state("radio-2").await,
            Some(LinkState::Connected)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_same_link_after_disconnect() -> Result<()> {
        let (mut manager, _handle) = synced().await?;
        manager.disconnect().await?;
        manager.connect(&RADIO.to_string()).await?;
        manager.sync().await?;
        manager.pump_pending().await;

        assert!(manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        assert_eq!(manager.link_state(RADIO).await, Some(LinkState::Connected));
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_same_link_while_connected() -> Result<()> {
        let (mut manager, _handle) = synced().await?;
        manager.connect(&RADIO.to_string()).await?;
        manager.pump_pending().await;
        assert!(manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);

        manager.sync().await?;
        manager.pump_pending().await;
        assert!(manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_radio_drop_after_reconnect_still_ends_session() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        manager.connect(&RADIO.to_string()).await?;
        manager.pump_pending().await;

        handle.drop_connection().await;
        manager.pump_pending().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.handshake_phase(), HandshakePhase::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_config_stream_read_without_notification() -> Result<()> {
        let (mut manager, _handle) = connected().await?;
        manager.pump_pending().await;

        // No FROMNUM notification follows want_config_id; the manager reads on its own.
        manager.request_config().await?;
        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        assert_eq!(manager.store().read().await.my_node_num, Some(LOCAL));
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_reads_frames_queued_before_subscribe() -> Result<()> {
        let (mut manager, handle) = manager_with(SyncSettings::default()).await?;
        handle.push(node_info(REMOTE, "Early Bird")).await;

        manager.connect(&RADIO.to_string()).await?;
        let model = manager.store().read().await;
        let node = model.node(REMOTE).context("queued node info not read")?;
        assert_eq!(node.display_name(), "Early Bird");
        Ok(())
    }

    #[tokio::test]
    async fn test_adapter_power_off_ends_session() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        let mut events = manager.subscribe();

        handle.set_powered(false).await;
        manager.pump_pending().await;

        assert!(!manager.is_connected());
        assert!(drain(&mut events).contains(&SyncEvent::AdapterStateChanged { powered: false }));
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_ack_marks_message_delivered() -> Result<()> {
        let (mut manager, handle) = synced().await?;
        handle.set_auto_ack(true).await;

        let id = manager.send_text("hello mesh", BROADCAST_ADDR, 0).await;
        assert_ne!(id, 0);
        manager.pump_pending().await;

        assert!(manager.pending_commands().is_empty());
        let model = manager.store().read().await;
        let message = model
            .messages
            .iter()
            .find(|m| m.id == id)
            .context("sent message not stored")?;
        assert_eq!(message.delivery, Delivery::Acknowledged);
        assert_eq!(message.from, LOCAL);
        Ok(())
    }

    #[tokio::test]
    async fn test_boxed_transport_syncs() -> Result<()> {
        let (radio, handle) = SimulatedRadio::new(64);
        handle.advertise(RADIO, None, None).await;
        handle.set_config_script(default_script(LOCAL, "Boxed")).await;
        let transport: Box<dyn RadioTransport> = Box::new(radio);

        let mut manager =
            ConnectionManager::new(transport, Store::in_memory().await?, SyncSettings::default())?;
        manager.connect(&RADIO.to_string()).await?;
        manager.sync().await?;

        assert_eq!(manager.local_node().await, Some(LOCAL));
        Ok(())
    }

    #[tokio::test]
    async fn test_old_firmware_reported_but_handshake_completes() -> Result<()> {
        let settings = SyncSettings {
            min_firmware_version: "3.0.0".to_string(),
            ..SyncSettings::default()
        };
        let (mut manager, _handle) = manager_with(settings).await?;
        manager.connect(&RADIO.to_string()).await?;
        let mut events = manager.subscribe();

        manager.sync().await?;

        assert_eq!(manager.handshake_phase(), HandshakePhase::Complete);
        let warned = drain(&mut events)
            .into_iter()
            .any(|e| matches!(e, SyncEvent::UnsupportedFirmware { .. }));
        assert!(warned);
        Ok(())
    }
}

#[cfg(test)]
mod settings_tests {
    use crate::config::{ConfigKind, ModuleKind, SectionKind, parse_region, parse_role};
    use crate::settings::{firmware_supported, parse_firmware_version};
    use anyhow::Result;
    use meshtastic::protobufs;
    use std::str::FromStr;

    #[test]
    fn test_firmware_version_parsing() {
        assert_eq!(parse_firmware_version("2.3.15.deb7c27"), Some((2, 3, 15)));
        assert_eq!(parse_firmware_version("2.5"), Some((2, 5, 0)));
        assert_eq!(parse_firmware_version("dev"), None);
        assert!(firmware_supported("2.3.15", "2.0.0"));
        assert!(!firmware_supported("1.3.48", "2.0.0"));
        assert!(firmware_supported("unknown", "2.0.0"));
    }

    #[test]
    fn test_kind_names() -> Result<()> {
        assert_eq!(ConfigKind::LoRa.to_string(), "lora");
        assert_eq!(ConfigKind::from_str("LoRa")?, ConfigKind::LoRa);
        assert_eq!(ModuleKind::RangeTest.to_string(), "range_test");
        assert_eq!(ModuleKind::from_str("mqtt")?, ModuleKind::Mqtt);
        Ok(())
    }

    #[test]
    fn test_section_kind_parsing() -> Result<()> {
        assert_eq!(
            "LoRa".parse::<SectionKind>()?,
            SectionKind::Config(ConfigKind::LoRa)
        );
        assert_eq!(
            "range-test".parse::<SectionKind>()?,
            SectionKind::Module(ModuleKind::RangeTest)
        );
        assert!("gps".parse::<SectionKind>().is_err());
        assert_eq!(SectionKind::all().count(), 12);
        Ok(())
    }

    #[test]
    fn test_region_and_role_parsing() -> Result<()> {
        assert_eq!(
            parse_region("us")?,
            protobufs::config::lo_ra_config::RegionCode::Us as i32
        );
        assert_eq!(
            parse_role("router-client")?,
            protobufs::config::device_config::Role::RouterClient as i32
        );
        assert!(parse_region("atlantis").is_err());
        Ok(())
    }
}
