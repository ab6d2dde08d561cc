//! Radio and module configuration sections.
//!
//! Each section mirrors one `Config` or `ModuleConfig` payload variant. Enum
//! valued fields keep the raw wire integer so a stored section converts back
//! to exactly what the radio sent; the `*_name` helpers render them.

use anyhow::{Result, bail};
use meshtastic::protobufs;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Radio configuration kinds streamed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConfigKind {
    Bluetooth,
    Device,
    Display,
    #[strum(serialize = "lora")]
    LoRa,
    Network,
    Position,
}

/// Module configuration kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ModuleKind {
    CannedMessage,
    ExternalNotification,
    Mqtt,
    RangeTest,
    Serial,
    Telemetry,
}

/// Either flavour of section; what `ConfigSection::kind` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Config(ConfigKind),
    Module(ModuleKind),
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SectionKind::Config(kind) => write!(f, "{kind}"),
            SectionKind::Module(kind) => write!(f, "{kind}"),
        }
    }
}

impl std::str::FromStr for SectionKind {
    type Err = anyhow::Error;

    /// Radio config names take precedence; `position` is the radio section.
    fn from_str(value: &str) -> Result<Self> {
        if let Ok(kind) = value.parse::<ConfigKind>() {
            return Ok(SectionKind::Config(kind));
        }
        match value.replace('-', "_").parse::<ModuleKind>() {
            Ok(kind) => Ok(SectionKind::Module(kind)),
            Err(_) => bail!("Unknown config section: {value}"),
        }
    }
}

impl SectionKind {
    pub fn all() -> impl Iterator<Item = SectionKind> {
        ConfigKind::iter()
            .map(SectionKind::Config)
            .chain(ModuleKind::iter().map(SectionKind::Module))
    }
}

impl ConfigKind {
    pub fn admin_request(self) -> protobufs::admin_message::ConfigType {
        use protobufs::admin_message::ConfigType;
        match self {
            ConfigKind::Bluetooth => ConfigType::BluetoothConfig,
            ConfigKind::Device => ConfigType::DeviceConfig,
            ConfigKind::Display => ConfigType::DisplayConfig,
            ConfigKind::LoRa => ConfigType::LoraConfig,
            ConfigKind::Network => ConfigType::NetworkConfig,
            ConfigKind::Position => ConfigType::PositionConfig,
        }
    }
}

impl ModuleKind {
    pub fn admin_request(self) -> protobufs::admin_message::ModuleConfigType {
        use protobufs::admin_message::ModuleConfigType;
        match self {
            ModuleKind::CannedMessage => ModuleConfigType::CannedmsgConfig,
            ModuleKind::ExternalNotification => ModuleConfigType::ExtnotifConfig,
            ModuleKind::Mqtt => ModuleConfigType::MqttConfig,
            ModuleKind::RangeTest => ModuleConfigType::RangetestConfig,
            ModuleKind::Serial => ModuleConfigType::SerialConfig,
            ModuleKind::Telemetry => ModuleConfigType::TelemetryConfig,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub role: i32,
    pub button_gpio: u32,
    pub buzzer_gpio: u32,
    pub rebroadcast_mode: i32,
    pub node_info_broadcast_secs: u32,
    pub tzdef: String,
    pub disable_triple_click: bool,
}

impl DeviceConfig {
    pub fn role_name(&self) -> String {
        let proto = protobufs::config::DeviceConfig {
            role: self.role,
            ..Default::default()
        };
        format!("{:?}", proto.role())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub screen_on_secs: u32,
    pub gps_format: i32,
    pub auto_screen_carousel_secs: u32,
    pub compass_north_top: bool,
    pub flip_screen: bool,
    pub units: i32,
    pub displaymode: i32,
    pub heading_bold: bool,
    pub wake_on_tap_or_motion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub use_preset: bool,
    pub modem_preset: i32,
    pub bandwidth: u32,
    pub spread_factor: u32,
    pub coding_rate: u32,
    pub frequency_offset: f32,
    pub region: i32,
    pub hop_limit: u32,
    pub tx_enabled: bool,
    pub tx_power: i32,
    pub channel_num: u32,
    pub ignore_mqtt: bool,
}

impl LoraConfig {
    pub fn region_name(&self) -> String {
        let proto = protobufs::config::LoRaConfig {
            region: self.region,
            ..Default::default()
        };
        format!("{:?}", proto.region())
    }

    pub fn modem_preset_name(&self) -> String {
        let proto = protobufs::config::LoRaConfig {
            modem_preset: self.modem_preset,
            ..Default::default()
        };
        format!("{:?}", proto.modem_preset())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_enabled: bool,
    pub wifi_ssid: String,
    pub wifi_psk: String,
    pub ntp_server: String,
    pub eth_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub mode: i32,
    pub fixed_pin: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionConfig {
    pub position_broadcast_secs: u32,
    pub position_broadcast_smart_enabled: bool,
    pub fixed_position: bool,
    pub gps_mode: i32,
    pub gps_update_interval: u32,
    pub position_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CannedMessageConfig {
    pub enabled: bool,
    pub send_bell: bool,
    pub rotary1_enabled: bool,
    pub updown1_enabled: bool,
    pub inputbroker_pin_a: u32,
    pub inputbroker_pin_b: u32,
    pub inputbroker_pin_press: u32,
    pub inputbroker_event_cw: i32,
    pub inputbroker_event_ccw: i32,
    pub inputbroker_event_press: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalNotificationConfig {
    pub enabled: bool,
    pub use_pwm: bool,
    pub alert_bell: bool,
    pub alert_bell_buzzer: bool,
    pub alert_bell_vibra: bool,
    pub alert_message: bool,
    pub alert_message_buzzer: bool,
    pub alert_message_vibra: bool,
    pub active: bool,
    pub output: u32,
    pub output_buzzer: u32,
    pub output_vibra: u32,
    pub output_ms: u32,
    pub nag_timeout: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub address: String,
    pub username: String,
    pub password: String,
    pub encryption_enabled: bool,
    pub json_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeTestConfig {
    pub enabled: bool,
    pub sender: u32,
    pub save: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub enabled: bool,
    pub echo: bool,
    pub rxd: u32,
    pub txd: u32,
    pub baud: i32,
    pub timeout: u32,
    pub mode: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub device_update_interval: u32,
    pub environment_update_interval: u32,
    pub environment_measurement_enabled: bool,
    pub environment_screen_enabled: bool,
    pub environment_display_fahrenheit: bool,
}

/// One configuration record of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigSection {
    Bluetooth(BluetoothConfig),
    Device(DeviceConfig),
    Display(DisplayConfig),
    LoRa(LoraConfig),
    Network(NetworkConfig),
    Position(PositionConfig),
    CannedMessage(CannedMessageConfig),
    ExternalNotification(ExternalNotificationConfig),
    Mqtt(MqttConfig),
    RangeTest(RangeTestConfig),
    Serial(SerialConfig),
    Telemetry(TelemetryConfig),
}

/// The wire form of a section, ready to be wrapped in an admin message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireSection {
    Config(protobufs::Config),
    Module(protobufs::ModuleConfig),
}

impl ConfigSection {
    pub fn kind(&self) -> SectionKind {
        match self {
            ConfigSection::Bluetooth(_) => SectionKind::Config(ConfigKind::Bluetooth),
            ConfigSection::Device(_) => SectionKind::Config(ConfigKind::Device),
            ConfigSection::Display(_) => SectionKind::Config(ConfigKind::Display),
            ConfigSection::LoRa(_) => SectionKind::Config(ConfigKind::LoRa),
            ConfigSection::Network(_) => SectionKind::Config(ConfigKind::Network),
            ConfigSection::Position(_) => SectionKind::Config(ConfigKind::Position),
            ConfigSection::CannedMessage(_) => SectionKind::Module(ModuleKind::CannedMessage),
            ConfigSection::ExternalNotification(_) => {
                SectionKind::Module(ModuleKind::ExternalNotification)
            }
            ConfigSection::Mqtt(_) => SectionKind::Module(ModuleKind::Mqtt),
            ConfigSection::RangeTest(_) => SectionKind::Module(ModuleKind::RangeTest),
            ConfigSection::Serial(_) => SectionKind::Module(ModuleKind::Serial),
            ConfigSection::Telemetry(_) => SectionKind::Module(ModuleKind::Telemetry),
        }
    }

    /// Convert a radio config payload. `None` for kinds the client does not track
    /// (power, security, session key, device UI).
    pub fn from_config(config: protobufs::Config) -> Option<Self> {
        use protobufs::config::PayloadVariant;

        let section = match config.payload_variant? {
            PayloadVariant::Device(c) => ConfigSection::Device(DeviceConfig {
                role: c.role,
                button_gpio: c.button_gpio,
                buzzer_gpio: c.buzzer_gpio,
                rebroadcast_mode: c.rebroadcast_mode,
                node_info_broadcast_secs: c.node_info_broadcast_secs,
                tzdef: c.tzdef,
                disable_triple_click: c.disable_triple_click,
            }),
            PayloadVariant::Position(c) => ConfigSection::Position(PositionConfig {
                position_broadcast_secs: c.position_broadcast_secs,
                position_broadcast_smart_enabled: c.position_broadcast_smart_enabled,
                fixed_position: c.fixed_position,
                gps_mode: c.gps_mode,
                gps_update_interval: c.gps_update_interval,
                position_flags: c.position_flags,
            }),
            PayloadVariant::Network(c) => ConfigSection::Network(NetworkConfig {
                wifi_enabled: c.wifi_enabled,
                wifi_ssid: c.wifi_ssid,
                wifi_psk: c.wifi_psk,
                ntp_server: c.ntp_server,
                eth_enabled: c.eth_enabled,
            }),
            PayloadVariant::Display(c) => ConfigSection::Display(DisplayConfig {
                screen_on_secs: c.screen_on_secs,
                gps_format: c.gps_format,
                auto_screen_carousel_secs: c.auto_screen_carousel_secs,
                compass_north_top: c.compass_north_top,
                flip_screen: c.flip_screen,
                units: c.units,
                displaymode: c.displaymode,
                heading_bold: c.heading_bold,
                wake_on_tap_or_motion: c.wake_on_tap_or_motion,
            }),
            PayloadVariant::Lora(c) => ConfigSection::LoRa(LoraConfig {
                use_preset: c.use_preset,
                modem_preset: c.modem_preset,
                bandwidth: c.bandwidth,
                spread_factor: c.spread_factor,
                coding_rate: c.coding_rate,
                frequency_offset: c.frequency_offset,
                region: c.region,
                hop_limit: c.hop_limit,
                tx_enabled: c.tx_enabled,
                tx_power: c.tx_power,
                channel_num: c.channel_num,
                ignore_mqtt: c.ignore_mqtt,
            }),
            PayloadVariant::Bluetooth(c) => ConfigSection::Bluetooth(BluetoothConfig {
                enabled: c.enabled,
                mode: c.mode,
                fixed_pin: c.fixed_pin,
            }),
            _ => return None,
        };

        Some(section)
    }

    /// Convert a module config payload. `None` for modules the client does not track.
    pub fn from_module_config(config: protobufs::ModuleConfig) -> Option<Self> {
        use protobufs::module_config::PayloadVariant;

        let section = match config.payload_variant? {
            PayloadVariant::CannedMessage(c) => ConfigSection::CannedMessage(CannedMessageConfig {
                enabled: c.enabled,
                send_bell: c.send_bell,
                rotary1_enabled: c.rotary1_enabled,
                updown1_enabled: c.updown1_enabled,
                inputbroker_pin_a: c.inputbroker_pin_a,
                inputbroker_pin_b: c.inputbroker_pin_b,
                inputbroker_pin_press: c.inputbroker_pin_press,
                inputbroker_event_cw: c.inputbroker_event_cw,
                inputbroker_event_ccw: c.inputbroker_event_ccw,
                inputbroker_event_press: c.inputbroker_event_press,
            }),
            PayloadVariant::ExternalNotification(c) => {
                ConfigSection::ExternalNotification(ExternalNotificationConfig {
                    enabled: c.enabled,
                    use_pwm: c.use_pwm,
                    alert_bell: c.alert_bell,
                    alert_bell_buzzer: c.alert_bell_buzzer,
                    alert_bell_vibra: c.alert_bell_vibra,
                    alert_message: c.alert_message,
                    alert_message_buzzer: c.alert_message_buzzer,
                    alert_message_vibra: c.alert_message_vibra,
                    active: c.active,
                    output: c.output,
                    output_buzzer: c.output_buzzer,
                    output_vibra: c.output_vibra,
                    output_ms: c.output_ms,
                    nag_timeout: c.nag_timeout,
                })
            }
            PayloadVariant::Mqtt(c) => ConfigSection::Mqtt(MqttConfig {
                enabled: c.enabled,
                address: c.address,
                username: c.username,
                password: c.password,
                encryption_enabled: c.encryption_enabled,
                json_enabled: c.json_enabled,
            }),
            PayloadVariant::RangeTest(c) => ConfigSection::RangeTest(RangeTestConfig {
                enabled: c.enabled,
                sender: c.sender,
                save: c.save,
            }),
            PayloadVariant::Serial(c) => ConfigSection::Serial(SerialConfig {
                enabled: c.enabled,
                echo: c.echo,
                rxd: c.rxd,
                txd: c.txd,
                baud: c.baud,
                timeout: c.timeout,
                mode: c.mode,
            }),
            PayloadVariant::Telemetry(c) => ConfigSection::Telemetry(TelemetryConfig {
                device_update_interval: c.device_update_interval,
                environment_update_interval: c.environment_update_interval,
                environment_measurement_enabled: c.environment_measurement_enabled,
                environment_screen_enabled: c.environment_screen_enabled,
                environment_display_fahrenheit: c.environment_display_fahrenheit,
            }),
            _ => return None,
        };

        Some(section)
    }

    pub fn to_wire(&self) -> WireSection {
        use protobufs::config::PayloadVariant as Cfg;
        use protobufs::module_config::PayloadVariant as Module;

        let config = |variant: Cfg| {
            WireSection::Config(protobufs::Config {
                payload_variant: Some(variant),
            })
        };
        let module = |variant: Module| {
            WireSection::Module(protobufs::ModuleConfig {
                payload_variant: Some(variant),
            })
        };

        match self {
            ConfigSection::Device(c) => config(Cfg::Device(protobufs::config::DeviceConfig {
                role: c.role,
                button_gpio: c.button_gpio,
                buzzer_gpio: c.buzzer_gpio,
                rebroadcast_mode: c.rebroadcast_mode,
                node_info_broadcast_secs: c.node_info_broadcast_secs,
                tzdef: c.tzdef.clone(),
                disable_triple_click: c.disable_triple_click,
                ..Default::default()
            })),
            ConfigSection::Position(c) => {
                config(Cfg::Position(protobufs::config::PositionConfig {
                    position_broadcast_secs: c.position_broadcast_secs,
                    position_broadcast_smart_enabled: c.position_broadcast_smart_enabled,
                    fixed_position: c.fixed_position,
                    gps_mode: c.gps_mode,
                    gps_update_interval: c.gps_update_interval,
                    position_flags: c.position_flags,
                    ..Default::default()
                }))
            }
            ConfigSection::Network(c) => config(Cfg::Network(protobufs::config::NetworkConfig {
                wifi_enabled: c.wifi_enabled,
                wifi_ssid: c.wifi_ssid.clone(),
                wifi_psk: c.wifi_psk.clone(),
                ntp_server: c.ntp_server.clone(),
                eth_enabled: c.eth_enabled,
                ..Default::default()
            })),
            ConfigSection::Display(c) => config(Cfg::Display(protobufs::config::DisplayConfig {
                screen_on_secs: c.screen_on_secs,
                gps_format: c.gps_format,
                auto_screen_carousel_secs: c.auto_screen_carousel_secs,
                compass_north_top: c.compass_north_top,
                flip_screen: c.flip_screen,
                units: c.units,
                displaymode: c.displaymode,
                heading_bold: c.heading_bold,
                wake_on_tap_or_motion: c.wake_on_tap_or_motion,
                ..Default::default()
            })),
            ConfigSection::LoRa(c) => config(Cfg::Lora(protobufs::config::LoRaConfig {
                use_preset: c.use_preset,
                modem_preset: c.modem_preset,
                bandwidth: c.bandwidth,
                spread_factor: c.spread_factor,
                coding_rate: c.coding_rate,
                frequency_offset: c.frequency_offset,
                region: c.region,
                hop_limit: c.hop_limit,
                tx_enabled: c.tx_enabled,
                tx_power: c.tx_power,
                channel_num: c.channel_num,
                ignore_mqtt: c.ignore_mqtt,
                ..Default::default()
            })),
            ConfigSection::Bluetooth(c) => {
                config(Cfg::Bluetooth(protobufs::config::BluetoothConfig {
                    enabled: c.enabled,
                    mode: c.mode,
                    fixed_pin: c.fixed_pin,
                    ..Default::default()
                }))
            }
            ConfigSection::CannedMessage(c) => module(Module::CannedMessage(
                protobufs::module_config::CannedMessageConfig {
                    enabled: c.enabled,
                    send_bell: c.send_bell,
                    rotary1_enabled: c.rotary1_enabled,
                    updown1_enabled: c.updown1_enabled,
                    inputbroker_pin_a: c.inputbroker_pin_a,
                    inputbroker_pin_b: c.inputbroker_pin_b,
                    inputbroker_pin_press: c.inputbroker_pin_press,
                    inputbroker_event_cw: c.inputbroker_event_cw,
                    inputbroker_event_ccw: c.inputbroker_event_ccw,
                    inputbroker_event_press: c.inputbroker_event_press,
                    ..Default::default()
                },
            )),
            ConfigSection::ExternalNotification(c) => module(Module::ExternalNotification(
                protobufs::module_config::ExternalNotificationConfig {
                    enabled: c.enabled,
                    use_pwm: c.use_pwm,
                    alert_bell: c.alert_bell,
                    alert_bell_buzzer: c.alert_bell_buzzer,
                    alert_bell_vibra: c.alert_bell_vibra,
                    alert_message: c.alert_message,
                    alert_message_buzzer: c.alert_message_buzzer,
                    alert_message_vibra: c.alert_message_vibra,
                    active: c.active,
                    output: c.output,
                    output_buzzer: c.output_buzzer,
                    output_vibra: c.output_vibra,
                    output_ms: c.output_ms,
                    nag_timeout: c.nag_timeout,
                    ..Default::default()
                },
            )),
            ConfigSection::Mqtt(c) => {
                module(Module::Mqtt(protobufs::module_config::MqttConfig {
                    enabled: c.enabled,
                    address: c.address.clone(),
                    username: c.username.clone(),
                    password: c.password.clone(),
                    encryption_enabled: c.encryption_enabled,
                    json_enabled: c.json_enabled,
                    ..Default::default()
                }))
            }
            ConfigSection::RangeTest(c) => module(Module::RangeTest(
                protobufs::module_config::RangeTestConfig {
                    enabled: c.enabled,
                    sender: c.sender,
                    save: c.save,
                    ..Default::default()
                },
            )),
            ConfigSection::Serial(c) => {
                module(Module::Serial(protobufs::module_config::SerialConfig {
                    enabled: c.enabled,
                    echo: c.echo,
                    rxd: c.rxd,
                    txd: c.txd,
                    baud: c.baud,
                    timeout: c.timeout,
                    mode: c.mode,
                    ..Default::default()
                }))
            }
            ConfigSection::Telemetry(c) => module(Module::Telemetry(
                protobufs::module_config::TelemetryConfig {
                    device_update_interval: c.device_update_interval,
                    environment_update_interval: c.environment_update_interval,
                    environment_measurement_enabled: c.environment_measurement_enabled,
                    environment_screen_enabled: c.environment_screen_enabled,
                    environment_display_fahrenheit: c.environment_display_fahrenheit,
                    ..Default::default()
                },
            )),
        }
    }
}

/// Whether an upsert created the section or updated it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// The per-node section slots; at most one live section per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSections {
    pub bluetooth: Option<BluetoothConfig>,
    pub device: Option<DeviceConfig>,
    pub display: Option<DisplayConfig>,
    pub lora: Option<LoraConfig>,
    pub network: Option<NetworkConfig>,
    pub position: Option<PositionConfig>,
    pub canned_message: Option<CannedMessageConfig>,
    pub external_notification: Option<ExternalNotificationConfig>,
    pub mqtt: Option<MqttConfig>,
    pub range_test: Option<RangeTestConfig>,
    pub serial: Option<SerialConfig>,
    pub telemetry: Option<TelemetryConfig>,
}

fn fill<T>(slot: &mut Option<T>, value: T) -> UpsertOutcome {
    match slot {
        Some(existing) => {
            *existing = value;
            UpsertOutcome::Updated
        }
        None => {
            *slot = Some(value);
            UpsertOutcome::Created
        }
    }
}

impl ConfigSections {
    pub fn upsert(&mut self, section: ConfigSection) -> UpsertOutcome {
        match section {
            ConfigSection::Bluetooth(c) => fill(&mut self.bluetooth, c),
            ConfigSection::Device(c) => fill(&mut self.device, c),
            ConfigSection::Display(c) => fill(&mut self.display, c),
            ConfigSection::LoRa(c) => fill(&mut self.lora, c),
            ConfigSection::Network(c) => fill(&mut self.network, c),
            ConfigSection::Position(c) => fill(&mut self.position, c),
            ConfigSection::CannedMessage(c) => fill(&mut self.canned_message, c),
            ConfigSection::ExternalNotification(c) => fill(&mut self.external_notification, c),
            ConfigSection::Mqtt(c) => fill(&mut self.mqtt, c),
            ConfigSection::RangeTest(c) => fill(&mut self.range_test, c),
            ConfigSection::Serial(c) => fill(&mut self.serial, c),
            ConfigSection::Telemetry(c) => fill(&mut self.telemetry, c),
        }
    }

    pub fn get(&self, kind: SectionKind) -> Option<ConfigSection> {
        match kind {
            SectionKind::Config(kind) => match kind {
                ConfigKind::Bluetooth => self.bluetooth.clone().map(ConfigSection::Bluetooth),
                ConfigKind::Device => self.device.clone().map(ConfigSection::Device),
                ConfigKind::Display => self.display.clone().map(ConfigSection::Display),
                ConfigKind::LoRa => self.lora.clone().map(ConfigSection::LoRa),
                ConfigKind::Network => self.network.clone().map(ConfigSection::Network),
                ConfigKind::Position => self.position.clone().map(ConfigSection::Position),
            },
            SectionKind::Module(kind) => match kind {
                ModuleKind::CannedMessage => {
                    self.canned_message.clone().map(ConfigSection::CannedMessage)
                }
                ModuleKind::ExternalNotification => self
                    .external_notification
                    .clone()
                    .map(ConfigSection::ExternalNotification),
                ModuleKind::Mqtt => self.mqtt.clone().map(ConfigSection::Mqtt),
                ModuleKind::RangeTest => self.range_test.clone().map(ConfigSection::RangeTest),
                ModuleKind::Serial => self.serial.clone().map(ConfigSection::Serial),
                ModuleKind::Telemetry => self.telemetry.clone().map(ConfigSection::Telemetry),
            },
        }
    }

    pub fn count(&self) -> usize {
        [
            self.bluetooth.is_some(),
            self.device.is_some(),
            self.display.is_some(),
            self.lora.is_some(),
            self.network.is_some(),
            self.position.is_some(),
            self.canned_message.is_some(),
            self.external_notification.is_some(),
            self.mqtt.is_some(),
            self.range_test.is_some(),
            self.serial.is_some(),
            self.telemetry.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

/// Parse a region name as accepted on the command line.
pub fn parse_region(value: &str) -> Result<i32> {
    use protobufs::config::lo_ra_config::RegionCode;

    let region = match value.to_uppercase().as_str() {
        "UNSET" => RegionCode::Unset,
        "US" | "US915" => RegionCode::Us,
        "EU" | "EU433" => RegionCode::Eu433,
        "EU868" | "EU_868" => RegionCode::Eu868,
        "CN" => RegionCode::Cn,
        "JP" => RegionCode::Jp,
        "ANZ" => RegionCode::Anz,
        "KR" => RegionCode::Kr,
        "TW" => RegionCode::Tw,
        "RU" => RegionCode::Ru,
        "IN" => RegionCode::In,
        "NZ865" | "NZ_865" => RegionCode::Nz865,
        "TH" => RegionCode::Th,
        "UA433" | "UA_433" => RegionCode::Ua433,
        "UA868" | "UA_868" => RegionCode::Ua868,
        "MY_433" => RegionCode::My433,
        "MY_919" => RegionCode::My919,
        "SG_923" => RegionCode::Sg923,
        "LORA_24" => RegionCode::Lora24,
        _ => bail!("Unknown region: {value}"),
    };

    Ok(region as i32)
}

/// Parse a device role name as accepted on the command line.
pub fn parse_role(value: &str) -> Result<i32> {
    use protobufs::config::device_config::Role;

    let role = match value.to_uppercase().replace('-', "_").as_str() {
        "CLIENT" => Role::Client,
        "CLIENT_MUTE" => Role::ClientMute,
        "ROUTER" => Role::Router,
        "ROUTER_CLIENT" => Role::RouterClient,
        "REPEATER" => Role::Repeater,
        "TRACKER" => Role::Tracker,
        "SENSOR" => Role::Sensor,
        "TAK" => Role::Tak,
        "CLIENT_HIDDEN" => Role::ClientHidden,
        "LOST_AND_FOUND" => Role::LostAndFound,
        "TAK_TRACKER" => Role::TakTracker,
        _ => bail!("Unknown role: {value}"),
    };

    Ok(role as i32)
}
