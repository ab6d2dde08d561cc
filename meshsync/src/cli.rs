use clap::{Parser, Subcommand};
use meshsync_core::SyncSettings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "meshsync")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Radio to connect to: BLE peripheral id or advertised name (first radio found if omitted)
    #[arg(short = 'r', long, global = true, env = "MESHSYNC_RADIO")]
    pub radio: Option<String>,

    /// Talk to an in-process simulated radio instead of Bluetooth
    #[arg(long, global = true, env = "MESHSYNC_SIMULATE")]
    pub simulate: bool,

    /// Node store file
    #[arg(
        short = 's',
        long,
        global = true,
        env = "MESHSYNC_STORE",
        default_value = "meshsync.json"
    )]
    pub store: PathBuf,

    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// How long the radio may take to stream its configuration (e.g. 30s, 1m)
    #[arg(long, global = true, env = "MESHSYNC_HANDSHAKE_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub handshake_timeout: Duration,

    /// How long to listen for advertisements
    #[arg(long, global = true, env = "MESHSYNC_SCAN_DURATION", default_value = "5s", value_parser = humantime::parse_duration)]
    pub scan_duration: Duration,

    /// Connection timeout
    #[arg(short = 't', long, global = true, env = "MESHSYNC_CONNECT_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Hop limit for outbound packets
    #[arg(long, global = true, default_value = "3")]
    pub hop_limit: u32,

    /// Oldest supported radio firmware
    #[arg(long, global = true, default_value = "2.0.0")]
    pub min_firmware: String,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            handshake_timeout: self.handshake_timeout,
            scan_duration: self.scan_duration,
            connect_timeout: self.connect_timeout,
            hop_limit: self.hop_limit,
            min_firmware_version: self.min_firmware.clone(),
            ..SyncSettings::default()
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List radios in range
    Scan,

    /// Connect, download the radio's configuration and node database, and store it
    Sync {
        /// Keep listening for mesh traffic after the sync (e.g. 5m)
        #[arg(short = 'l', long, value_parser = humantime::parse_duration)]
        listen: Option<Duration>,
    },

    /// List stored nodes
    Nodes,

    /// Show one stored node
    Node {
        /// Node id (!a1b2c3d4) or number
        node: String,
    },

    /// Stored and remote configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommands,
    },

    /// Send a text message
    Send {
        /// Message text
        text: String,

        /// Destination node (broadcast if omitted)
        #[arg(short = 'n', long)]
        dest: Option<String>,

        /// Channel index
        #[arg(short = 'c', long, default_value = "0")]
        channel: u32,
    },

    /// Administrative commands
    Admin {
        #[command(subcommand)]
        subcommand: AdminCommands,
    },

    /// Delete stored data
    Clear {
        #[command(subcommand)]
        subcommand: ClearCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show a stored section (e.g. lora, device, mqtt)
    Get {
        section: String,

        /// Node (the connected radio if omitted)
        #[arg(short = 'n', long)]
        node: Option<String>,
    },

    /// List which sections are stored for a node
    List {
        #[arg(short = 'n', long)]
        node: Option<String>,
    },

    /// Ask a node for a section and store the reply
    Request {
        section: String,

        #[arg(short = 'n', long)]
        node: Option<String>,
    },

    /// Set the LoRa region of the connected radio
    SetRegion { region: String },

    /// Set the device role of the connected radio
    SetRole { role: String },
}

#[derive(Subcommand, Debug)]
pub enum AdminCommands {
    /// Reboot a node
    Reboot {
        #[arg(short = 'n', long)]
        node: Option<String>,

        /// Seconds before the reboot
        #[arg(long, default_value = "5")]
        delay: i32,

        /// Confirm the operation
        #[arg(long)]
        confirm: bool,
    },

    /// Shut a node down
    Shutdown {
        #[arg(short = 'n', long)]
        node: Option<String>,

        #[arg(long, default_value = "5")]
        delay: i32,

        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClearCommands {
    /// Forget a node's position history
    Positions { node: String },

    /// Forget a node's telemetry history
    Telemetry { node: String },

    /// Delete messages to or from a node
    Messages { node: String },

    /// Delete broadcast messages on a channel
    Channel { index: u32 },

    /// Forget everything
    All {
        #[arg(long)]
        confirm: bool,
    },
}
