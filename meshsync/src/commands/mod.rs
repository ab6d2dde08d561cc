mod admin;
mod clear;
mod config;
mod message;
mod nodes;
mod scan;
mod sync;

use anyhow::{Context, Result};
use meshsync_core::state::MeshModel;
use meshsync_core::transport::simulated::default_script;
use meshsync_core::{
    ConnectionManager, JsonFileBackend, RadioHandle, RadioLink, RadioTransport, SimulatedRadio,
    Store, SyncEvent, SyncSettings,
};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output::OutputFormat;
use crate::utils::spinner;

const SIMULATED_LINK: &str = "sim-0";
const SIMULATED_NODE: u32 = 0x5eed_0001;

pub async fn handle_command(cli: Cli) -> Result<()> {
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    match &cli.command {
        Commands::Scan => scan::handle_scan(&cli, format).await,
        Commands::Sync { listen } => sync::handle_sync(&cli, *listen, format).await,
        Commands::Nodes => nodes::handle_nodes(&cli, format).await,
        Commands::Node { node } => nodes::handle_node(&cli, node, format).await,
        Commands::Config { subcommand } => config::handle_config(&cli, subcommand, format).await,
        Commands::Send {
            text,
            dest,
            channel,
        } => message::handle_send(&cli, text, dest.as_deref(), *channel, format).await,
        Commands::Admin { subcommand } => admin::handle_admin(&cli, subcommand).await,
        Commands::Clear { subcommand } => clear::handle_clear(&cli, subcommand, format).await,
    }
}

pub async fn open_store(path: &Path) -> Result<Store> {
    Store::open(JsonFileBackend::new(path))
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))
}

/// Resolve `!a1b2c3d4`, `0xa1b2c3d4`, a decimal number, or a stored user id or name.
pub fn resolve_node(model: &MeshModel, node: &str) -> Result<u32> {
    let node = node.trim();
    if let Some(hex) = node.strip_prefix('!').or_else(|| node.strip_prefix("0x")) {
        return u32::from_str_radix(hex, 16).with_context(|| format!("Invalid node id: {node}"));
    }
    if let Ok(num) = node.parse::<u32>() {
        return Ok(num);
    }
    if let Some(found) = model.get_node_by_id(node) {
        return Ok(found.num);
    }
    model
        .nodes
        .values()
        .find(|n| {
            n.user.as_ref().is_some_and(|u| {
                u.long_name.eq_ignore_ascii_case(node) || u.short_name.eq_ignore_ascii_case(node)
            })
        })
        .map(|n| n.num)
        .with_context(|| format!("Unknown node: {node}"))
}

/// Node named on the command line, else the radio the store was last synced with.
pub fn node_or_local(model: &MeshModel, node: Option<&str>) -> Result<u32> {
    match node {
        Some(node) => resolve_node(model, node),
        None => model
            .my_node_num
            .context("No local radio in the store yet; run `meshsync sync` first"),
    }
}

/// A connected, fully synced radio.
pub struct Radio {
    pub manager: ConnectionManager<Box<dyn RadioTransport>>,
    // Plays the radio side in --simulate mode; dropped with the connection.
    _simulator: Option<RadioHandle>,
}

impl Radio {
    pub fn store(&self) -> &Store {
        self.manager.store()
    }

    pub async fn local_node(&self) -> Result<u32> {
        self.manager
            .local_node()
            .await
            .context("Radio did not report its node number")
    }

    /// Process traffic until `done` accepts an event or `limit` passes.
    pub async fn wait_for<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        let mut events = self.manager.subscribe();
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            self.manager.pump_for(Duration::from_millis(200)).await;
            while let Ok(event) = events.try_recv() {
                if done(&event) {
                    return true;
                }
            }
        }
        false
    }

    pub async fn close(mut self) -> Result<()> {
        self.manager.disconnect().await?;
        self.manager.store().close().await?;
        Ok(())
    }
}

async fn transport(
    cli: &Cli,
    settings: &SyncSettings,
) -> Result<(Box<dyn RadioTransport>, Option<RadioHandle>)> {
    if cli.simulate {
        let (radio, handle) = SimulatedRadio::new(settings.event_capacity);
        handle
            .advertise(SIMULATED_LINK, Some("Meshtastic_sim"), Some(-48))
            .await;
        handle
            .set_config_script(default_script(SIMULATED_NODE, "Simulated Radio"))
            .await;
        handle.set_auto_ack(true).await;
        return Ok((Box::new(radio), Some(handle)));
    }
    Ok((bluetooth(settings).await?, None))
}

#[cfg(feature = "bluetooth")]
async fn bluetooth(settings: &SyncSettings) -> Result<Box<dyn RadioTransport>> {
    let transport = meshsync_core::transport::BleTransport::new(settings)
        .await
        .context("Failed to open the Bluetooth adapter")?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "bluetooth"))]
async fn bluetooth(_settings: &SyncSettings) -> Result<Box<dyn RadioTransport>> {
    anyhow::bail!("meshsync was built without Bluetooth support; rebuild with `--features bluetooth` or pass --simulate")
}

/// A manager over the selected transport, not yet connected.
pub async fn manager(
    cli: &Cli,
    store: Store,
) -> Result<(ConnectionManager<Box<dyn RadioTransport>>, Option<RadioHandle>)> {
    let settings = cli.settings();
    let (transport, simulator) = transport(cli, &settings).await?;
    let manager = ConnectionManager::new(transport, store, settings)?;
    Ok((manager, simulator))
}

fn select_link<'a>(links: &'a [RadioLink], wanted: Option<&str>) -> Result<&'a RadioLink> {
    match wanted {
        Some(wanted) => links
            .iter()
            .find(|l| l.id == wanted || l.name.eq_ignore_ascii_case(wanted))
            .with_context(|| format!("Radio {wanted} not found")),
        None => links
            .first()
            .context("No Meshtastic radio found; is it powered on and in range?"),
    }
}

/// Scan, connect and run the configuration handshake.
pub async fn connect(cli: &Cli, format: OutputFormat) -> Result<Radio> {
    let store = open_store(&cli.store).await?;
    let (mut manager, simulator) = manager(cli, store).await?;

    let pb = spinner("Scanning for radios...", format == OutputFormat::Json);
    let scan_duration = if cli.simulate {
        cli.scan_duration.min(Duration::from_millis(250))
    } else {
        cli.scan_duration
    };
    let links = manager.scan_for(scan_duration).await?;
    let link = select_link(&links, cli.radio.as_deref())?.clone();

    pb.set_message(format!("Connecting to {}...", link.name));
    manager.connect(&link.id).await?;

    pb.set_message(format!("Downloading configuration from {}...", link.name));
    let started = Instant::now();
    let synced = manager.sync().await;
    pb.finish_and_clear();
    synced.with_context(|| format!("Failed to sync with {}", link.name))?;
    debug!(
        "Synced with {} in {}",
        link.name,
        humantime::format_duration(Duration::from_millis(started.elapsed().as_millis() as u64))
    );

    Ok(Radio {
        manager,
        _simulator: simulator,
    })
}
