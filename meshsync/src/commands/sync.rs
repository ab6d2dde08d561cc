use anyhow::Result;
use colored::*;
use comfy_table::Cell;
use meshsync_core::store::StoreChange;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use super::Radio;
use crate::cli::Cli;
use crate::output::{OutputFormat, create_table, print_output};
use crate::utils::{print_info, print_success};

#[derive(Debug, Serialize)]
struct SyncSummary {
    node_id: String,
    long_name: String,
    firmware_version: Option<String>,
    config_sections: usize,
    nodes: usize,
    channels: usize,
    messages: usize,
}

pub async fn handle_sync(cli: &Cli, listen: Option<Duration>, format: OutputFormat) -> Result<()> {
    let mut radio = super::connect(cli, format).await?;
    let summary = summarize(&radio).await?;

    match format {
        OutputFormat::Json => print_output(&summary, format),
        OutputFormat::Table => {
            print_success(&format!("Synced with {}", summary.long_name));
            let mut table = create_table();
            table.set_header(vec![Cell::new("Property"), Cell::new("Value")]);
            table.add_row(vec![Cell::new("Node ID"), Cell::new(&summary.node_id)]);
            table.add_row(vec![
                Cell::new("Firmware"),
                Cell::new(summary.firmware_version.as_deref().unwrap_or("Unknown")),
            ]);
            table.add_row(vec![
                Cell::new("Config Sections"),
                Cell::new(summary.config_sections),
            ]);
            table.add_row(vec![Cell::new("Nodes"), Cell::new(summary.nodes)]);
            table.add_row(vec![Cell::new("Channels"), Cell::new(summary.channels)]);
            table.add_row(vec![Cell::new("Messages"), Cell::new(summary.messages)]);
            println!("{table}");
        }
    }

    if let Some(limit) = listen {
        listen_for(&mut radio, limit, format).await;
    }

    radio.close().await
}

async fn summarize(radio: &Radio) -> Result<SyncSummary> {
    let local = radio.local_node().await?;
    let model = radio.store().read().await;
    let node = model.node(local);

    Ok(SyncSummary {
        node_id: format!("!{local:08x}"),
        long_name: node
            .map(|n| n.display_name())
            .unwrap_or_else(|| format!("!{local:08x}")),
        firmware_version: node
            .and_then(|n| n.my_info.as_ref())
            .and_then(|i| i.firmware_version.clone()),
        config_sections: node.map(|n| n.config.count()).unwrap_or(0),
        nodes: model.nodes.len(),
        channels: model.channels.len(),
        messages: model.messages.len(),
    })
}

async fn listen_for(radio: &mut Radio, limit: Duration, format: OutputFormat) {
    print_info(&format!(
        "Listening for {} (Ctrl-C to stop)",
        humantime::format_duration(limit)
    ));

    let mut changes = radio.store().subscribe();
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        radio.manager.pump_for(Duration::from_secs(1)).await;
        while let Ok(change) = changes.try_recv() {
            report(radio, change, format).await;
        }
    }
}

async fn report(radio: &Radio, change: StoreChange, format: OutputFormat) {
    let model = radio.store().read().await;
    match change {
        StoreChange::MessageAdded(id) => {
            let Some(message) = model.messages.iter().rev().find(|m| m.id == id) else {
                return;
            };
            if format == OutputFormat::Json {
                print_output(message, format);
                return;
            }
            let sender = model
                .node(message.from)
                .map(|n| n.display_name())
                .unwrap_or_else(|| format!("!{:08x}", message.from));
            println!(
                "{time} {sender}: {text}",
                time = message.rx_time.format("%H:%M:%S").to_string().dimmed(),
                sender = sender.cyan().bold(),
                text = message.text
            );
        }
        StoreChange::PositionAdded(num) => {
            let Some(node) = model.node(num) else { return };
            if let Some(position) = node.latest_position() {
                if format == OutputFormat::Json {
                    print_output(position, format);
                    return;
                }
                println!(
                    "{} {} at {:.5}, {:.5}",
                    "position".green(),
                    node.display_name(),
                    position.latitude(),
                    position.longitude()
                );
            }
        }
        StoreChange::TelemetryAdded(num) => {
            let Some(node) = model.node(num) else { return };
            if let Some(sample) = node.latest_telemetry() {
                if format == OutputFormat::Json {
                    print_output(sample, format);
                    return;
                }
                let battery = sample
                    .device_metrics
                    .as_ref()
                    .and_then(|m| m.battery_level)
                    .map(|b| format!("battery {b}%"))
                    .unwrap_or_else(|| "environment".to_string());
                println!(
                    "{} {} {battery}",
                    "telemetry".yellow(),
                    node.display_name()
                );
            }
        }
        StoreChange::NodeUpdated(num) if format == OutputFormat::Table => {
            if let Some(node) = model.node(num) {
                println!("{} {}", "node".blue(), node.display_name());
            }
        }
        _ => {}
    }
}
