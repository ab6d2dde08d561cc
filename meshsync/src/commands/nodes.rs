use anyhow::{Context, Result};
use colored::*;
use comfy_table::Cell;
use meshsync_core::state::Node;

use super::{open_store, resolve_node};
use crate::cli::Cli;
use crate::output::{OutputFormat, create_table, format_age, format_optional, print_output};
use crate::utils::print_info;

pub async fn handle_nodes(cli: &Cli, format: OutputFormat) -> Result<()> {
    let store = open_store(&cli.store).await?;
    let model = store.read().await;

    if model.nodes.is_empty() {
        print_info("No nodes stored; run `meshsync sync` first");
        return Ok(());
    }

    let mut nodes: Vec<&Node> = model.nodes.values().collect();
    nodes.sort_by(|a, b| b.last_heard.cmp(&a.last_heard));

    match format {
        OutputFormat::Json => print_output(&nodes, format),
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec![
                Cell::new("ID"),
                Cell::new("User"),
                Cell::new("Hardware"),
                Cell::new("SNR"),
                Cell::new("Battery"),
                Cell::new("Last Heard"),
            ]);

            for node in nodes {
                let local = model.my_node_num == Some(node.num);
                let battery = node
                    .latest_telemetry()
                    .and_then(|t| t.device_metrics.as_ref())
                    .and_then(|m| m.battery_level)
                    .map(|b| format!("{b}%"));
                table.add_row(vec![
                    Cell::new(if local {
                        format!("{} *", node.id())
                    } else {
                        node.id()
                    }),
                    Cell::new(node.display_name()),
                    Cell::new(
                        node.user
                            .as_ref()
                            .map(|u| u.hw_model.clone())
                            .unwrap_or_default(),
                    ),
                    Cell::new(format_optional(node.snr.map(|s| format!("{s:.1}")))),
                    Cell::new(format_optional(battery)),
                    Cell::new(format_age(node.last_heard)),
                ]);
            }

            println!("{table}");
        }
    }

    Ok(())
}

pub async fn handle_node(cli: &Cli, node: &str, format: OutputFormat) -> Result<()> {
    let store = open_store(&cli.store).await?;
    let model = store.read().await;
    let num = resolve_node(&model, node)?;
    let node = model
        .node(num)
        .with_context(|| format!("No node !{num:08x} in the store"))?;

    if format == OutputFormat::Json {
        print_output(node, format);
        return Ok(());
    }

    println!("{}", node.display_name().bold());
    let mut table = create_table();
    table.set_header(vec![Cell::new("Property"), Cell::new("Value")]);
    table.add_row(vec![Cell::new("Node ID"), Cell::new(node.id())]);
    table.add_row(vec![Cell::new("Node Number"), Cell::new(node.num)]);
    if let Some(user) = &node.user {
        table.add_row(vec![Cell::new("Short Name"), Cell::new(&user.short_name)]);
        table.add_row(vec![Cell::new("Hardware"), Cell::new(&user.hw_model)]);
        if !user.macaddr.is_empty() {
            table.add_row(vec![Cell::new("MAC"), Cell::new(&user.macaddr)]);
        }
    }
    if let Some(info) = &node.my_info {
        table.add_row(vec![
            Cell::new("Firmware"),
            Cell::new(info.firmware_version.as_deref().unwrap_or("Unknown")),
        ]);
        table.add_row(vec![Cell::new("Reboots"), Cell::new(info.reboot_count)]);
    }
    table.add_row(vec![Cell::new("Last Heard"), Cell::new(format_age(node.last_heard))]);
    table.add_row(vec![
        Cell::new("SNR"),
        Cell::new(format_optional(node.snr.map(|s| format!("{s:.1} dB")))),
    ]);
    if let Some(position) = node.latest_position() {
        table.add_row(vec![
            Cell::new("Position"),
            Cell::new(format!(
                "{:.6}, {:.6} ({} fixes)",
                position.latitude(),
                position.longitude(),
                node.positions.len()
            )),
        ]);
        table.add_row(vec![
            Cell::new("Altitude"),
            Cell::new(format_optional(position.altitude.map(|a| format!("{a} m")))),
        ]);
    }
    if let Some(metrics) = node
        .latest_telemetry()
        .and_then(|t| t.device_metrics.as_ref())
    {
        table.add_row(vec![
            Cell::new("Battery"),
            Cell::new(format_optional(metrics.battery_level.map(|b| format!("{b}%")))),
        ]);
        table.add_row(vec![
            Cell::new("Voltage"),
            Cell::new(format_optional(metrics.voltage.map(|v| format!("{v:.2} V")))),
        ]);
    }
    if let Some(env) = node
        .telemetry
        .iter()
        .rev()
        .find_map(|t| t.environment_metrics.as_ref())
    {
        table.add_row(vec![
            Cell::new("Temperature"),
            Cell::new(format_optional(env.temperature.map(|t| format!("{t:.1} °C")))),
        ]);
        table.add_row(vec![
            Cell::new("Humidity"),
            Cell::new(format_optional(env.relative_humidity.map(|h| format!("{h:.0}%")))),
        ]);
    }
    table.add_row(vec![
        Cell::new("Config Sections"),
        Cell::new(node.config.count()),
    ]);
    table.add_row(vec![
        Cell::new("Messages"),
        Cell::new(model.messages_for(num).count()),
    ]);
    println!("{table}");

    Ok(())
}
