use anyhow::{Context, Result, bail};
use colored::*;
use comfy_table::Cell;
use meshsync_core::config::{parse_region, parse_role};
use meshsync_core::reconcile::Applied;
use meshsync_core::{ConfigKind, ConfigSection, SectionKind, SyncEvent};

use super::{Radio, node_or_local, open_store, resolve_node};
use crate::cli::{Cli, ConfigCommands};
use crate::output::{OutputFormat, create_table, print_output};
use crate::utils::{print_info, print_success, print_warning};

pub async fn handle_config(
    cli: &Cli,
    subcommand: &ConfigCommands,
    format: OutputFormat,
) -> Result<()> {
    match subcommand {
        ConfigCommands::Get { section, node } => {
            let kind: SectionKind = section.parse()?;
            let store = open_store(&cli.store).await?;
            let model = store.read().await;
            let num = node_or_local(&model, node.as_deref())?;
            let stored = model
                .node(num)
                .and_then(|n| n.config.get(kind))
                .with_context(|| format!("No {kind} config stored for !{num:08x}"))?;
            print_section(&stored, format)?;
        }

        ConfigCommands::List { node } => {
            let store = open_store(&cli.store).await?;
            let model = store.read().await;
            let num = node_or_local(&model, node.as_deref())?;
            let node = model
                .node(num)
                .with_context(|| format!("No node !{num:08x} in the store"))?;

            let stored: Vec<String> = SectionKind::all()
                .filter(|kind| node.config.get(*kind).is_some())
                .map(|kind| kind.to_string())
                .collect();

            match format {
                OutputFormat::Json => print_output(&stored, format),
                OutputFormat::Table => {
                    let mut table = create_table();
                    table.set_header(vec![Cell::new("Section"), Cell::new("Stored")]);
                    for kind in SectionKind::all() {
                        let present = node.config.get(kind).is_some();
                        table.add_row(vec![
                            Cell::new(kind.to_string()),
                            Cell::new(if present { "Yes" } else { "No" }),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        ConfigCommands::Request { section, node } => {
            let kind: SectionKind = section.parse()?;
            let mut radio = super::connect(cli, format).await?;
            let num = match node {
                Some(node) => resolve_node(&*radio.store().read().await, node)?,
                None => radio.local_node().await?,
            };

            let id = match kind {
                SectionKind::Config(kind) => radio.manager.request_config_section(num, kind).await,
                SectionKind::Module(kind) => radio.manager.request_module_config(num, kind).await,
            };
            if id == 0 {
                bail!("Could not send the {kind} request to !{num:08x}");
            }

            let limit = cli.handshake_timeout;
            let answered = radio
                .wait_for(limit, |event| {
                    matches!(event, SyncEvent::Applied(Applied::Config { node, kind: got, .. })
                        if *node == num && *got == kind)
                })
                .await;
            if !answered {
                radio.close().await?;
                bail!(
                    "!{num:08x} did not answer within {}",
                    humantime::format_duration(limit)
                );
            }

            let stored = radio
                .store()
                .read()
                .await
                .node(num)
                .and_then(|n| n.config.get(kind));
            radio.close().await?;
            if let Some(stored) = stored {
                print_section(&stored, format)?;
            }
        }

        ConfigCommands::SetRegion { region } => {
            let region = parse_region(region)?;
            let kind = SectionKind::Config(ConfigKind::LoRa);
            save_local(cli, format, kind, |section| {
                if let ConfigSection::LoRa(lora) = section {
                    lora.region = region;
                }
            })
            .await?;
        }

        ConfigCommands::SetRole { role } => {
            let role = parse_role(role)?;
            let kind = SectionKind::Config(ConfigKind::Device);
            save_local(cli, format, kind, |section| {
                if let ConfigSection::Device(device) = section {
                    device.role = role;
                }
            })
            .await?;
        }
    }

    Ok(())
}

/// Edit the connected radio's stored `kind` section and write it back.
async fn save_local<F>(cli: &Cli, format: OutputFormat, kind: SectionKind, edit: F) -> Result<()>
where
    F: FnOnce(&mut ConfigSection),
{
    let mut radio = super::connect(cli, format).await?;
    let num = radio.local_node().await?;
    let mut section = radio
        .store()
        .read()
        .await
        .node(num)
        .and_then(|n| n.config.get(kind))
        .with_context(|| format!("Radio did not report its {kind} config"))?;
    edit(&mut section);

    let id = radio.manager.save_config(num, section).await;
    if id == 0 {
        radio.close().await?;
        bail!("Could not send the {kind} config to the radio");
    }

    wait_for_ack(&mut radio, id, cli.handshake_timeout).await;
    radio.close().await?;
    print_success(&format!("{kind} config saved"));
    println!(
        "{}",
        "Note: Some settings may require a device reboot to take effect".yellow()
    );
    Ok(())
}

/// Report the routing reply for request `id`, if one arrives.
pub async fn wait_for_ack(radio: &mut Radio, id: u32, limit: std::time::Duration) {
    let mut outcome = None;
    radio
        .wait_for(limit, |event| match event {
            SyncEvent::Acked(command) if command.id == id => {
                outcome = Some(Ok(()));
                true
            }
            SyncEvent::Nacked { command, reason } if command.id == id => {
                outcome = Some(Err(reason.clone()));
                true
            }
            _ => false,
        })
        .await;

    match outcome {
        Some(Ok(())) => print_info("Radio acknowledged the request"),
        Some(Err(reason)) => print_warning(&format!("Radio reported an error: {reason}")),
        None => print_warning("No acknowledgement received"),
    }
}

fn print_section(section: &ConfigSection, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        print_output(section, format);
        return Ok(());
    }

    // Externally tagged: {"LoRa": {...}}
    let value = serde_json::to_value(section)?;
    let fields = value
        .as_object()
        .and_then(|tagged| tagged.values().next())
        .and_then(|inner| inner.as_object())
        .context("Unexpected section layout")?;

    println!("{}", section.kind().to_string().bold());
    let mut table = create_table();
    table.set_header(vec![Cell::new("Key"), Cell::new("Value")]);
    for (key, value) in fields {
        table.add_row(vec![Cell::new(key), Cell::new(value.to_string())]);
    }
    println!("{table}");
    Ok(())
}
