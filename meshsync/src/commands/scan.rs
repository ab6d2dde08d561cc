use anyhow::Result;
use comfy_table::Cell;
use meshsync_core::Store;

use crate::cli::Cli;
use crate::output::{OutputFormat, create_table, format_optional, print_output};
use crate::utils::{print_info, spinner};

pub async fn handle_scan(cli: &Cli, format: OutputFormat) -> Result<()> {
    // Scanning touches nothing persistent
    let (mut manager, _simulator) = super::manager(cli, Store::in_memory().await?).await?;

    let pb = spinner("Scanning for radios...", format == OutputFormat::Json);
    let links = manager.scan_for(cli.scan_duration).await?;
    pb.finish_and_clear();

    if links.is_empty() {
        print_info("No Meshtastic radios found");
        return Ok(());
    }

    match format {
        OutputFormat::Json => print_output(&links, format),
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec![
                Cell::new("Name"),
                Cell::new("ID"),
                Cell::new("RSSI"),
                Cell::new("State"),
            ]);
            for link in &links {
                table.add_row(vec![
                    Cell::new(&link.name),
                    Cell::new(&link.id),
                    Cell::new(format_optional(link.rssi)),
                    Cell::new(format!("{:?}", link.state)),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
