use anyhow::{Result, bail};

use super::config::wait_for_ack;
use super::resolve_node;
use crate::cli::{AdminCommands, Cli};
use crate::output::OutputFormat;
use crate::utils::{print_success, print_warning};

pub async fn handle_admin(cli: &Cli, subcommand: &AdminCommands) -> Result<()> {
    let (node, delay, confirm, action) = match subcommand {
        AdminCommands::Reboot {
            node,
            delay,
            confirm,
        } => (node, *delay, *confirm, "Reboot"),
        AdminCommands::Shutdown {
            node,
            delay,
            confirm,
        } => (node, *delay, *confirm, "Shutdown"),
    };

    if !confirm {
        print_warning(&format!(
            "{action} requires confirmation. Use --confirm to proceed."
        ));
        bail!("Operation cancelled");
    }

    let mut radio = super::connect(cli, OutputFormat::Table).await?;
    let to = match node {
        Some(node) => resolve_node(&*radio.store().read().await, node)?,
        None => radio.local_node().await?,
    };

    print_warning(&format!("Sending {} command to !{to:08x}...", action.to_lowercase()));
    let id = match subcommand {
        AdminCommands::Reboot { .. } => radio.manager.reboot(to, delay).await,
        AdminCommands::Shutdown { .. } => radio.manager.shutdown(to, delay).await,
    };
    if id == 0 {
        radio.close().await?;
        bail!("{action} command was not sent");
    }

    wait_for_ack(&mut radio, id, cli.handshake_timeout).await;
    radio.close().await?;
    print_success(&format!(
        "{action} command sent. Node will act in {delay} seconds."
    ));
    Ok(())
}
