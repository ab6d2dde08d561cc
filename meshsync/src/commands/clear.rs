use anyhow::{Result, bail};
use meshsync_core::Store;
use meshsync_core::reconcile::Reconciler;
use serde::Serialize;

use super::{open_store, resolve_node};
use crate::cli::{Cli, ClearCommands};
use crate::output::{OutputFormat, print_output};
use crate::utils::{print_success, print_warning};

#[derive(Debug, Serialize)]
struct Cleared {
    what: String,
    removed: usize,
}

// Clears only touch the local store, so no radio is needed.
pub async fn handle_clear(cli: &Cli, subcommand: &ClearCommands, format: OutputFormat) -> Result<()> {
    let store = open_store(&cli.store).await?;
    let reconciler = Reconciler::new(store.clone());

    let cleared = match subcommand {
        ClearCommands::Positions { node } => {
            let num = resolve(&store, node).await?;
            Cleared {
                what: format!("positions of !{num:08x}"),
                removed: reconciler.clear_positions(num).await?,
            }
        }
        ClearCommands::Telemetry { node } => {
            let num = resolve(&store, node).await?;
            Cleared {
                what: format!("telemetry of !{num:08x}"),
                removed: reconciler.clear_telemetry(num).await?,
            }
        }
        ClearCommands::Messages { node } => {
            let num = resolve(&store, node).await?;
            Cleared {
                what: format!("messages with !{num:08x}"),
                removed: reconciler.delete_messages_for(num).await?,
            }
        }
        ClearCommands::Channel { index } => Cleared {
            what: format!("broadcasts on channel {index}"),
            removed: reconciler.delete_channel_messages(*index).await?,
        },
        ClearCommands::All { confirm } => {
            if !confirm {
                print_warning("Clearing the whole store requires --confirm");
                bail!("Operation cancelled");
            }
            let removed = store.read().await.nodes.len();
            reconciler.clear_all().await?;
            Cleared {
                what: "all nodes, messages and channels".to_string(),
                removed,
            }
        }
    };

    store.close().await?;
    match format {
        OutputFormat::Json => print_output(&cleared, format),
        OutputFormat::Table => {
            print_success(&format!("Cleared {} ({} removed)", cleared.what, cleared.removed))
        }
    }
    Ok(())
}

async fn resolve(store: &Store, node: &str) -> Result<u32> {
    let model = store.read().await;
    resolve_node(&model, node)
}
