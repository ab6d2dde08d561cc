use anyhow::{Result, bail};
use meshsync_core::message::BROADCAST_ADDR;
use serde::Serialize;

use super::config::wait_for_ack;
use super::resolve_node;
use crate::cli::Cli;
use crate::output::{OutputFormat, print_output};
use crate::utils::print_success;

#[derive(Debug, Serialize)]
struct SentMessage {
    id: u32,
    text: String,
    destination: String,
    channel: u32,
}

pub async fn handle_send(
    cli: &Cli,
    text: &str,
    dest: Option<&str>,
    channel: u32,
    format: OutputFormat,
) -> Result<()> {
    let mut radio = super::connect(cli, format).await?;
    let to = match dest {
        Some(dest) => resolve_node(&*radio.store().read().await, dest)?,
        None => BROADCAST_ADDR,
    };

    let id = radio.manager.send_text(text, to, channel).await;
    if id == 0 {
        radio.close().await?;
        bail!("Message was not sent");
    }

    let sent = SentMessage {
        id,
        text: text.to_string(),
        destination: if to == BROADCAST_ADDR {
            "Broadcast".to_string()
        } else {
            format!("!{to:08x}")
        },
        channel,
    };

    match format {
        OutputFormat::Json => print_output(&sent, format),
        OutputFormat::Table => print_success(&format!(
            "Message sent to {destination} on channel {channel}",
            destination = sent.destination
        )),
    }

    wait_for_ack(&mut radio, id, cli.handshake_timeout).await;
    radio.close().await
}
