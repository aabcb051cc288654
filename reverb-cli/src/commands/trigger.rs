//! Trigger command - send one client event and exit.

use std::time::Duration;

use console::style;
use serde_json::{json, Value};
use tracing::warn;

use reverb_client::{ChannelKind, ReverbClient};
use reverb_core::config::ReverbConfig;
use reverb_socket::protocol;

use crate::OutputFormat;

pub struct TriggerOptions {
    pub channel: String,
    pub event: String,
    pub data: Value,
    pub identity: Option<Value>,
    pub ack_timeout: Duration,
}

/// Run the trigger command.
pub async fn run(
    config: ReverbConfig,
    options: TriggerOptions,
    format: OutputFormat,
) -> anyhow::Result<()> {
    config.validate()?;

    if ChannelKind::from_name(&options.channel) == ChannelKind::Public {
        warn!(
            "client events on public channel {} will likely be rejected by the server",
            options.channel
        );
    }

    let client = ReverbClient::new(config);
    client.connect().await?;

    // Always disconnect, even when a step fails.
    let result = send(&client, &options).await;
    client.disconnect().await;
    result?;

    let event = protocol::client_event_name(&options.event);
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({"sent": true, "channel": options.channel, "event": event})
        ),
        OutputFormat::Text => println!(
            "  {} Sent {} on {}",
            style("OK").green().bold(),
            style(event).bold(),
            options.channel
        ),
    }
    Ok(())
}

async fn send(client: &ReverbClient, options: &TriggerOptions) -> anyhow::Result<()> {
    let channel = client
        .subscribe(&options.channel, options.identity.clone())
        .await?;
    client
        .wait_for_subscription(&options.channel, options.ack_timeout)
        .await?;
    channel.trigger(&options.event, options.data.clone()).await?;
    Ok(())
}
