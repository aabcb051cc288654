//! Listen command - subscribe to channels and stream their events.

use console::style;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use reverb_client::{ChannelKind, Handler, ReverbClient};
use reverb_core::config::ReverbConfig;
use reverb_socket::protocol;

use crate::OutputFormat;

/// Run the listen command.
pub async fn run(
    config: ReverbConfig,
    channels: Vec<String>,
    identity: Option<Value>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    config.validate()?;

    let text = format == OutputFormat::Text;
    if text {
        println!(
            "{} Connecting to {}:{}...",
            style("[1/2]").bold().dim(),
            config.host,
            config.port
        );
    }

    let client = ReverbClient::new(config);
    let mut events = client.events();
    client.bind(
        protocol::WILDCARD,
        Handler::from_fn(move |event: String, data: Value, channel: Option<String>| async move {
            super::print_event(format, &event, &data, channel.as_deref());
            Ok(())
        }),
    );

    client.connect().await?;

    if text {
        println!("{} Subscribing...", style("[2/2]").bold().dim());
    }
    for name in &channels {
        let identity = match ChannelKind::from_name(name) {
            ChannelKind::Presence => identity.clone(),
            _ => None,
        };
        client.subscribe(name, identity).await?;
    }
    if text {
        println!("  Listening for events... (Ctrl+C to stop)");
        println!();
    }

    let listen = client.listen();
    tokio::pin!(listen);

    loop {
        tokio::select! {
            result = &mut listen => {
                return result.map_err(Into::into);
            }
            event = events.recv() => {
                match event {
                    Ok(ev) => super::print_lifecycle(format, &ev),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("  {} Missed {n} lifecycle events", style("WARN").yellow());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if text {
                    println!("\n  Disconnecting...");
                }
                client.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}
