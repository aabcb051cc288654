//! CLI command implementations.

pub mod listen;
pub mod sign;
pub mod trigger;

use anyhow::{bail, Context};
use console::style;
use serde_json::{json, Value};

use reverb_client::ClientEvent;

use crate::OutputFormat;

/// Parse a JSON command-line argument.
pub fn parse_json(raw: &str, flag: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))
}

/// Build the presence identity from `--user-id` / `--user-info`.
pub fn presence_identity(
    user_id: Option<String>,
    user_info: Option<&str>,
) -> anyhow::Result<Option<Value>> {
    match (user_id, user_info) {
        (None, None) => Ok(None),
        (None, Some(_)) => bail!("--user-info requires --user-id"),
        (Some(user_id), info) => {
            let user_info = match info {
                Some(raw) => parse_json(raw, "--user-info")?,
                None => json!({}),
            };
            Ok(Some(json!({"user_id": user_id, "user_info": user_info})))
        }
    }
}

/// Local wall-clock time for event lines.
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Print one received event.
pub fn print_event(format: OutputFormat, event: &str, data: &Value, channel: Option<&str>) {
    match format {
        OutputFormat::Json => {
            let line = json!({
                "time": chrono::Utc::now().to_rfc3339(),
                "event": event,
                "channel": channel,
                "data": data,
            });
            println!("{line}");
        }
        OutputFormat::Text => {
            println!(
                "  {} {} {} {}",
                style(timestamp()).dim(),
                style(format!("[{}]", channel.unwrap_or("-"))).cyan(),
                style(event).bold(),
                data
            );
        }
    }
}

/// Print a client lifecycle event.
pub fn print_lifecycle(format: OutputFormat, event: &ClientEvent) {
    if format == OutputFormat::Json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    match event {
        ClientEvent::Connected { socket_id } => println!(
            "  {} Connected (socket {socket_id})",
            style("OK").green().bold()
        ),
        ClientEvent::Disconnected => {
            println!("  {} Connection lost, reconnecting...", style("WARN").yellow())
        }
        ClientEvent::Error { message } => println!("  {} {message}", style("ERROR").red().bold()),
        ClientEvent::SubscriptionSucceeded { channel } => {
            println!("  {} Subscribed to {channel}", style("OK").green())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_identity() {
        assert!(presence_identity(None, None).unwrap().is_none());
        assert!(presence_identity(None, Some("{}")).is_err());

        let identity = presence_identity(Some("7".into()), Some(r#"{"name":"Ann"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(identity, json!({"user_id": "7", "user_info": {"name": "Ann"}}));

        let bare = presence_identity(Some("7".into()), None).unwrap().unwrap();
        assert_eq!(bare["user_info"], json!({}));
    }

    #[test]
    fn test_parse_json_names_flag() {
        let err = parse_json("{oops", "--data").unwrap_err();
        assert!(err.to_string().contains("--data"));
    }
}
