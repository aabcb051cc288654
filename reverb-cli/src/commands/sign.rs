//! Sign command - compute the auth payload for a channel subscription.

use console::style;
use serde_json::Value;

use reverb_client::ChannelKind;
use reverb_core::config::ReverbConfig;
use reverb_core::error::ReverbError;
use reverb_socket::Authenticator;

use crate::OutputFormat;

/// Run the sign command. Needs only the app key and secret.
pub fn run(
    config: ReverbConfig,
    socket_id: &str,
    channel: &str,
    user_data: Option<Value>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if config.app_key.is_empty() || config.app_secret.is_empty() {
        return Err(ReverbError::Config("app_key and app_secret are required".into()).into());
    }
    if ChannelKind::from_name(channel) == ChannelKind::Presence && user_data.is_none() {
        return Err(ReverbError::Authentication(format!(
            "presence channel {channel} requires --user-data"
        ))
        .into());
    }

    let auth = Authenticator::from_config(&config).authenticate(socket_id, channel, user_data.as_ref())?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&auth)?),
        OutputFormat::Text => {
            println!("  {}         {}", style("auth:").bold(), auth.auth);
            if let Some(channel_data) = &auth.channel_data {
                println!("  {} {}", style("channel_data:").bold(), channel_data);
            }
        }
    }
    Ok(())
}
