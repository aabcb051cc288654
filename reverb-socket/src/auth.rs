//! HMAC-SHA256 signatures for private and presence channel subscriptions.
//!
//! The broadcast server verifies subscriptions by recomputing:
//! ```text
//! private:  HMAC-SHA256(app_secret, "{socket_id}:{channel}")
//! presence: HMAC-SHA256(app_secret, "{socket_id}:{channel}:{channel_data}")
//! ```
//! and comparing against the `auth` field `"{app_key}:{hex digest}"`.

use std::fmt;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::trace;

use reverb_core::config::{ReverbConfig, Secret};
use reverb_core::error::{ReverbError, ReverbResult};

type HmacSha256 = Hmac<Sha256>;

/// Credentials placed in a `pusher:subscribe` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelAuth {
    /// `"{app_key}:{hex signature}"`.
    pub auth: String,
    /// Compact JSON of the user identity; presence channels only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// Signs channel subscriptions with the application secret.
///
/// Stateless and deterministic; safe to share between tasks.
#[derive(Clone)]
pub struct Authenticator {
    app_key: String,
    app_secret: Secret,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("app_key", &self.app_key)
            .field("app_secret", &self.app_secret)
            .finish()
    }
}

impl Authenticator {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<Secret>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        }
    }

    pub fn from_config(config: &ReverbConfig) -> Self {
        Self::new(config.app_key.clone(), config.app_secret.clone())
    }

    /// Produce the subscription credentials for `channel_name`.
    ///
    /// With `user_data` (presence channels) the identity is serialized to
    /// compact JSON with sorted keys, included in the signed string and
    /// returned as `channel_data`.
    pub fn authenticate(
        &self,
        socket_id: &str,
        channel_name: &str,
        user_data: Option<&serde_json::Value>,
    ) -> ReverbResult<ChannelAuth> {
        match user_data {
            Some(user) => {
                let channel_data = serde_json::to_string(user)?;
                let auth = self.sign(&format!("{socket_id}:{channel_name}:{channel_data}"))?;
                Ok(ChannelAuth {
                    auth,
                    channel_data: Some(channel_data),
                })
            }
            None => {
                let auth = self.sign(&format!("{socket_id}:{channel_name}"))?;
                Ok(ChannelAuth {
                    auth,
                    channel_data: None,
                })
            }
        }
    }

    fn sign(&self, message: &str) -> ReverbResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.app_secret.expose().as_bytes())
            .map_err(|e| ReverbError::Authentication(format!("hmac init failed: {e}")))?;
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        trace!(signed = message, "signed channel subscription");
        Ok(format!("{}:{signature}", self.app_key))
    }
}
