//! Client configuration.
//!
//! `ReverbConfig` is built once by the embedding application and handed to
//! the client as an immutable value. Loading from TOML and applying
//! `REVERB_*` overrides live here so the CLI can use them; the connection
//! machinery never touches files or the environment itself.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{ReverbError, ReverbResult};

/// A sensitive string that never appears in `Debug` or `Display` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw secret. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// WebSocket URL scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Ws,
    #[default]
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ReverbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            other => Err(ReverbError::Config(format!(
                "invalid scheme '{other}', expected ws or wss"
            ))),
        }
    }
}

/// Reconnection policy: exponential backoff between `min_delay_secs` and
/// `max_delay_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a connection loss or failed attempt.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: f64,

    /// Upper bound on the backoff delay (before jitter), in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Give up after this many failed attempts. `None` or 0 retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Keepalive settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Seconds of inbound silence before the client sends a ping.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: f64,

    /// Seconds to wait for any inbound frame after a ping.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: f64,
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverbConfig {
    /// Application key; part of the connection path and every signature.
    #[serde(default)]
    pub app_key: String,

    /// Application secret used for HMAC channel signatures.
    #[serde(default)]
    pub app_secret: Secret,

    /// Broadcast server hostname.
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub scheme: Scheme,

    /// Pusher protocol version sent in the connection URL.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,

    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Seconds to wait for the server handshake after the socket opens.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: f64,

    /// Fixed pause in seconds after a connection loss before retrying.
    #[serde(default = "default_reconnect_pause")]
    pub reconnect_pause_secs: f64,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_min_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_ping_interval() -> f64 {
    30.0
}

fn default_ping_timeout() -> f64 {
    10.0
}

fn default_port() -> u16 {
    constants::DEFAULT_PORT
}

fn default_protocol_version() -> u8 {
    constants::PROTOCOL_VERSION
}

fn default_client_name() -> String {
    constants::CLIENT_NAME.to_string()
}

fn default_client_version() -> String {
    constants::CLIENT_VERSION.to_string()
}

fn default_handshake_timeout() -> f64 {
    constants::HANDSHAKE_TIMEOUT.as_secs_f64()
}

fn default_reconnect_pause() -> f64 {
    constants::RECONNECT_PAUSE.as_secs_f64()
}

/// Convert a seconds value that passed validation into a `Duration`.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn min_delay(&self) -> Duration {
        secs(self.min_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        secs(self.max_delay_secs)
    }

    /// Base backoff delay (without jitter) before retry number `attempt`,
    /// counting from 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.min_delay_secs <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.min_delay_secs * self.multiplier.powi(exponent);
        // powi overflows to infinity for large attempts; min() clamps it.
        secs(delay.min(self.max_delay_secs))
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if max > 0 && attempts >= max)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        secs(self.ping_timeout_secs)
    }
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: Secret::default(),
            host: String::new(),
            port: default_port(),
            scheme: Scheme::default(),
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            handshake_timeout_secs: default_handshake_timeout(),
            reconnect_pause_secs: default_reconnect_pause(),
            reconnect: ReconnectPolicy::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ReverbConfig {
    /// Create a configuration with the required credentials and defaults
    /// for everything else.
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<Secret>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_pause(&self) -> Duration {
        secs(self.reconnect_pause_secs)
    }

    /// Construct the WebSocket connection URL.
    ///
    /// `{scheme}://{host}:{port}/app/{key}?protocol={v}&client={name}&version={ver}`
    pub fn build_url(&self) -> String {
        format!(
            "{}://{}:{}/app/{}?protocol={}&client={}&version={}",
            self.scheme,
            self.host,
            self.port,
            self.app_key,
            self.protocol_version,
            self.client_name,
            self.client_version,
        )
    }

    /// Check that the configuration can be used to connect.
    pub fn validate(&self) -> ReverbResult<()> {
        if self.app_key.trim().is_empty() {
            return Err(ReverbError::Config("app_key is required".into()));
        }
        if self.app_secret.is_empty() {
            return Err(ReverbError::Config("app_secret is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ReverbError::Config("host is required".into()));
        }
        if self.port == 0 {
            return Err(ReverbError::Config("port must be non-zero".into()));
        }

        let r = &self.reconnect;
        let durations = [
            ("reconnect.min_delay_secs", r.min_delay_secs),
            ("reconnect.max_delay_secs", r.max_delay_secs),
            ("keepalive.ping_timeout_secs", self.keepalive.ping_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("reconnect_pause_secs", self.reconnect_pause_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(ReverbError::Config(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }
        if r.min_delay_secs > r.max_delay_secs {
            return Err(ReverbError::Config(
                "reconnect.min_delay_secs exceeds reconnect.max_delay_secs".into(),
            ));
        }
        if !r.multiplier.is_finite() || r.multiplier < 1.0 {
            return Err(ReverbError::Config(
                "reconnect.multiplier must be at least 1.0".into(),
            ));
        }
        let interval = self.keepalive.ping_interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ReverbError::Config(
                "keepalive.ping_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ReverbResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ReverbConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> ReverbResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ReverbError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration file path: `<config dir>/reverb/config.toml`.
    pub fn default_config_path() -> ReverbResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| ReverbError::Config("could not determine config directory".into()))?;
        Ok(base.join("reverb").join("config.toml"))
    }

    /// Apply `REVERB_*` overrides obtained through `lookup`.
    ///
    /// `lookup` receives the unprefixed key (e.g. `APP_KEY`) prefixed with
    /// [`constants::ENV_PREFIX`]; pass `|k| std::env::var(k).ok()` to read
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ReverbResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{key}", constants::ENV_PREFIX));

        if let Some(v) = get("APP_KEY") {
            self.app_key = v;
        }
        if let Some(v) = get("APP_SECRET") {
            self.app_secret = Secret::new(v);
        }
        if let Some(v) = get("HOST") {
            self.host = v;
        }
        if let Some(v) = get("PORT") {
            self.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get("SCHEME") {
            self.scheme = v.parse()?;
        }
        if let Some(v) = get("RECONNECT_ENABLED") {
            self.reconnect.enabled = parse_env("RECONNECT_ENABLED", &v)?;
        }
        if let Some(v) = get("MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = if v.trim().is_empty() {
                None
            } else {
                Some(parse_env("MAX_RECONNECT_ATTEMPTS", &v)?)
            };
        }
        if let Some(v) = get("PING_INTERVAL") {
            self.keepalive.ping_interval_secs = parse_env("PING_INTERVAL", &v)?;
        }
        if let Some(v) = get("PING_TIMEOUT") {
            self.keepalive.ping_timeout_secs = parse_env("PING_TIMEOUT", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ReverbResult<T> {
    value.trim().parse().map_err(|_| {
        ReverbError::Config(format!(
            "invalid value '{value}' for {}{key}",
            constants::ENV_PREFIX
        ))
    })
}
