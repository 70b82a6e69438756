//! Configuration types for the TeamCity bridge

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::watch;

use crate::retry::RetryConfig;
use crate::BridgeError;

/// Builds listed by `builds` when the settings leave the count unset
pub const DEFAULT_MAX_BUILDS: usize = 5;

const TOKEN_ENV_VAR: &str = "TEAMCITY_TOKEN";
const CHAT_TOKEN_ENV_VAR: &str = "CHAT_TOKEN";
const ENV_PREFIX: &str = "env:";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub teamcity: TeamCitySettings,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Plugin settings, keyed exactly as in the plugin manifest
#[derive(Clone, Serialize, Deserialize)]
pub struct TeamCitySettings {
    #[serde(rename = "TeamCityURL", default)]
    pub url: String,
    #[serde(rename = "TeamCityToken", default)]
    pub token: String,
    #[serde(
        rename = "TeamCityMaxBuilds",
        default = "default_max_builds",
        deserialize_with = "deserialize_max_builds"
    )]
    pub max_builds: usize,
}

impl Default for TeamCitySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            max_builds: DEFAULT_MAX_BUILDS,
        }
    }
}

impl fmt::Debug for TeamCitySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamCitySettings")
            .field("url", &self.url)
            .field("token", &redacted(&self.token))
            .field("max_builds", &self.max_builds)
            .finish()
    }
}

/// Chat server used for outbound posts
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("url", &self.url)
            .field("token", &redacted(&self.token))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_failure_warn_threshold")]
    pub failure_warn_threshold: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_in_flight: default_max_in_flight(),
            failure_warn_threshold: default_failure_warn_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Inbound command endpoint and status API
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Verification token expected on slash-command requests
    #[serde(default)]
    pub command_token: Option<String>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_server_port(),
            command_token: None,
            history_size: default_history_size(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("enabled", &self.enabled)
            .field("port", &self.port)
            .field(
                "command_token",
                &self.command_token.as_deref().map(redacted),
            )
            .field("history_size", &self.history_size)
            .finish()
    }
}

fn default_max_builds() -> usize {
    DEFAULT_MAX_BUILDS
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    8
}

fn default_failure_warn_threshold() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_store_path() -> PathBuf {
    PathBuf::from("subscriptions.json")
}

fn default_true() -> bool {
    true
}

fn default_server_port() -> u16 {
    11120
}

fn default_history_size() -> usize {
    100
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// The manifest declares the count as a text field, so accept `5` and `"5"`.
/// Zero or blank falls back to the default.
fn deserialize_max_builds<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(u64),
        Text(String),
    }

    let count = match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => n as usize,
        NumberOrText::Text(s) if s.trim().is_empty() => 0,
        NumberOrText::Text(s) => s.trim().parse::<usize>().map_err(|e| {
            serde::de::Error::custom(format!("TeamCityMaxBuilds '{}': {}", s, e))
        })?,
    };
    Ok(if count == 0 { DEFAULT_MAX_BUILDS } else { count })
}

impl Config {
    /// Fill secrets from the environment.
    ///
    /// A secret written as `env:NAME` is read from variable `NAME`; an empty
    /// secret falls back to `TEAMCITY_TOKEN` / `CHAT_TOKEN` when those are set.
    pub fn resolve_secrets(&mut self) -> crate::Result<()> {
        self.teamcity.token = resolve_secret(&self.teamcity.token, TOKEN_ENV_VAR)?;
        self.chat.token = resolve_secret(&self.chat.token, CHAT_TOKEN_ENV_VAR)?;
        Ok(())
    }
}

fn resolve_secret(value: &str, fallback_var: &str) -> crate::Result<String> {
    if let Some(var) = value.strip_prefix(ENV_PREFIX) {
        return std::env::var(var).map_err(|_| {
            BridgeError::Config(format!("environment variable {} is not set", var))
        });
    }
    if value.is_empty() {
        return Ok(std::env::var(fallback_var).unwrap_or_default());
    }
    Ok(value.to_string())
}

/// Validated TeamCity endpoint and token. Replaced wholesale, never edited.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    base_url: String,
    token: String,
    max_builds_default: usize,
}

impl Credential {
    pub fn from_settings(settings: &TeamCitySettings) -> crate::Result<Self> {
        let url = settings.url.trim();
        if url.is_empty() {
            return Err(BridgeError::Config("TeamCityURL is required".to_string()));
        }
        if settings.token.is_empty() {
            return Err(BridgeError::Config(
                "TeamCityToken is required".to_string(),
            ));
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| BridgeError::Config(format!("invalid TeamCityURL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BridgeError::Config(format!(
                "TeamCityURL must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            max_builds_default: if settings.max_builds == 0 {
                DEFAULT_MAX_BUILDS
            } else {
                settings.max_builds
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn max_builds_default(&self) -> usize {
        self.max_builds_default
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("base_url", &self.base_url)
            .field("token", &redacted(&self.token))
            .field("max_builds_default", &self.max_builds_default)
            .finish()
    }
}

/// Process-wide holder of the active credential.
///
/// Readers take an `Arc` snapshot; a settings change swaps in a new credential
/// in one step, so no reader ever sees a half-updated one.
#[derive(Debug)]
pub struct CredentialStore {
    tx: watch::Sender<Arc<Credential>>,
}

impl CredentialStore {
    pub fn new(credential: Credential) -> Self {
        let (tx, _) = watch::channel(Arc::new(credential));
        Self { tx }
    }

    pub fn from_settings(settings: &TeamCitySettings) -> crate::Result<Self> {
        Ok(Self::new(Credential::from_settings(settings)?))
    }

    pub fn current(&self) -> Arc<Credential> {
        Arc::clone(&self.tx.borrow())
    }

    /// Validate and install new settings, returning whether anything changed.
    /// Invalid settings leave the active credential in place.
    pub fn replace(&self, settings: &TeamCitySettings) -> crate::Result<bool> {
        let credential = Credential::from_settings(settings)?;
        let changed = self.tx.send_if_modified(|current| {
            if **current == credential {
                false
            } else {
                *current = Arc::new(credential);
                true
            }
        });
        if changed {
            tracing::info!(
                "TeamCity settings updated (url={})",
                self.current().base_url()
            );
        }
        Ok(changed)
    }
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
