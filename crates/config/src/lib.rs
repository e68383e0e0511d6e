//! Configuration loading, validation, and management for meshlink.
//!
//! A [`ClientConfig`] can be built in code, loaded from a TOML file, or
//! assembled from both with `MESHLINK_*` environment variable overrides.
//! Every config object is validated before the client will accept it;
//! invalid combinations are rejected at construction, not at first use.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshlink_core::frame::FrameKind;
use meshlink_resilience::{BackoffStrategy, RetryPolicy};

/// Who this client is to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// An end user talking to agents through a coordinator.
    #[default]
    User,
    /// An agent offering capabilities to the network.
    Agent,
    /// A coordinator routing user messages to agents.
    Coordinator,
}

/// The root configuration for one client instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport URL; must start with `ws://` or `wss://`.
    pub ws_url: String,

    /// Hex-encoded secp256k1 signing key. Optional: without it the client
    /// connects unauthenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Explicit wallet address; must agree with `private_key` if both set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,

    #[serde(default)]
    pub client_type: ClientType,

    /// Capability names announced when an agent client registers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Rooms to subscribe right after authentication.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_join_rooms: Vec<String>,

    /// Webhook fan-out; absent disables the webhook engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Transport handshake deadline.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request/response and rate-limit acquisition deadline.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Serialized frame size cap in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound token-bucket rate (burst equals the rate).
    #[serde(default = "default_max_messages_per_second")]
    pub max_messages_per_second: u32,

    #[serde(default)]
    pub signatures: SignatureConfig,

    /// Permit localhost webhook targets (development only).
    #[serde(default)]
    pub allow_insecure_webhooks: bool,

    #[serde(default)]
    pub dedup: DedupConfig,
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_message_timeout_ms() -> u64 {
    30_000
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_max_messages_per_second() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("ws_url", &self.ws_url)
            .field("private_key", &redact(&self.private_key))
            .field("wallet_address", &self.wallet_address)
            .field("client_type", &self.client_type)
            .field("capabilities", &self.capabilities)
            .field("auto_join_rooms", &self.auto_join_rooms)
            .field("webhook", &self.webhook)
            .field("reconnect", &self.reconnect)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("message_timeout_ms", &self.message_timeout_ms)
            .field("max_message_size", &self.max_message_size)
            .field("max_messages_per_second", &self.max_messages_per_second)
            .field("signatures", &self.signatures)
            .field("allow_insecure_webhooks", &self.allow_insecure_webhooks)
            .field("dedup", &self.dedup)
            .finish()
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// POST target; SSRF-validated at construction.
    pub url: String,

    /// Extra request headers, merged over `Content-Type: application/json`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Wall-clock deadline per POST.
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Event kinds to deliver; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_events: Option<Vec<String>>,
}

fn default_webhook_timeout_ms() -> u64 {
    30_000
}

impl WebhookConfig {
    /// Minimal config targeting one URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout_ms: default_webhook_timeout_ms(),
            retry: RetryConfig::default(),
            allowed_events: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry schedule shared by webhooks (and adjustable per engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_retry_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            max_attempts: default_retry_attempts(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Materialize the policy object the engines consume.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.strategy,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
            self.jitter,
        )
    }
}

/// Reconnection behavior after an unintentional transport close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub strategy: BackoffStrategy,
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_attempts() -> u32 {
    10
}

/// Reconnect delays never grow past this, whatever the strategy.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay_ms(),
            max_attempts: default_reconnect_attempts(),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.strategy,
            Duration::from_millis(self.delay_ms),
            MAX_RECONNECT_DELAY,
            self.max_attempts,
            // Jitter keeps a reconnect stampede from synchronizing.
            true,
        )
    }
}

/// Inbound signature policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_true")]
    pub validate: bool,

    /// Accepted signer addresses; empty means allow-all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_addresses: Vec<String>,

    /// Frame kinds that must carry a signature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require_for: Vec<FrameKind>,

    /// Require a signature on every frame.
    #[serde(default)]
    pub strict: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            validate: true,
            trusted_addresses: Vec::new(),
            require_for: Vec::new(),
            strict: false,
        }
    }
}

/// Inbound deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_dedup_max_size")]
    pub max_size: usize,
}

fn default_dedup_ttl_ms() -> u64 {
    60_000
}
fn default_dedup_max_size() -> usize {
    10_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_dedup_ttl_ms(),
            max_size: default_dedup_max_size(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    ReadError { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for meshlink_core::Error {
    fn from(err: ConfigError) -> Self {
        meshlink_core::Error::Config(err.to_string())
    }
}

impl ClientConfig {
    /// A config with defaults for everything but the transport URL.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            private_key: None,
            wallet_address: None,
            client_type: ClientType::default(),
            capabilities: Vec::new(),
            auto_join_rooms: Vec::new(),
            webhook: None,
            reconnect: ReconnectConfig::default(),
            connection_timeout_ms: default_connection_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            max_message_size: default_max_message_size(),
            max_messages_per_second: default_max_messages_per_second(),
            signatures: SignatureConfig::default(),
            allow_insecure_webhooks: false,
            dedup: DedupConfig::default(),
        }
    }

    /// Load from a TOML file, then apply `MESHLINK_*` environment
    /// overrides, then validate.
    ///
    /// A `private_key` stored in the keystore's encrypted form is unlocked
    /// with `MESHLINK_KEY_PASSPHRASE`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Validation happens at the end, after env overrides and key
        // unlocking have produced the effective configuration.
        let mut config = Self::parse_file(path)?;

        if let Ok(url) = std::env::var("MESHLINK_WS_URL") {
            config.ws_url = url;
        }
        if config.private_key.is_none() {
            config.private_key = std::env::var("MESHLINK_PRIVATE_KEY").ok();
        }
        if config.wallet_address.is_none() {
            config.wallet_address = std::env::var("MESHLINK_WALLET_ADDRESS").ok();
        }
        if let Ok(url) = std::env::var("MESHLINK_WEBHOOK_URL") {
            match config.webhook.as_mut() {
                Some(webhook) => webhook.url = url,
                None => config.webhook = Some(WebhookConfig::new(url)),
            }
        }
        if let (Some(key), Ok(passphrase)) = (
            config.private_key.clone(),
            std::env::var("MESHLINK_KEY_PASSPHRASE"),
        ) {
            if !key.trim_start().starts_with("0x") && key.contains('.') {
                config.unlock_private_key(&key, &passphrase)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Replace `private_key` with the plaintext behind an encrypted blob
    /// (the keystore's `nonce.ciphertext` base64 form).
    pub fn unlock_private_key(
        &mut self,
        encrypted: &str,
        passphrase: &str,
    ) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;

        let encrypted = meshlink_security::EncryptedKey::from_base64(encrypted)
            .map_err(|e| ConfigError::ValidationError(format!("private_key: {e}")))?;
        let keystore = meshlink_security::Keystore::new(passphrase)
            .map_err(|e| ConfigError::ValidationError(format!("key passphrase: {e}")))?;
        let key = keystore
            .decrypt(&encrypted)
            .map_err(|e| ConfigError::ValidationError(format!("private_key: {e}")))?;
        self.private_key = Some(key.expose_secret().to_string());
        Ok(())
    }

    /// Load from a specific TOML file without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            return Err(ConfigError::ValidationError(format!(
                "ws_url must start with ws:// or wss://, got {:?}",
                self.ws_url
            )));
        }
        url::Url::parse(&self.ws_url).map_err(|e| {
            ConfigError::ValidationError(format!("ws_url does not parse: {e}"))
        })?;

        if let Some(key) = &self.private_key {
            let signer = meshlink_security::FrameSigner::from_hex(key)
                .map_err(|e| ConfigError::ValidationError(format!("private_key invalid: {e}")))?;
            if let Some(address) = &self.wallet_address {
                if !signer.is_own_address(address) {
                    return Err(ConfigError::ValidationError(format!(
                        "wallet_address {address} does not match the private key (derives {})",
                        signer.address()
                    )));
                }
            }
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be > 0".into(),
            ));
        }
        if self.max_messages_per_second == 0 {
            return Err(ConfigError::ValidationError(
                "max_messages_per_second must be >= 1".into(),
            ));
        }
        if self.connection_timeout_ms == 0 || self.message_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be > 0".into(),
            ));
        }

        if self.dedup.enabled {
            if self.dedup.ttl_ms < 1_000 {
                return Err(ConfigError::ValidationError(
                    "dedup ttl_ms must be >= 1000".into(),
                ));
            }
            if self.dedup.max_size == 0 {
                return Err(ConfigError::ValidationError(
                    "dedup max_size must be >= 1".into(),
                ));
            }
        }

        if let Some(webhook) = &self.webhook {
            meshlink_security::validate_webhook_url(&webhook.url, self.allow_insecure_webhooks)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            if webhook.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "webhook timeout_ms must be > 0".into(),
                ));
            }
            if webhook.retry.max_delay_ms < webhook.retry.base_delay_ms {
                return Err(ConfigError::ValidationError(
                    "webhook retry max_delay_ms must be >= base_delay_ms".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup.ttl_ms)
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::new("wss://mesh.example.com/ws");
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
