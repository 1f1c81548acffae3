//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (`SWITCHYARD__*`, nested with `__`)

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use switchyard_core::{ClientConfig, DeliveryConfig, DeliveryPolicy, HubConfig};
use switchyard_protocol::tags;

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "SWITCHYARD";

/// `SWITCHYARD__AUTH__JWT_SECRET` maps to `auth.jwt_secret`.
fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backpressure policies.
    #[serde(default = "default_delivery")]
    pub delivery: DeliveryConfig,

    /// Internal publish endpoint.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Pending outbound frames per connection.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Maximum subscriptions per user.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_user: usize,

    /// Maximum channel id length in bytes.
    #[serde(default = "default_max_channel_id_len")]
    pub max_channel_id_len: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Silence allowed before a connection is dropped, in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Deadline for one outbound write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Deadline for the `IDENTIFY` frame, in milliseconds.
    #[serde(default = "default_identify_timeout")]
    pub identify_timeout_ms: u64,
}

/// JWT verification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret.
    #[serde(default)]
    pub jwt_secret: String,

    /// Required `iss` claim, if any.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Clock skew allowance in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Internal publish endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Bearer token required by the endpoint. The endpoint is disabled when unset.
    #[serde(default)]
    pub token: Option<String>,

    /// Route of the endpoint.
    #[serde(default = "default_publish_path")]
    pub path: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub gauges are sampled, in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_publish_path() -> String {
    "/internal/publish".to_string()
}

fn default_max_frame_size() -> usize {
    switchyard_protocol::MAX_FRAME_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    switchyard_core::DEFAULT_OUTBOUND_CAPACITY
}

fn default_max_subscriptions() -> usize {
    500
}

fn default_max_channel_id_len() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_pong_timeout() -> u64 {
    45_000 // 45 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_identify_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_leeway() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    5_000
}

/// Edits and removals block briefly so clients don't miss them; typing and
/// presence keep only the freshest updates.
fn default_delivery() -> DeliveryConfig {
    let block = DeliveryPolicy::Block { timeout_ms: 250 };
    [
        tags::MESSAGE_UPDATE,
        tags::MESSAGE_DELETE,
        tags::CHANNEL_DELETE,
        tags::MEMBER_LEAVE,
    ]
    .into_iter()
    .fold(DeliveryConfig::default(), |config, kind| {
        config.with_override(kind, block)
    })
    .with_override(tags::TYPING_START, DeliveryPolicy::DropOldest)
    .with_override(tags::PRESENCE_UPDATE, DeliveryPolicy::DropOldest)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            delivery: default_delivery(),
            publish: PublishConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_subscriptions_per_user: default_max_subscriptions(),
            max_channel_id_len: default_max_channel_id_len(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_timeout_ms: default_pong_timeout(),
            write_timeout_ms: default_write_timeout(),
            identify_timeout_ms: default_identify_timeout(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            token: None,
            path: default_publish_path(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// the result fails validation.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "switchyard.toml",
            "/etc/switchyard/switchyard.toml",
            "~/.config/switchyard/switchyard.toml",
        ];

        let file = config_paths
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        if let Some(path) = &file {
            tracing::info!("Loading configuration from {}", path);
        }
        Self::layered(
            file.map(|path| ::config::File::from(Path::new(&path))),
            env_source(),
        )
    }

    /// Load configuration from a specific file, layered with environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading configuration from {}", path.display());
        Self::layered(Some(::config::File::from(path).required(true)), env_source())
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Defaults, then `file`, then `env`.
    fn layered<S>(file: Option<S>, env: ::config::Environment) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let mut builder = ::config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let settings = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?;

        let config: Config = settings
            .try_deserialize::<Config>()
            .context("Failed to parse configuration")?
            .normalized();
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.auth.jwt_secret.is_empty(),
            "auth.jwt_secret must be set"
        );
        ensure!(
            self.heartbeat.ping_interval_ms < self.heartbeat.pong_timeout_ms,
            "heartbeat.ping_interval_ms must be shorter than heartbeat.pong_timeout_ms"
        );
        for (name, value) in [
            ("heartbeat.ping_interval_ms", self.heartbeat.ping_interval_ms),
            ("heartbeat.pong_timeout_ms", self.heartbeat.pong_timeout_ms),
            ("heartbeat.write_timeout_ms", self.heartbeat.write_timeout_ms),
            ("heartbeat.identify_timeout_ms", self.heartbeat.identify_timeout_ms),
            ("metrics.sample_interval_ms", self.metrics.sample_interval_ms),
        ] {
            ensure!(value > 0, "{name} must be positive");
        }
        ensure!(
            self.limits.max_frame_size > 0,
            "limits.max_frame_size must be positive"
        );
        ensure!(
            self.limits.outbound_queue_capacity > 0,
            "limits.outbound_queue_capacity must be positive"
        );
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        Ok(())
    }

    /// Event tags are matched upper-case.
    fn normalized(mut self) -> Self {
        self.delivery.overrides = self
            .delivery
            .overrides
            .into_iter()
            .map(|(kind, policy)| (kind.to_ascii_uppercase(), policy))
            .collect::<HashMap<_, _>>();
        self
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.limits.outbound_queue_capacity,
            max_subscriptions_per_user: self.limits.max_subscriptions_per_user,
            max_channel_id_len: self.limits.max_channel_id_len,
            delivery: self.delivery.clone(),
        }
    }

    /// Per-connection settings derived from this configuration.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_frame_size: self.limits.max_frame_size,
            pong_wait: Duration::from_millis(self.heartbeat.pong_timeout_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_interval_ms),
            write_wait: Duration::from_millis(self.heartbeat.write_timeout_ms),
            identify_timeout: Duration::from_millis(self.heartbeat.identify_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toml_source(
        text: &str,
    ) -> ::config::File<::config::FileSourceString, ::config::FileFormat> {
        ::config::File::from_str(text, ::config::FileFormat::Toml)
    }

    fn env(vars: &[(&str, &str)]) -> ::config::Environment {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        env_source().source(Some(vars))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_frame_size, 4096);
        assert_eq!(config.limits.outbound_queue_capacity, 256);
        assert!(config.publish.token.is_none());
    }

    #[test]
    fn test_default_delivery_policies() {
        let delivery = Config::default().delivery;
        assert_eq!(
            delivery.policy_for(tags::MESSAGE_DELETE),
            DeliveryPolicy::Block { timeout_ms: 250 }
        );
        assert_eq!(
            delivery.policy_for(tags::TYPING_START),
            DeliveryPolicy::DropOldest
        );
        assert_eq!(
            delivery.policy_for(tags::MESSAGE_CREATE),
            DeliveryPolicy::DropNewest
        );
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            jwt_secret = "s3cret"
            issuer = "switchyard"

            [limits]
            max_subscriptions_per_user = 50

            [delivery]
            default = { mode = "drop_oldest" }

            [delivery.overrides]
            message_delete = { mode = "block", timeout_ms = 100 }
        "#;

        let config = Config::layered(Some(toml_source(toml_str)), env(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth.issuer.as_deref(), Some("switchyard"));
        assert_eq!(config.hub_config().max_subscriptions_per_user, 50);
        assert_eq!(
            config.delivery.policy_for(tags::MESSAGE_DELETE),
            DeliveryPolicy::Block { timeout_ms: 100 }
        );
        assert_eq!(
            config.delivery.policy_for(tags::MESSAGE_UPDATE),
            DeliveryPolicy::DropOldest
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.auth.jwt_secret = "s3cret".into();
        assert!(config.validate().is_ok());

        config.heartbeat.ping_interval_ms = config.heartbeat.pong_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = r#"
            port = 9000

            [auth]
            jwt_secret = "from-file"
        "#;

        let config = Config::layered(
            Some(toml_source(file)),
            env(&[
                ("SWITCHYARD__PORT", "9100"),
                ("SWITCHYARD__HEARTBEAT__PING_INTERVAL_MS", "1000"),
                ("SWITCHYARD__AUTH__JWT_SECRET", "from-env"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat.ping_interval_ms, 1000);
        assert_eq!(config.auth.jwt_secret, "from-env");
    }

    #[test]
    fn test_layered_config_is_validated() {
        let file = "[heartbeat]\nping_interval_ms = 0\n";
        let result = Config::layered(
            Some(toml_source(file)),
            env(&[("SWITCHYARD__AUTH__JWT_SECRET", "s3cret")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/switchyard.toml").is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let valid = Config {
            auth: AuthConfig {
                jwt_secret: "s3cret".into(),
                ..AuthConfig::default()
            },
            ..Config::default()
        };
        assert!(valid.validate().is_ok());

        let zeroed: [fn(&mut Config); 6] = [
            |c| c.heartbeat.ping_interval_ms = 0,
            |c| c.heartbeat.write_timeout_ms = 0,
            |c| c.heartbeat.identify_timeout_ms = 0,
            |c| c.metrics.sample_interval_ms = 0,
            |c| c.limits.max_frame_size = 0,
            |c| {
                c.heartbeat.ping_interval_ms = 0;
                c.heartbeat.pong_timeout_ms = 0;
            },
        ];
        for zero in zeroed {
            let mut config = valid.clone();
            zero(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_client_config_durations() {
        let client = Config::default().client_config();
        assert_eq!(client.ping_period, Duration::from_secs(30));
        assert_eq!(client.pong_wait, Duration::from_secs(45));
        assert_eq!(client.identify_timeout, Duration::from_secs(10));
    }
}
