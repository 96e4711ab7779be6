//! Server configuration.
//!
//! Provides the options for the socket server and its auth engine. Options
//! are validated and normalised once when the server is built and stay
//! immutable afterwards; only the auth options can be swapped at runtime.

use std::env;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default per-socket channel subscription cap.
pub const DEFAULT_SOCKET_CHANNEL_LIMIT: usize = 1000;

/// Default auth token lifetime in seconds.
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 86_400;

/// Longest accepted default token lifetime in seconds (ten years).
pub const MAX_TOKEN_EXPIRY_SECS: u64 = 315_360_000;

/// Configuration for the [`crate::auth::AuthEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOptions {
    /// Symmetric signing secret. A random one is generated when absent.
    pub secret_key: Option<String>,

    /// PEM-encoded private key for asymmetric algorithms.
    pub private_key: Option<String>,

    /// PEM-encoded public key for asymmetric algorithms.
    pub public_key: Option<String>,

    /// Signing algorithm.
    pub algorithm: Algorithm,

    /// Default token lifetime in seconds.
    pub default_expiry: u64,

    /// Interval between auth token expiry sweeps in milliseconds.
    pub expire_check_interval_ms: u64,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            secret_key: None,
            private_key: None,
            public_key: None,
            algorithm: Algorithm::HS256,
            default_expiry: DEFAULT_TOKEN_EXPIRY_SECS,
            expire_check_interval_ms: 12_000,
        }
    }
}

impl AuthOptions {
    /// Creates auth options signing with the given symmetric secret.
    #[must_use]
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret_key: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Sets an asymmetric key pair.
    ///
    /// Switches the algorithm to RS256 if it was still an HMAC algorithm.
    #[must_use]
    pub fn with_key_pair(
        mut self,
        private_key: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        self.private_key = Some(private_key.into());
        self.public_key = Some(public_key.into());
        if is_symmetric(self.algorithm) {
            self.algorithm = Algorithm::RS256;
        }
        self
    }

    /// Sets the signing algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets the default token lifetime.
    #[must_use]
    pub fn with_default_expiry(mut self, secs: u64) -> Self {
        self.default_expiry = secs;
        self
    }

    /// Sets the expiry sweep interval.
    #[must_use]
    pub fn with_expire_check_interval(mut self, ms: u64) -> Self {
        self.expire_check_interval_ms = ms;
        self
    }

    /// Returns true if a full asymmetric key pair is configured.
    #[must_use]
    pub fn has_key_pair(&self) -> bool {
        self.private_key.is_some() && self.public_key.is_some()
    }

    /// Validates the auth configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if only half of a key pair is supplied or if the
    /// key material does not fit the algorithm.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key.is_some() != self.public_key.is_some() {
            return Err(ConfigError::IncompleteKeyPair);
        }

        let symmetric = is_symmetric(self.algorithm);
        if symmetric && self.has_key_pair() {
            return Err(ConfigError::AlgorithmKeyMismatch(format!(
                "{:?} requires a secret key, not a key pair",
                self.algorithm
            )));
        }
        if !symmetric && !self.has_key_pair() {
            return Err(ConfigError::AlgorithmKeyMismatch(format!(
                "{:?} requires a private/public key pair",
                self.algorithm
            )));
        }

        if self.default_expiry == 0 || self.default_expiry > MAX_TOKEN_EXPIRY_SECS {
            return Err(ConfigError::InvalidDefaultExpiry);
        }

        if self.expire_check_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval("expire_check_interval_ms"));
        }

        Ok(())
    }
}

/// Returns true for HMAC algorithms.
#[must_use]
pub fn is_symmetric(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    )
}

/// Configuration for the socket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Node identifier, used to drop our own publishes echoed by the cluster.
    pub id: String,

    /// Listening port.
    pub port: u16,

    /// Handshake URL path. Normalised to a leading slash and no trailing slash.
    pub path: String,

    /// Allowed origins as `host:port` entries. `None` allows every origin.
    pub origins: Option<Vec<String>>,

    /// Per-socket channel subscription cap. `None` means unlimited.
    pub socket_channel_limit: Option<usize>,

    /// Whether clients may publish to channels.
    pub allow_client_publish: bool,

    /// Whether a publishing socket receives its own publish.
    pub publish_to_publisher: bool,

    /// How long an invoke waits for its response, in milliseconds.
    pub ack_timeout_ms: u64,

    /// Interval between server pings in milliseconds.
    pub ping_interval_ms: u64,

    /// Maximum inbound message size in bytes. `None` keeps the transport default.
    pub max_payload: Option<usize>,

    /// Maximum buffered outbound bytes per socket before publishes skip it.
    pub max_backpressure: usize,

    /// Fraction of `max_backpressure` under which a socket counts as drained.
    pub low_backpressure_ratio: f64,

    /// Whether to serve `<path>/health`.
    pub health_endpoint: bool,

    /// Auth engine options.
    pub auth: AuthOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            port: DEFAULT_PORT,
            path: "/switchyard".to_string(),
            origins: None,
            socket_channel_limit: Some(DEFAULT_SOCKET_CHANNEL_LIMIT),
            allow_client_publish: true,
            publish_to_publisher: true,
            ack_timeout_ms: 7000,
            ping_interval_ms: 8000,
            max_payload: None,
            max_backpressure: 1024 * 1024,
            low_backpressure_ratio: 0.5,
            health_endpoint: true,
            auth: AuthOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Creates options listening on the given port.
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Sets the handshake path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the allowed origins.
    #[must_use]
    pub fn with_origins(mut self, origins: Option<Vec<String>>) -> Self {
        self.origins = origins;
        self
    }

    /// Sets the per-socket channel limit.
    #[must_use]
    pub fn with_socket_channel_limit(mut self, limit: Option<usize>) -> Self {
        self.socket_channel_limit = limit;
        self
    }

    /// Enables or disables client publishing.
    #[must_use]
    pub fn with_allow_client_publish(mut self, allow: bool) -> Self {
        self.allow_client_publish = allow;
        self
    }

    /// Sets whether publishers receive their own publishes.
    #[must_use]
    pub fn with_publish_to_publisher(mut self, enabled: bool) -> Self {
        self.publish_to_publisher = enabled;
        self
    }

    /// Sets the invoke acknowledgement timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    /// Sets the ping interval.
    #[must_use]
    pub fn with_ping_interval(mut self, ms: u64) -> Self {
        self.ping_interval_ms = ms;
        self
    }

    /// Sets the maximum inbound payload size.
    #[must_use]
    pub fn with_max_payload(mut self, bytes: Option<usize>) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Sets the backpressure limits.
    #[must_use]
    pub fn with_backpressure(mut self, max_bytes: usize, low_ratio: f64) -> Self {
        self.max_backpressure = max_bytes;
        self.low_backpressure_ratio = low_ratio;
        self
    }

    /// Enables or disables the health endpoint.
    #[must_use]
    pub fn with_health_endpoint(mut self, enabled: bool) -> Self {
        self.health_endpoint = enabled;
        self
    }

    /// Sets the auth options.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthOptions) -> Self {
        self.auth = auth;
        self
    }

    /// Returns the buffered byte count at or under which a socket has low
    /// send backpressure.
    #[must_use]
    pub fn low_backpressure_mark(&self) -> usize {
        (self.max_backpressure as f64 * self.low_backpressure_ratio) as usize
    }

    /// Returns a copy with the path normalised.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.path = normalize_path(&self.path);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::InvalidInterval("ack_timeout_ms"));
        }

        if self.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval("ping_interval_ms"));
        }

        if self.max_backpressure == 0 {
            return Err(ConfigError::InvalidBackpressure);
        }

        if !(self.low_backpressure_ratio > 0.0 && self.low_backpressure_ratio <= 1.0) {
            return Err(ConfigError::InvalidBackpressure);
        }

        if let Some(origins) = &self.origins {
            if let Some(bad) = origins.iter().find(|o| o.trim().is_empty()) {
                return Err(ConfigError::InvalidOrigin(bad.clone()));
            }
        }

        self.auth.validate()
    }

    /// Loads options from `SWITCHYARD_*` environment variables on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(port) = parse_env::<u16>("SWITCHYARD_PORT")? {
            options.port = port;
        }
        if let Ok(path) = env::var("SWITCHYARD_PATH") {
            options.path = path;
        }
        if let Ok(origins) = env::var("SWITCHYARD_ORIGINS") {
            let entries: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            options.origins = Some(entries);
        }
        if let Ok(secret) = env::var("SWITCHYARD_SECRET") {
            options.auth.secret_key = Some(secret);
        }
        if let Ok(limit) = env::var("SWITCHYARD_CHANNEL_LIMIT") {
            options.socket_channel_limit = if limit.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(limit.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "SWITCHYARD_CHANNEL_LIMIT",
                    value: limit.clone(),
                })?)
            };
        }
        if let Some(allow) = parse_env::<bool>("SWITCHYARD_ALLOW_CLIENT_PUBLISH")? {
            options.allow_client_publish = allow;
        }
        if let Some(enabled) = parse_env::<bool>("SWITCHYARD_PUBLISH_TO_PUBLISHER")? {
            options.publish_to_publisher = enabled;
        }
        if let Some(ms) = parse_env::<u64>("SWITCHYARD_PING_INTERVAL_MS")? {
            options.ping_interval_ms = ms;
        }

        Ok(options)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

/// Normalises a handshake path: leading slash, no trailing slash, and the
/// root path collapses to an empty string.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Only one half of an asymmetric key pair was supplied.
    #[error("auth options must provide both a private_key and a public_key, or neither")]
    IncompleteKeyPair,

    /// The key material does not fit the algorithm.
    #[error("auth key material mismatch: {0}")]
    AlgorithmKeyMismatch(String),

    /// A key could not be parsed.
    #[error("invalid auth key: {0}")]
    InvalidKey(String),

    /// Default expiry is zero or too far in the future.
    #[error("default_expiry must be between 1 and 315360000 seconds")]
    InvalidDefaultExpiry,

    /// An interval must be positive.
    #[error("{0} must be > 0")]
    InvalidInterval(&'static str),

    /// Backpressure limits are out of range.
    #[error("max_backpressure must be > 0 and low_backpressure_ratio in (0, 1]")]
    InvalidBackpressure,

    /// An origin entry is malformed.
    #[error("invalid origin entry: {0:?}")]
    InvalidOrigin(String),

    /// External broker options are unusable.
    #[error("invalid broker options: {0}")]
    InvalidBroker(String),

    /// An environment variable could not be parsed.
    #[error("invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let options = ServerOptions::default();
        assert_eq!(options.port, 3000);
        assert_eq!(options.socket_channel_limit, Some(1000));
        assert!(options.allow_client_publish);
        assert!(options.publish_to_publisher);
        assert_eq!(options.ack_timeout_ms, 7000);
        assert_eq!(options.ping_interval_ms, 8000);
        assert!(options.health_endpoint);
        assert_eq!(options.auth.algorithm, Algorithm::HS256);
        assert_eq!(options.auth.default_expiry, 86_400);
        assert_eq!(options.auth.expire_check_interval_ms, 12_000);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("socket"), "/socket");
        assert_eq!(normalize_path("/socket/"), "/socket");
        assert_eq!(normalize_path("/a/b//"), "/a/b");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_builder() {
        let options = ServerOptions::with_port(8080)
            .with_path("ws/")
            .with_socket_channel_limit(None)
            .with_publish_to_publisher(false)
            .normalized();

        assert_eq!(options.port, 8080);
        assert_eq!(options.path, "/ws");
        assert_eq!(options.socket_channel_limit, None);
        assert!(!options.publish_to_publisher);
    }

    #[test]
    fn test_low_backpressure_mark() {
        let options = ServerOptions::default().with_backpressure(1000, 0.5);
        assert_eq!(options.low_backpressure_mark(), 500);
    }

    #[test]
    fn test_validate_zero_ping_interval() {
        let options = ServerOptions::default().with_ping_interval(0);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidInterval("ping_interval_ms"))
        ));
    }

    #[test]
    fn test_validate_bad_backpressure_ratio() {
        let options = ServerOptions::default().with_backpressure(1000, 1.5);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidBackpressure)
        ));
    }

    #[test]
    fn test_validate_half_key_pair() {
        let mut auth = AuthOptions::default().with_algorithm(Algorithm::RS256);
        auth.private_key = Some("private".to_string());
        assert!(matches!(
            auth.validate(),
            Err(ConfigError::IncompleteKeyPair)
        ));
    }

    #[test]
    fn test_validate_asymmetric_without_pair() {
        let auth = AuthOptions::default().with_algorithm(Algorithm::ES256);
        assert!(matches!(
            auth.validate(),
            Err(ConfigError::AlgorithmKeyMismatch(_))
        ));
    }

    #[test]
    fn test_with_key_pair_switches_algorithm() {
        let auth = AuthOptions::default().with_key_pair("private", "public");
        assert_eq!(auth.algorithm, Algorithm::RS256);
        assert!(auth.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_origin() {
        let options = ServerOptions::default().with_origins(Some(vec![" ".to_string()]));
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidOrigin(_))
        ));
    }
}
