//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, an optional file (YAML or TOML,
//! picked by extension), `TURNSTILE__*` environment variables and finally the
//! legacy variable names used by earlier deployments of the gate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TurnstileError};

/// Environment prefix for layered configuration (`TURNSTILE__LIMITS__DEFAULT_LIMIT`).
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Trusted API key list
    #[serde(default)]
    pub api_keys: ApiKeysConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Admission limits, fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests admitted per window for IP identities
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Requests admitted per window for trusted API key identities
    #[serde(default = "default_api_key_limit")]
    pub api_key_limit: u64,

    /// How long an identity stays blocked once it exceeds its limit, in milliseconds
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            api_key_limit: default_api_key_limit(),
            block_duration_ms: default_block_duration_ms(),
        }
    }
}

impl LimitsConfig {
    /// Blocking duration as a [`Duration`].
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

fn default_limit() -> u64 {
    5
}

fn default_api_key_limit() -> u64 {
    10
}

fn default_block_duration_ms() -> u64 {
    60_000
}

/// Shared counter store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `host:port` or a full `redis://` URL
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Per-command network timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            password: None,
            db: 0,
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Per-command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Connection URL understood by the redis client.
    pub fn connection_url(&self) -> String {
        if self.address.starts_with("redis://") || self.address.starts_with("rediss://") {
            return self.address.clone();
        }

        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}/{}", password, self.address, self.db),
            None => format!("redis://{}/{}", self.address, self.db),
        }
    }
}

fn default_store_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

/// Location of the trusted API key list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    /// Path to the key list (JSON, or YAML by extension)
    #[serde(default = "default_api_keys_path")]
    pub path: String,
}

impl Default for ApiKeysConfig {
    fn default() -> Self {
        Self {
            path: default_api_keys_path(),
        }
    }
}

fn default_api_keys_path() -> String {
    "api-key.json".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load configuration, resolving legacy variables through `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Adding configuration file source");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let builder = apply_legacy_env(builder, lookup)?;
        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gate cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.default_limit == 0 {
            return Err(TurnstileError::Config(
                "limits.default_limit must be greater than zero".to_string(),
            ));
        }
        if self.limits.api_key_limit == 0 {
            return Err(TurnstileError::Config(
                "limits.api_key_limit must be greater than zero".to_string(),
            ));
        }
        if self.limits.block_duration_ms == 0 {
            return Err(TurnstileError::Config(
                "limits.block_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Overlay the variable names used by earlier deployments.
///
/// Unparsable limits are ignored (the layered value wins), but an unparsable
/// `CACHE_EXPIRATION` is an error.
fn apply_legacy_env<F>(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    lookup: F,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    let parse_limit = |name: &str| {
        lookup(name)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
    };

    let block_ms = match lookup("CACHE_EXPIRATION").filter(|v| !v.trim().is_empty()) {
        Some(raw) => {
            let invalid =
                || TurnstileError::Config(format!("invalid CACHE_EXPIRATION value: {:?}", raw));
            let duration = parse_duration(&raw).ok_or_else(invalid)?;
            let millis = i64::try_from(duration.as_millis()).map_err(|_| invalid())?;
            Some(millis.max(1))
        }
        None => None,
    };

    let builder = builder
        .set_override_option(
            "limits.default_limit",
            parse_limit("LIMIT_REQUEST_PER_SECOND_DEFAULT"),
        )?
        .set_override_option(
            "limits.api_key_limit",
            parse_limit("LIMITER_REQUEST_PER_SECOND_API_KEY"),
        )?
        .set_override_option("limits.block_duration_ms", block_ms)?
        .set_override_option(
            "store.address",
            lookup("REDIS_ADDR").filter(|v| !v.is_empty()),
        )?
        .set_override_option(
            "store.password",
            lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
        )?;

    Ok(builder)
}

/// Parse a Go-style duration such as `1m`, `1.5m`, `30s`, `1500ms`, `2h` or `1m30s`.
///
/// Units are `ns`, `us`/`µs`, `ms`, `s`, `m` and `h`; each component may carry
/// a fraction. A bare integer is taken as seconds. Returns `None` for malformed
/// input and for totals that do not fit in a [`Duration`] of u64 nanoseconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let is_numeric = |c: char| c.is_ascii_digit() || c == '.';
    let mut total: u128 = 0;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_numeric(c)).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail.find(is_numeric).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };
        total = total.checked_add(component_nanos(number, unit_nanos)?)?;
        rest = tail;
    }

    u64::try_from(total).ok().map(Duration::from_nanos)
}

/// Nanoseconds in `number` (e.g. `1.5`) of a unit `unit_nanos` long.
fn component_nanos(number: &str, unit_nanos: u128) -> Option<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let mut nanos = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().ok()?.checked_mul(unit_nanos)?
    };

    // Fractions below one nanosecond are dropped
    let mut scale = unit_nanos;
    for digit in fraction.chars() {
        let digit = u128::from(digit.to_digit(10)?);
        scale /= 10;
        nanos = nanos.checked_add(digit * scale)?;
    }
    Some(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::load_with(None, no_env).unwrap();
        assert_eq!(config.limits.default_limit, 5);
        assert_eq!(config.limits.api_key_limit, 10);
        assert_eq!(config.limits.block_duration(), Duration::from_secs(60));
        assert_eq!(config.store.address, "127.0.0.1:6379");
        assert_eq!(config.store.command_timeout(), Duration::from_millis(500));
        assert_eq!(config.api_keys.path, "api-key.json");
        assert_eq!(config.server.http_addr.port(), 8080);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
limits:
  default_limit: 3
  block_duration_ms: 5000
store:
  address: "redis.internal:6380"
  command_timeout_ms: 250
"#
        )
        .unwrap();

        let config = TurnstileConfig::load_with(Some(file.path()), no_env).unwrap();
        assert_eq!(config.limits.default_limit, 3);
        assert_eq!(config.limits.api_key_limit, 10);
        assert_eq!(config.limits.block_duration(), Duration::from_secs(5));
        assert_eq!(config.store.address, "redis.internal:6380");
        assert_eq!(config.store.command_timeout_ms, 250);
    }

    #[test]
    fn test_legacy_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LIMIT_REQUEST_PER_SECOND_DEFAULT", "7"),
            ("LIMITER_REQUEST_PER_SECOND_API_KEY", "20"),
            ("CACHE_EXPIRATION", "2m"),
            ("REDIS_ADDR", "cache:6379"),
            ("REDIS_PASSWORD", "hunter2"),
        ]
        .into_iter()
        .collect();

        let config =
            TurnstileConfig::load_with(None, |name| env.get(name).map(|v| v.to_string()))
                .unwrap();
        assert_eq!(config.limits.default_limit, 7);
        assert_eq!(config.limits.api_key_limit, 20);
        assert_eq!(config.limits.block_duration(), Duration::from_secs(120));
        assert_eq!(config.store.connection_url(), "redis://:hunter2@cache:6379/0");
    }

    #[test]
    fn test_unparsable_legacy_limit_keeps_default() {
        let config = TurnstileConfig::load_with(None, |name| {
            (name == "LIMIT_REQUEST_PER_SECOND_DEFAULT").then(|| "lots".to_string())
        })
        .unwrap();
        assert_eq!(config.limits.default_limit, 5);
    }

    #[test]
    fn test_invalid_cache_expiration_is_an_error() {
        let result = TurnstileConfig::load_with(None, |name| {
            (name == "CACHE_EXPIRATION").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = TurnstileConfig::default();
        config.limits.default_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("1.2.3s"), None);
    }

    #[test]
    fn test_parse_duration_fractions() {
        assert_eq!(parse_duration("1.5m"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("0.5s"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration(".25h"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2.5ms"), Some(Duration::from_micros(2500)));
        assert_eq!(parse_duration("1h0.5m"), Some(Duration::from_secs(3630)));
        assert_eq!(parse_duration("750us"), Some(Duration::from_micros(750)));
    }

    #[test]
    fn test_parse_duration_overflow_is_rejected() {
        assert_eq!(parse_duration("18446744073709551615s1s"), None);
        assert_eq!(parse_duration("18446744073709551615h"), None);
        assert_eq!(
            parse_duration("99999999999999999999999999999999999999999h"),
            None
        );
    }

    #[test]
    fn test_cache_expiration_keeps_sub_second_precision() {
        let config = TurnstileConfig::load_with(None, |name| {
            (name == "CACHE_EXPIRATION").then(|| "1500ms".to_string())
        })
        .unwrap();
        assert_eq!(config.limits.block_duration(), Duration::from_millis(1500));

        let config = TurnstileConfig::load_with(None, |name| {
            (name == "CACHE_EXPIRATION").then(|| "1.5m".to_string())
        })
        .unwrap();
        assert_eq!(config.limits.block_duration(), Duration::from_secs(90));
    }

    #[test]
    fn test_overflowing_cache_expiration_is_an_error() {
        let result = TurnstileConfig::load_with(None, |name| {
            (name == "CACHE_EXPIRATION").then(|| "18446744073709551615s1s".to_string())
        });
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_connection_url_passthrough() {
        let store = StoreConfig {
            address: "redis://example:6379/2".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(store.connection_url(), "redis://example:6379/2");
    }
}
