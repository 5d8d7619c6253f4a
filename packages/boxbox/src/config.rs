use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [telemetry]
//                    poll_interval_ms = 250
//
//   env var:         BOXBOX_TELEMETRY__POLL_INTERVAL_MS=250   (double underscore = nesting)

/// Minimum length of the token signing secret.
pub const MIN_SECRET_LEN: usize = 32;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
    #[serde(default)]
    pub redis: RedisFileConfig,
    #[serde(default)]
    pub telemetry: TelemetryFileConfig,
}

/// HTTP listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Human-readable logs instead of JSON
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            debug: false,
        }
    }
}

/// Token settings (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_token_minutes")]
    pub access_token_expire_minutes: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            access_token_expire_minutes: default_token_minutes(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    /// Defaults to `boxbox.db` in the data directory
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisFileConfig {
    /// Telemetry cache; caching is disabled when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RedisFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Telemetry stream tunables (lives under `[telemetry]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Generate simulated data when nothing is cached
    #[serde(default = "default_simulate")]
    pub simulate: bool,
    /// Outbound frames buffered per connection before new ones are dropped
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

impl Default for TelemetryFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            simulate: default_simulate(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
    ]
}
fn default_token_minutes() -> u64 {
    30
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_simulate() -> bool {
    true
}
fn default_send_queue_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config.toml → BOXBOX_* env vars.
///
/// `config_file` overrides the default `<data_dir>/config.toml` location.
///
/// Env vars use double-underscore for nesting into sections:
///   `BOXBOX_AUTH__SECRET_KEY=...`  →  `auth.secret_key = ...`
///   `BOXBOX_SERVER__PORT=9000`     →  `server.port = 9000`
pub fn load_config(data_dir: &Path, config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join("config.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("BOXBOX_").split("__"))
}

// =============================================================================
// Runtime config structs (validated from FileConfig, used throughout the server)
// =============================================================================

/// HTTP listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub debug: bool,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            cors_origins: fc.cors_origins.clone(),
            debug: fc.debug,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Token signing configuration (runtime view).
#[derive(Clone)]
pub struct AuthConfig {
    pub secret_key: String,
    pub access_token_ttl: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<redacted>")
            .field("access_token_ttl", &self.access_token_ttl)
            .finish()
    }
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Result<Self> {
        let Some(secret_key) = fc.secret_key.clone() else {
            bail!("auth.secret_key is required (set BOXBOX_AUTH__SECRET_KEY or [auth] secret_key)");
        };
        if secret_key.len() < MIN_SECRET_LEN {
            bail!(
                "auth.secret_key must be at least {} characters, got {}",
                MIN_SECRET_LEN,
                secret_key.len()
            );
        }
        if fc.access_token_expire_minutes == 0 {
            bail!("auth.access_token_expire_minutes must be greater than zero");
        }
        Ok(Self {
            secret_key,
            access_token_ttl: Duration::from_secs(fc.access_token_expire_minutes * 60),
        })
    }
}

/// Telemetry stream and cache configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub poll_interval: Duration,
    pub simulate: bool,
    pub send_queue_capacity: usize,
    pub redis_url: Option<String>,
    pub cache_ttl: Duration,
}

impl TelemetryConfig {
    pub fn from_file(fc: &TelemetryFileConfig, redis: &RedisFileConfig) -> Result<Self> {
        if fc.poll_interval_ms == 0 {
            bail!("telemetry.poll_interval_ms must be greater than zero");
        }
        if fc.send_queue_capacity == 0 {
            bail!("telemetry.send_queue_capacity must be greater than zero");
        }
        Ok(Self {
            poll_interval: Duration::from_millis(fc.poll_interval_ms),
            simulate: fc.simulate,
            send_queue_capacity: fc.send_queue_capacity,
            redis_url: redis.url.clone().filter(|url| !url.is_empty()),
            cache_ttl: Duration::from_secs(redis.cache_ttl_secs),
        })
    }
}

/// Every runtime view, validated once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub telemetry: TelemetryConfig,
    pub database_url: String,
}

impl Settings {
    pub fn from_file(fc: &FileConfig, layout: &BoxboxConfig) -> Result<Self> {
        Ok(Self {
            server: ServerConfig::from_file(&fc.server),
            auth: AuthConfig::from_file(&fc.auth)?,
            telemetry: TelemetryConfig::from_file(&fc.telemetry, &fc.redis)?,
            database_url: fc
                .database
                .url
                .clone()
                .unwrap_or_else(|| layout.db_url()),
        })
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct BoxboxConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl BoxboxConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".boxbox"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("boxbox.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
