//! Configuration management for the NexusX gateway: layered file and
//! environment loading, validation, and a builder for programmatic
//! construction.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use gateway_types::{GatewayError, GatewayResult, Usdc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level gateway configuration, covering service/upstream/billing/x402/
/// bundle settings plus the ambient logging/rate-limit/performance surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub service: ServiceConfig,
    pub upstream: UpstreamConfig,
    pub billing: BillingConfig,
    pub x402: X402Config,
    pub bundle: BundleConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub performance: PerformanceConfig,
}

/// HTTP service bind/body-size configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Inbound request body cap, default 10 MiB.
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: u64,

    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
}

/// Upstream/proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,

    /// Proxied response body cap, default 50 MiB.
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: u64,

    #[serde(default = "default_route_cache_ttl_ms")]
    pub route_cache_ttl_ms: u64,
}

/// Individual-call billing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_platform_fee_rate")]
    pub platform_fee_rate: Usdc,

    #[serde(default)]
    pub sandbox_enabled: bool,
}

/// Pay-per-call (x402) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X402Config {
    #[serde(default)]
    pub enabled: bool,

    pub facilitator_url: String,
    pub network: String,
    pub platform_address: String,

    #[serde(default = "default_x402_max_timeout_seconds")]
    pub max_timeout_seconds: u64,

    #[serde(default = "default_facilitator_request_timeout_ms")]
    pub facilitator_request_timeout_ms: u64,

    /// USDC contract address keyed by network name.
    #[serde(default)]
    pub usdc_asset_addresses: std::collections::HashMap<String, String>,
}

/// Bundle settlement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default = "default_bundle_platform_fee_rate")]
    pub platform_fee_rate: Usdc,

    #[serde(default = "default_bundle_session_ttl_ms")]
    pub session_ttl_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default)]
    pub file_enabled: bool,

    pub file_path: Option<String>,
}

/// Rate-limiter defaults used when an API key doesn't specify its own rpm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub default_requests_per_minute: u32,

    #[serde(default = "default_cleaner_interval_ms")]
    pub cleaner_interval_ms: u64,
}

/// Performance/runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: u32,

    #[serde(default = "default_demand_signal_queue_capacity")]
    pub demand_signal_queue_capacity: usize,

    #[serde(default = "default_persistence_queue_capacity")]
    pub persistence_queue_capacity: usize,

    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_request_body_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_response_body_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_upstream_timeout_ms() -> u64 {
    30_000
}
fn default_route_cache_ttl_ms() -> u64 {
    60_000
}
fn default_platform_fee_rate() -> Decimal {
    Decimal::new(12, 2) // 0.12
}
fn default_bundle_platform_fee_rate() -> Decimal {
    Decimal::new(15, 2) // 0.15
}
fn default_bundle_session_ttl_ms() -> u64 {
    30 * 60 * 1000
}
fn default_x402_max_timeout_seconds() -> u64 {
    30
}
fn default_facilitator_request_timeout_ms() -> u64 {
    15_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_cleaner_interval_ms() -> u64 {
    5 * 60 * 1000
}
fn default_worker_threads() -> u32 {
    num_cpus::get() as u32
}
fn default_demand_signal_queue_capacity() -> usize {
    1024
}
fn default_persistence_queue_capacity() -> usize {
    1024
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                bind_address: default_bind_address(),
                port: default_port(),
                max_request_body_bytes: default_max_request_body_bytes(),
                cors: CorsConfig {
                    allowed_origins: default_allowed_origins(),
                    allow_credentials: false,
                },
            },
            upstream: UpstreamConfig {
                timeout_ms: default_upstream_timeout_ms(),
                max_response_body_bytes: default_max_response_body_bytes(),
                route_cache_ttl_ms: default_route_cache_ttl_ms(),
            },
            billing: BillingConfig {
                platform_fee_rate: default_platform_fee_rate(),
                sandbox_enabled: true,
            },
            x402: X402Config {
                enabled: false,
                facilitator_url: "https://x402.example.com".to_string(),
                network: "base-sepolia".to_string(),
                platform_address: String::new(),
                max_timeout_seconds: default_x402_max_timeout_seconds(),
                facilitator_request_timeout_ms: default_facilitator_request_timeout_ms(),
                usdc_asset_addresses: std::collections::HashMap::new(),
            },
            bundle: BundleConfig {
                platform_fee_rate: default_bundle_platform_fee_rate(),
                session_ttl_ms: default_bundle_session_ttl_ms(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
                file_enabled: false,
                file_path: None,
            },
            rate_limit: RateLimitConfig {
                default_requests_per_minute: default_requests_per_minute(),
                cleaner_interval_ms: default_cleaner_interval_ms(),
            },
            performance: PerformanceConfig {
                worker_threads: default_worker_threads(),
                demand_signal_queue_capacity: default_demand_signal_queue_capacity(),
                persistence_queue_capacity: default_persistence_queue_capacity(),
                metrics_enabled: default_metrics_enabled(),
            },
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a single TOML file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: GatewayConfig =
            toml::from_str(&config_str).with_context(|| "Failed to parse config file")?;

        config.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration layered from an optional file plus `NEXUSX_`-prefixed
    /// environment variables, file values taking precedence over defaults and
    /// environment variables taking precedence over the file.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("nexusx.config").required(false))
            .add_source(File::with_name("/etc/nexusx/config").required(false))
            .add_source(Environment::with_prefix("NEXUSX").separator("_"))
            .build()
            .context("Failed to build configuration")?;

        let gateway_config: GatewayConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        gateway_config
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(gateway_config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), config_str)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Validate configuration invariants; called at startup only (no hot-reload).
    pub fn validate(&self) -> GatewayResult<()> {
        if self.service.port == 0 {
            return Err(GatewayError::InvalidInput(
                "service port must be greater than 0".to_string(),
            ));
        }
        if self.service.max_request_body_bytes == 0 {
            return Err(GatewayError::InvalidInput(
                "max_request_body_bytes must be greater than 0".to_string(),
            ));
        }
        if self.upstream.timeout_ms == 0 {
            return Err(GatewayError::InvalidInput(
                "upstream timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.upstream.max_response_body_bytes == 0 {
            return Err(GatewayError::InvalidInput(
                "max_response_body_bytes must be greater than 0".to_string(),
            ));
        }
        if self.billing.platform_fee_rate < Decimal::ZERO || self.billing.platform_fee_rate > Decimal::ONE
        {
            return Err(GatewayError::InvalidInput(
                "platform_fee_rate must be within [0, 1]".to_string(),
            ));
        }
        if self.bundle.platform_fee_rate < Decimal::ZERO || self.bundle.platform_fee_rate > Decimal::ONE
        {
            return Err(GatewayError::InvalidInput(
                "bundle platform_fee_rate must be within [0, 1]".to_string(),
            ));
        }
        if self.x402.enabled && self.x402.platform_address.is_empty() {
            return Err(GatewayError::InvalidInput(
                "x402 platform_address must be set when x402 is enabled".to_string(),
            ));
        }
        if self.performance.worker_threads == 0 {
            return Err(GatewayError::InvalidInput(
                "worker_threads must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective `tracing::Level` for the configured log level string.
    pub fn effective_log_level(&self) -> tracing::Level {
        match self.logging.level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Builder for programmatic/test construction.
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.service.port = port;
        self
    }

    pub fn with_platform_fee_rate(mut self, rate: Decimal) -> Self {
        self.config.billing.platform_fee_rate = rate;
        self
    }

    pub fn with_bundle_platform_fee_rate(mut self, rate: Decimal) -> Self {
        self.config.bundle.platform_fee_rate = rate;
        self
    }

    pub fn with_x402(mut self, facilitator_url: String, network: String, platform_address: String) -> Self {
        self.config.x402.enabled = true;
        self.config.x402.facilitator_url = facilitator_url;
        self.config.x402.network = network;
        self.config.x402.platform_address = platform_address;
        self
    }

    pub fn with_route_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.config.upstream.route_cache_ttl_ms = ttl_ms;
        self
    }

    pub fn with_log_level(mut self, level: String) -> Self {
        self.config.logging.level = level;
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(self.config)
    }
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_validates() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = GatewayConfigBuilder::new()
            .with_port(9090)
            .with_platform_fee_rate(dec!(0.2))
            .build()
            .unwrap();

        assert_eq!(config.service.port, 9090);
        assert_eq!(config.billing.platform_fee_rate, dec!(0.2));
    }

    #[test]
    fn x402_requires_platform_address() {
        let mut config = GatewayConfig::default();
        config.x402.enabled = true;
        config.x402.platform_address = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fee_rate_out_of_range_rejected() {
        let mut config = GatewayConfig::default();
        config.billing.platform_fee_rate = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml_file() {
        let config = GatewayConfig::default();
        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();

        let reloaded = GatewayConfig::load_from_path(file.path()).unwrap();
        assert_eq!(reloaded.service.port, config.service.port);
        assert_eq!(reloaded.billing.platform_fee_rate, config.billing.platform_fee_rate);
    }
}
