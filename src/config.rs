use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_CJ_API_BASE: &str = "https://developers.cjdropshipping.com/api2.0/v1";

/// Fee schedule, in basis points of the product subtotal unless noted.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct FeeConfig {
    /// Platform fee without referral or fundraiser attribution
    #[validate(range(max = 5000))]
    pub platform_fee_bps: u32,
    /// Platform fee when a referral or fundraiser applies
    #[validate(range(max = 5000))]
    pub discounted_platform_fee_bps: u32,
    /// Referral or fundraiser share split out of the platform take
    #[validate(range(max = 5000))]
    pub referral_fee_bps: u32,
    /// Processor percentage, as basis points of the charged total
    #[validate(range(max = 2000))]
    pub processor_fee_bps: u32,
    /// Processor fixed fee per charge, in cents
    #[validate(range(max = 1000))]
    pub processor_fixed_cents: i64,
    /// Tag stored on every checkout intent to identify the split formula
    #[validate(length(min = 1, max = 32))]
    pub split_version: String,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 1500,
            discounted_platform_fee_bps: 1000,
            referral_fee_bps: 500,
            processor_fee_bps: 290,
            processor_fixed_cents: 30,
            split_version: "SPLIT_V1".to_string(),
        }
    }
}

/// Payment processor (Stripe) settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PaymentConfig {
    /// Secret API key; checkout, refunds and transfers are disabled without it
    pub secret_key: Option<String>,
    #[validate(url)]
    pub api_base: String,
    /// Signing secret for inbound webhooks
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: u64,
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            api_base: DEFAULT_STRIPE_API_BASE.to_string(),
            webhook_secret: None,
            webhook_tolerance_secs: 300,
            request_timeout_secs: 20,
        }
    }
}

/// Drop-ship supplier (CJ) settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct SupplierConfig {
    pub api_key: Option<String>,
    #[validate(url)]
    pub base_url: String,
    /// Minimum spacing between two outbound supplier requests
    #[validate(custom = "validate_non_zero")]
    pub min_request_interval_ms: u64,
    /// Cooldown after the supplier answers 429
    pub rate_limit_backoff_ms: u64,
    /// Cooldown after the supplier rejects the API key
    pub invalid_key_cooldown_ms: u64,
    /// Token lifetime assumed when the supplier reports no parseable expiry
    pub token_fallback_ttl_secs: i64,
    /// A cached token is only used while it has at least this much life left
    pub token_refresh_margin_secs: i64,
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    pub default_logistic_name: String,
    /// Shared secret expected as `?token=` on inbound supplier webhooks
    pub webhook_token: Option<String>,
    /// A `pending` claim older than this is assumed abandoned and retried
    #[validate(range(min = 60))]
    pub claim_timeout_secs: i64,
}

impl Default for SupplierConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_CJ_API_BASE.to_string(),
            min_request_interval_ms: 2_000,
            rate_limit_backoff_ms: 5 * 60_000,
            invalid_key_cooldown_ms: 60_000,
            token_fallback_ttl_secs: 14 * 24 * 60 * 60,
            token_refresh_margin_secs: 60,
            request_timeout_secs: 30,
            queue_capacity: 256,
            default_logistic_name: "CJ shipping".to_string(),
            webhook_token: None,
            claim_timeout_secs: 15 * 60,
        }
    }
}

/// Payout batch settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PayoutConfig {
    /// Balances below this are never transferred
    #[validate(range(min = 1))]
    pub minimum_payout_cents: i64,
    /// Days of the month (UTC) on which the scheduled batch runs
    #[validate(custom = "validate_payout_days")]
    pub payout_days: Vec<u32>,
    /// Holding period for seller distributions before release
    pub seller_hold_days: i64,
    pub currency: String,
    /// Profile roles treated as platform administrators
    pub admin_roles: Vec<String>,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            minimum_payout_cents: 2_500,
            payout_days: vec![1, 15],
            seller_hold_days: 14,
            currency: "usd".to_string(),
            admin_roles: vec!["admin".to_string(), "platform_admin".to_string()],
        }
    }
}

/// Scheduled job settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    /// Shared secret accepted in `x-job-token` by the job endpoints
    pub job_token: Option<String>,
    /// Run the sweep and payout workers inside the server process
    pub enable_background_jobs: bool,
    #[validate(custom = "validate_non_zero")]
    pub fulfillment_sweep_interval_secs: u64,
    #[validate(custom = "validate_non_zero")]
    pub payout_check_interval_secs: u64,
    #[validate(range(min = 1, max = 1000))]
    pub sweep_batch_size: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            job_token: None,
            enable_background_jobs: false,
            fulfillment_sweep_interval_secs: 15 * 60,
            payout_check_interval_secs: 6 * 60 * 60,
            sweep_batch_size: 100,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Per-request timeout applied by the HTTP layer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    #[validate]
    pub fees: FeeConfig,

    #[serde(default)]
    #[validate]
    pub payments: PaymentConfig,

    #[serde(default)]
    #[validate]
    pub supplier: SupplierConfig,

    #[serde(default)]
    #[validate]
    pub payouts: PayoutConfig,

    #[serde(default)]
    #[validate]
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// Builds a configuration with defaults for every optional section.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            fees: FeeConfig::default(),
            payments: PaymentConfig::default(),
            supplier: SupplierConfig::default(),
            payouts: PayoutConfig::default(),
            jobs: JobsConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.is_production() && self.payments.webhook_secret.is_none() {
            let mut err = ValidationError::new("webhook_secret_required");
            err.message =
                Some("APP__PAYMENTS__WEBHOOK_SECRET must be set in production".into());
            errors.add("payments", err);
        }

        if self.fees.discounted_platform_fee_bps + self.fees.referral_fee_bps
            > self.fees.platform_fee_bps
        {
            let mut err = ValidationError::new("fee_schedule");
            err.message = Some(
                "discounted platform fee plus referral fee must not exceed the standard platform fee"
                    .into(),
            );
            errors.add("fees", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    60
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_non_zero(value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        let mut err = ValidationError::new("non_zero");
        err.message = Some("must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_payout_days(days: &[u32]) -> Result<(), ValidationError> {
    if days.is_empty() || days.iter().any(|d| *d == 0 || *d > 28) {
        let mut err = ValidationError::new("payout_days");
        err.message = Some("payout_days must list days between 1 and 28".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!(
        "marketplace_settlement={},tower_http=info,sea_orm=warn",
        level
    );
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let builder = fmt().with_env_filter(EnvFilter::new(filter_directive));
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://settlement.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://settlement.db?mode=memory".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let mut cfg = base_config();
        cfg.payments.webhook_secret = Some("whsec_test".into());
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_webhook_secret() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.errors().contains_key("payments"));
    }

    #[test]
    fn fee_schedule_must_not_overcharge_referrals() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        cfg.fees.referral_fee_bps = 800;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn defaults_pass_derived_validation() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.payouts.payout_days, vec![1, 15]);
        assert_eq!(cfg.payouts.minimum_payout_cents, 2_500);
        assert_eq!(cfg.supplier.min_request_interval_ms, 2_000);
    }

    #[test]
    fn invalid_payout_days_are_rejected() {
        let mut cfg = base_config();
        cfg.payouts.payout_days = vec![1, 31];
        let errors = cfg.payouts.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("payout_days"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut cfg = base_config();
        cfg.jobs.fulfillment_sweep_interval_secs = 0;
        let errors = cfg.jobs.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("fulfillment_sweep_interval_secs"));

        let mut cfg = base_config();
        cfg.supplier.min_request_interval_ms = 0;
        let errors = cfg.supplier.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("min_request_interval_ms"));
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir(&config_dir).unwrap();
        let mut file = std::fs::File::create(config_dir.join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
            database_url = "sqlite://from-file.db?mode=rwc"
            host = "127.0.0.1"
            port = 9090
            environment = "development"

            [payouts]
            minimum_payout_cents = 5000
            "#
        )
        .unwrap();

        let cfg = load_config_from(config_dir.to_str().unwrap()).unwrap();
        assert_eq!(cfg.database_url, "sqlite://from-file.db?mode=rwc");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.payouts.minimum_payout_cents, 5000);
        assert_eq!(cfg.fees.platform_fee_bps, 1500);
    }
}
