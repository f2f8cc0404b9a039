//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File};
use keel_broker::RetryPolicy;
use keel_core::TradingMode;
use keel_execution::{FillStreamConfig, OrderManagerConfig, RepositionConfig};
use keel_markets::{CoalescerConfig, FocusConfig, MoverConfig};
use keel_paper::PaperConfig;
use keel_reconcile::{CheckLimits, ReconcileConfig, ReconcileTolerances};
use keel_risk::{CircuitBreakerConfig, HeartbeatConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExchangeConfig {
    /// `paper` or the name of a live binding.
    #[serde(default = "default_exchange_driver")]
    pub driver: String,
    #[serde(default)]
    pub rest_url: String,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(default)]
    pub paper: PaperConfig,
}

/// Shared token bucket in front of every exchange call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_ms")]
    pub refill_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrdersConfig {
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: i64,
    #[serde(default = "default_exit_ttl_secs")]
    pub exit_ttl_secs: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub reposition: RepositionConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub max_trade_notional: Option<Decimal>,
    #[serde(default)]
    pub max_daily_notional: Option<Decimal>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReconcileSettings {
    #[serde(default)]
    pub tolerances: ReconcileTolerances,
    #[serde(default = "default_safe_mode_cooldown_secs")]
    pub safe_mode_cooldown_secs: i64,
    /// REST sweep interval backing up the execution stream.
    #[serde(default = "default_fill_fallback_poll_secs")]
    pub fill_fallback_poll_secs: u64,
    #[serde(default = "default_fill_queue_capacity")]
    pub fill_queue_capacity: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarketDataConfig {
    #[serde(default)]
    pub coalescer: CoalescerConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub movers: MoverConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Focus quotes older than this are not used for pricing.
    #[serde(default = "default_max_quote_age_secs")]
    pub max_quote_age_secs: i64,
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
    /// Identical alerts inside this window are suppressed.
    #[serde(default = "default_alert_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LiveConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_live_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_equity_snapshot_secs")]
    pub equity_snapshot_secs: u64,
    #[serde(default = "default_state_persist_secs")]
    pub state_persist_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::default(),
            database_path: default_database_path(),
            log_level: default_log_level(),
            exchange: ExchangeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            orders: OrdersConfig::default(),
            risk: RiskConfig::default(),
            reconcile: ReconcileSettings::default(),
            market_data: MarketDataConfig::default(),
            alerting: AlertingConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            driver: default_exchange_driver(),
            rest_url: String::new(),
            ws_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            quote_currency: default_quote_currency(),
            paper: PaperConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_ms: default_refill_ms(),
        }
    }
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: default_entry_ttl_secs(),
            exit_ttl_secs: default_exit_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            reposition: RepositionConfig::default(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            tolerances: ReconcileTolerances::default(),
            safe_mode_cooldown_secs: default_safe_mode_cooldown_secs(),
            fill_fallback_poll_secs: default_fill_fallback_poll_secs(),
            fill_queue_capacity: default_fill_queue_capacity(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            coalescer: CoalescerConfig::default(),
            focus: FocusConfig::default(),
            movers: MoverConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            max_quote_age_secs: default_max_quote_age_secs(),
            catalog_file: None,
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_alert_timeout_ms(),
            cooldown_secs: default_alert_cooldown_secs(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            metrics_addr: default_metrics_addr(),
            log_path: default_live_log_path(),
            equity_snapshot_secs: default_equity_snapshot_secs(),
            state_persist_secs: default_state_persist_secs(),
        }
    }
}

impl AppConfig {
    pub fn is_paper(&self) -> bool {
        self.mode.is_paper()
    }

    /// Order manager settings with the risk section's notional caps folded in.
    pub fn order_manager_config(&self) -> OrderManagerConfig {
        OrderManagerConfig {
            entry_ttl_secs: self.orders.entry_ttl_secs,
            exit_ttl_secs: self.orders.exit_ttl_secs,
            poll_interval_secs: self.orders.poll_interval_secs,
            reposition: self.orders.reposition.clone(),
            max_trade_notional: self.risk.max_trade_notional,
            max_daily_notional: self.risk.max_daily_notional,
        }
    }

    pub fn fill_stream_config(&self) -> FillStreamConfig {
        FillStreamConfig {
            fallback_poll_secs: self.reconcile.fill_fallback_poll_secs,
            queue_capacity: self.reconcile.fill_queue_capacity,
        }
    }

    /// Boot reconciliation settings; limits mirror the risk section.
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            tolerances: self.reconcile.tolerances,
            safe_mode_cooldown_secs: self.reconcile.safe_mode_cooldown_secs,
            quote_currency: self.exchange.quote_currency.clone(),
            limits: CheckLimits {
                max_daily_notional: self.risk.max_daily_notional,
                max_open_positions: self.risk.breaker.max_positions,
            },
        }
    }

    /// Reject settings that would make the runtime misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if !self.is_paper() {
            if self.exchange.driver == "paper" {
                bail!("live mode needs a live exchange driver, not 'paper'");
            }
            if self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty() {
                bail!("live mode needs exchange.api_key and exchange.api_secret");
            }
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_ms == 0 {
            bail!("rate_limit.capacity and rate_limit.refill_ms must be positive");
        }
        if self.orders.entry_ttl_secs <= 0 || self.orders.exit_ttl_secs <= 0 {
            bail!("order TTLs must be positive");
        }
        if self.exchange.paper.quote_currency != self.exchange.quote_currency {
            bail!(
                "exchange.paper.quote_currency ({}) differs from exchange.quote_currency ({})",
                self.exchange.paper.quote_currency,
                self.exchange.quote_currency
            );
        }
        for (name, value) in [
            ("risk.max_trade_notional", self.risk.max_trade_notional),
            ("risk.max_daily_notional", self.risk.max_daily_notional),
        ] {
            if value.is_some_and(|cap| cap <= Decimal::ZERO) {
                bail!("{name} must be positive when set");
            }
        }
        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/keel.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exchange_driver() -> String {
    "paper".to_string()
}

fn default_quote_currency() -> String {
    "USD".to_string()
}

fn default_rate_capacity() -> u32 {
    15
}

fn default_refill_ms() -> u64 {
    3_000
}

fn default_entry_ttl_secs() -> i64 {
    60
}

fn default_exit_ttl_secs() -> i64 {
    20
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_safe_mode_cooldown_secs() -> i64 {
    60
}

fn default_fill_fallback_poll_secs() -> u64 {
    30
}

fn default_fill_queue_capacity() -> usize {
    4_096
}

fn default_max_quote_age_secs() -> i64 {
    30
}

fn default_alert_timeout_ms() -> u64 {
    5_000
}

fn default_alert_cooldown_secs() -> u64 {
    60
}

fn default_instance_id() -> String {
    "keel-1".into()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_live_log_path() -> PathBuf {
    PathBuf::from("./logs/keel.json")
}

fn default_equity_snapshot_secs() -> u64 {
    300
}

fn default_state_persist_secs() -> u64 {
    30
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `KEEL__`, e.g. `KEEL__RISK__MAX_DAILY_NOTIONAL`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// [`load_config`] against an arbitrary configuration directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("KEEL")
            .prefix_separator("__")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
