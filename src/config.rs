//! Application configuration: TOML file, environment overrides, validation.
//!
//! Every section has defaults, so an empty file (or none at all) yields a
//! runnable paper-trading setup. Secrets never live here; see
//! [`crate::gateway::BybitGateway::from_env`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TradingError;
use crate::gateway::{ConfirmPolicy, RetryPolicy};
use crate::models::Timeframe;
use crate::trading::{RiskConfig, StrategyConfig, StrategyKind, TradeManagerConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub risk: RiskConfig,
    pub trade: TradeManagerConfig,
    pub strategy: StrategyConfig,
    pub engine: EngineConfig,
    pub gateway: GatewayConfig,
    pub ledger: LedgerConfig,
    pub connectors: Vec<ConnectorConfig>,
}

/// Scheduling and per-cycle data settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after a close before the key may re-enter
    pub cooldown_secs: i64,

    /// Wait after a bar boundary before reading it, so the exchange has
    /// published the closed bar
    pub bar_close_delay_secs: u64,

    /// Fixed cycle period; `None` aligns cycles to the fastest timeframe
    pub cycle_secs: Option<u64>,

    /// Bars loaded at startup for indicator warm-up
    pub warmup_bars: usize,

    /// Bars fetched per cycle once warm
    pub poll_bars: usize,

    /// Rows without a richer-layer signal before the Donchian fallback
    /// takes over
    pub fallback_window: usize,

    /// Account type passed to the balance endpoint
    pub account_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            bar_close_delay_secs: 2,
            cycle_secs: None,
            warmup_bars: 600,
            poll_bars: 50,
            fallback_window: 600,
            account_type: "UNIFIED".to_string(),
        }
    }
}

/// Retry and confirmation timing for exchange calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            confirm_timeout_ms: 15_000,
            confirm_poll_ms: 500,
        }
    }
}

impl GatewayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn confirm_policy(&self) -> ConfirmPolicy {
        ConfirmPolicy {
            timeout: Duration::from_millis(self.confirm_timeout_ms),
            poll_interval: Duration::from_millis(self.confirm_poll_ms),
        }
    }
}

/// Where starting equity comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EquitySeed {
    Source(SeedSource),
    Fixed(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedSource {
    /// Gateway balance
    Exchange,
    /// Last equity point in the SQLite ledger
    Ledger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory for `trades.csv` / `equity_curve.csv`; `None` disables CSV
    pub csv_dir: Option<PathBuf>,

    /// SQLite URL; `None` disables the database backend
    pub database_url: Option<String>,

    pub equity_seed: EquitySeed,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            csv_dir: Some(PathBuf::from("logs")),
            database_url: Some("sqlite:riskfirst.db?mode=rwc".to_string()),
            equity_seed: EquitySeed::Fixed(dec!(1000)),
        }
    }
}

/// One exchange account and the symbols traded on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub name: String,
    pub testnet: bool,
    pub timeframe: Timeframe,
    pub htf_timeframe: Timeframe,
    pub symbols: Vec<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "bybit".to_string(),
            testnet: false,
            timeframe: Timeframe::M1,
            htf_timeframe: Timeframe::M5,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

impl AppConfig {
    /// Read `path` if given (it must exist), apply environment and CLI
    /// overrides and validate.
    pub fn load(path: Option<&Path>, database_url: Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                let config = Self::from_toml(&text)?;
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            None => {
                warn!("No config file given, using defaults");
                Self::default()
            }
        };

        config.apply_env();
        if let Some(url) = database_url {
            config.ledger.database_url = Some(url);
        }
        if config.connectors.is_empty() {
            config.connectors.push(ConnectorConfig::default());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, TradingError> {
        toml::from_str(text).map_err(|e| TradingError::ConfigInvalid(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Overrides:
    /// - BYBIT_TESTNET forces every connector onto testnet
    /// - RISKFIRST_DATABASE_URL replaces `ledger.database_url`
    /// - RISKFIRST_CSV_DIR replaces `ledger.csv_dir`
    fn apply_env(&mut self) {
        if crate::gateway::testnet_from_env() {
            for connector in &mut self.connectors {
                connector.testnet = true;
            }
        }
        if let Ok(url) = std::env::var("RISKFIRST_DATABASE_URL") {
            self.ledger.database_url = Some(url);
        }
        if let Ok(dir) = std::env::var("RISKFIRST_CSV_DIR") {
            self.ledger.csv_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), TradingError> {
        self.risk.validate()?;
        self.trade.validate()?;
        self.strategy.validate()?;

        let engine = &self.engine;
        if engine.cooldown_secs < 0 {
            return Err(invalid("engine.cooldown_secs must not be negative"));
        }
        if engine.cycle_secs == Some(0) {
            return Err(invalid("engine.cycle_secs must be > 0 when set"));
        }
        if engine.poll_bars == 0 || engine.fallback_window == 0 {
            return Err(invalid("engine.poll_bars and engine.fallback_window must be > 0"));
        }
        let strategy = &self.strategy;
        let richer_window = match strategy.kind {
            StrategyKind::EmaCrossAdx => strategy.ema_slow,
            StrategyKind::MeanReversionRsi => strategy.bb_len,
            StrategyKind::RsiTrendPullback => strategy.ema_fast,
            StrategyKind::DonchianAdxRsi | StrategyKind::TurtleTrend | StrategyKind::BreakoutOnly => 0,
        };
        let min_warmup = strategy.donchian_len.max(strategy.atr_period).max(richer_window) + 1;
        if engine.warmup_bars < min_warmup {
            return Err(invalid(&format!(
                "engine.warmup_bars must be at least {}",
                min_warmup
            )));
        }

        if self.gateway.max_attempts == 0 || self.gateway.call_timeout_ms == 0 {
            return Err(invalid("gateway.max_attempts and gateway.call_timeout_ms must be > 0"));
        }

        match &self.ledger.equity_seed {
            EquitySeed::Fixed(v) if *v <= Decimal::ZERO => {
                return Err(invalid("ledger.equity_seed must be > 0 when fixed"));
            }
            EquitySeed::Source(SeedSource::Ledger) if self.ledger.database_url.is_none() => {
                return Err(invalid("ledger.equity_seed = \"ledger\" needs ledger.database_url"));
            }
            _ => {}
        }

        if self.connectors.is_empty() {
            return Err(invalid("at least one connector is required"));
        }
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for connector in &self.connectors {
            if connector.name.trim().is_empty() {
                return Err(invalid("connector name must not be empty"));
            }
            if !names.insert(connector.name.as_str()) {
                return Err(invalid(&format!("connector {} is listed twice", connector.name)));
            }
            for symbol in &connector.symbols {
                if !keys.insert((connector.name.as_str(), symbol.as_str())) {
                    return Err(invalid(&format!(
                        "{}:{} is configured more than once",
                        connector.name, symbol
                    )));
                }
            }
            if connector.symbols.is_empty() || connector.symbols.iter().any(|s| s.trim().is_empty()) {
                return Err(invalid(&format!(
                    "connector {} needs a non-empty symbol list",
                    connector.name
                )));
            }
            if connector.htf_timeframe.minutes() < connector.timeframe.minutes() {
                return Err(invalid(&format!(
                    "connector {}: htf_timeframe must not be faster than timeframe",
                    connector.name
                )));
            }
        }

        Ok(())
    }

    /// Fastest configured timeframe, which drives the cycle clock.
    pub fn base_timeframe(&self) -> Timeframe {
        self.connectors
            .iter()
            .map(|c| c.timeframe)
            .min_by_key(|tf| tf.minutes())
            .unwrap_or(Timeframe::M1)
    }
}

fn invalid(msg: &str) -> TradingError {
    TradingError::ConfigInvalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let mut config = AppConfig::from_toml("").unwrap();
        config.connectors.push(ConnectorConfig::default());
        config.validate().unwrap();
        assert_eq!(config.risk.risk_per_trade, dec!(0.03));
        assert_eq!(config.engine.account_type, "UNIFIED");
    }

    #[test]
    fn test_full_file() {
        let text = r#"
            [risk]
            risk_per_trade = "0.02"
            max_position_pct = "0.5"

            [trade]
            time_exit_minutes = 120
            trail_always = true

            [strategy]
            kind = "ema_cross_adx"
            donchian_len = 30

            [engine]
            cooldown_secs = 600

            [ledger]
            csv_dir = "out"
            equity_seed = "exchange"

            [[connectors]]
            name = "bybit"
            testnet = true
            timeframe = "5m"
            htf_timeframe = "1h"
            symbols = ["SOLUSDT"]
        "#;

        let config = AppConfig::from_toml(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.risk.max_position_pct, dec!(0.5));
        assert_eq!(config.trade.time_exit_minutes, 120);
        assert!(config.trade.trail_always);
        assert_eq!(config.strategy.donchian_len, 30);
        assert_eq!(config.ledger.equity_seed, EquitySeed::Source(SeedSource::Exchange));
        assert_eq!(config.connectors[0].timeframe, Timeframe::M5);
        assert_eq!(config.base_timeframe(), Timeframe::M5);
    }

    #[test]
    fn test_numeric_equity_seed() {
        let config = AppConfig::from_toml("[ledger]\nequity_seed = 2500").unwrap();
        assert_eq!(config.ledger.equity_seed, EquitySeed::Fixed(dec!(2500)));
    }

    #[test]
    fn test_bad_timeframe_is_config_error() {
        let text = "[[connectors]]\ntimeframe = \"7m\"\nsymbols = [\"BTCUSDT\"]";
        assert!(matches!(
            AppConfig::from_toml(text),
            Err(TradingError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validation_rejects() {
        let base = || {
            let mut config = AppConfig::default();
            config.connectors.push(ConnectorConfig::default());
            config
        };

        let mut config = base();
        config.risk.risk_per_trade = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = base();
        config.connectors[0].symbols.clear();
        assert!(config.validate().is_err());

        let mut config = base();
        config.engine.cycle_secs = Some(0);
        assert!(config.validate().is_err());

        // band window longer than the warm-up
        let mut config = base();
        config.strategy.kind = StrategyKind::MeanReversionRsi;
        config.strategy.bb_len = 30;
        config.engine.warmup_bars = 25;
        assert!(config.validate().is_err());
        config.strategy.kind = StrategyKind::BreakoutOnly;
        assert!(config.validate().is_ok());

        let mut config = base();
        config.ledger.equity_seed = EquitySeed::Fixed(Decimal::ZERO);
        assert!(config.validate().is_err());

        let mut config = base();
        config.ledger.database_url = None;
        config.ledger.equity_seed = EquitySeed::Source(SeedSource::Ledger);
        assert!(config.validate().is_err());

        let mut config = base();
        config.engine.cooldown_secs = -1;
        assert!(config.validate().is_err());

        let mut config = base();
        config.connectors[0].symbols.push("BTCUSDT".into());
        assert!(config.validate().is_err());

        let mut config = base();
        config.connectors.push(ConnectorConfig::default());
        assert!(config.validate().is_err());

        assert!(AppConfig::default().validate().is_err());
    }

    #[test]
    fn test_renders_back_to_toml() {
        let mut config = AppConfig::default();
        config.connectors.push(ConnectorConfig::default());
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
