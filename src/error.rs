//! Error taxonomy shared across the trading core.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Why the sizer declined to produce an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Quantized quantity is zero
    ZeroQuantity,
    /// Quantity below the exchange minimum
    BelowMinQty,
    /// Order notional below the exchange minimum
    BelowMinNotional,
    /// Exposure or budget cap leaves nothing to trade
    NoBudget,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ZeroQuantity => "zero_quantity",
            SkipReason::BelowMinQty => "below_min_qty",
            SkipReason::BelowMinNotional => "below_min_notional",
            SkipReason::NoBudget => "no_budget",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single exchange call, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Network error, rate limit, 5xx or an unknown exchange code. Retried.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Bad credentials or permissions. Never retried; halts the key.
    #[error("fatal gateway error: {0}")]
    Fatal(String),

    /// The call did not complete within its deadline. Retried.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// An order with this client order id already exists. Not retried; the
    /// caller looks the order up instead.
    #[error("duplicate client order id: {0}")]
    Duplicate(String),

    /// The exchange does not list the symbol, or it is not trading.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Fatal(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout(_))
    }
}

/// Errors surfaced by the trading core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradingError {
    /// Entry and stop coincide, so per-unit risk is zero.
    #[error("invalid risk: entry {entry} and stop {stop} leave no per-unit risk")]
    InvalidRisk { entry: Decimal, stop: Decimal },

    /// Sizing produced no tradable quantity. A skip, not a failure.
    #[error("size too small: {0}")]
    SizeTooSmall(SkipReason),

    /// Retries exhausted on a transient failure; the current cycle is skipped.
    #[error("gateway unavailable: {0}")]
    GatewayTransient(String),

    /// Credentials or permission failure; the affected key is halted.
    #[error("gateway rejected credentials: {0}")]
    GatewayFatal(String),

    /// Configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl TradingError {
    /// Outcomes that mean "do nothing this cycle" rather than a fault.
    pub fn is_skip(&self) -> bool {
        matches!(self, TradingError::SizeTooSmall(_))
    }
}

impl From<GatewayError> for TradingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Fatal(msg) => TradingError::GatewayFatal(msg),
            other => TradingError::GatewayTransient(other.to_string()),
        }
    }
}
