//! Order requests, fill reports and exchange trading limits.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// A single order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub connector: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub reduce_only: bool,

    /// Limit price; `None` submits a market order
    #[serde(default)]
    pub price: Option<Decimal>,

    /// Idempotency key forwarded as the exchange's client order id
    pub client_order_id: String,

    /// Last observed price, used by simulated gateways to fill
    pub reference_price: Decimal,
}

impl OrderRequest {
    pub fn market(
        connector: &str,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
        reference_price: Decimal,
    ) -> Self {
        Self {
            connector: connector.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only,
            price: None,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
            reference_price,
        }
    }

    pub fn order_type(&self) -> &'static str {
        if self.price.is_some() {
            "Limit"
        } else {
            "Market"
        }
    }
}

/// Execution state of a previously acknowledged order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FillStatus {
    Filled {
        qty: Decimal,
        avg_price: Option<Decimal>,
    },
    PartiallyFilled {
        filled_qty: Decimal,
        avg_price: Option<Decimal>,
    },
    Pending,
    Rejected {
        reason: String,
    },
}

/// Minimum order rules for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeLimits {
    pub min_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub qty_step: Decimal,
}

impl Default for ExchangeLimits {
    fn default() -> Self {
        Self {
            min_qty: None,
            min_notional: None,
            qty_step: Decimal::new(1, 6), // 0.000001
        }
    }
}

impl ExchangeLimits {
    /// Round `qty` down to the step grid.
    pub fn quantize_down(&self, qty: Decimal) -> Decimal {
        if self.qty_step <= Decimal::ZERO || qty <= Decimal::ZERO {
            return qty.max(Decimal::ZERO);
        }
        ((qty / self.qty_step).floor() * self.qty_step).normalize()
    }

    pub fn below_min_qty(&self, qty: Decimal) -> bool {
        self.min_qty.is_some_and(|min| qty < min)
    }

    pub fn below_min_notional(&self, qty: Decimal, price: Decimal) -> bool {
        self.min_notional.is_some_and(|min| qty * price < min)
    }
}
