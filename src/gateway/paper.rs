//! Dry-run gateway: real market data, simulated fills.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::GatewayError;
use crate::models::{Bar, ExchangeLimits, FillStatus, OrderRequest, Timeframe};

use super::ExecutionGateway;

/// Fills every order immediately in full at its limit price or the last
/// observed close. Balance is the configured seed and never changes here;
/// the equity tracker does the bookkeeping.
pub struct PaperGateway {
    market_data: Arc<dyn ExecutionGateway>,
    balance: Decimal,
    next_id: AtomicU64,
    book: Mutex<PaperBook>,
}

#[derive(Default)]
struct PaperBook {
    fills: HashMap<String, FillStatus>,
    /// client order id -> order id
    client_ids: HashMap<String, String>,
}

impl PaperGateway {
    pub fn new(market_data: Arc<dyn ExecutionGateway>, balance: Decimal) -> Self {
        Self {
            market_data,
            balance,
            next_id: AtomicU64::new(1),
            book: Mutex::new(PaperBook::default()),
        }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_balance(&self, _account_type: &str) -> Result<Decimal, GatewayError> {
        Ok(self.balance)
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError> {
        self.market_data.fetch_bars(symbol, timeframe, limit).await
    }

    async fn exchange_limits(&self, symbol: &str) -> Result<ExchangeLimits, GatewayError> {
        self.market_data.exchange_limits(symbol).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError> {
        let price = order.price.unwrap_or(order.reference_price);
        if price <= Decimal::ZERO {
            return Err(GatewayError::Transient(format!(
                "paper: no reference price for {}",
                order.symbol
            )));
        }

        let mut book = self.book();
        if book.client_ids.contains_key(&order.client_order_id) {
            return Err(GatewayError::Duplicate(format!(
                "paper: client order id {} already used",
                order.client_order_id
            )));
        }

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            qty = %order.qty,
            price = %price,
            reduce_only = order.reduce_only,
            order_id = %order_id,
            "[DRY RUN] simulated fill"
        );

        book.fills.insert(
            order_id.clone(),
            FillStatus::Filled {
                qty: order.qty,
                avg_price: Some(price),
            },
        );
        book.client_ids.insert(order.client_order_id.clone(), order_id.clone());
        Ok(order_id)
    }

    async fn order_fill(&self, _symbol: &str, order_id: &str) -> Result<FillStatus, GatewayError> {
        Ok(self
            .book()
            .fills
            .get(order_id)
            .cloned()
            .unwrap_or(FillStatus::Rejected {
                reason: format!("paper: unknown order {}", order_id),
            }))
    }

    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.book().client_ids.get(client_order_id).cloned())
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::indicators::test_support::bars_from_closes;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fills_at_reference_price() {
        let paper = PaperGateway::new(Arc::new(MockGateway::new(dec!(0))), dec!(2500));
        let order = OrderRequest::market("bybit", "SOLUSDT", Side::Short.entry_order_side(), dec!(3), false, dec!(140.5));

        let id = paper.place_order(&order).await.unwrap();
        assert_eq!(
            paper.order_fill("SOLUSDT", &id).await.unwrap(),
            FillStatus::Filled {
                qty: dec!(3),
                avg_price: Some(dec!(140.5))
            }
        );
        assert_eq!(paper.fetch_balance("UNIFIED").await.unwrap(), dec!(2500));
    }

    #[tokio::test]
    async fn test_resend_is_refused_and_findable() {
        let paper = PaperGateway::new(Arc::new(MockGateway::new(dec!(0))), dec!(1000));
        let order = OrderRequest::market("bybit", "ETHUSDT", Side::Long.entry_order_side(), dec!(1), false, dec!(2000));

        let id = paper.place_order(&order).await.unwrap();
        assert!(matches!(
            paper.place_order(&order).await,
            Err(GatewayError::Duplicate(_))
        ));
        assert_eq!(
            paper.find_order("ETHUSDT", &order.client_order_id).await.unwrap(),
            Some(id)
        );
        assert_eq!(paper.find_order("ETHUSDT", "unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_market_data_passes_through() {
        let source = Arc::new(MockGateway::new(dec!(0)));
        source.set_bars("BTCUSDT", bars_from_closes(&[dec!(1), dec!(2), dec!(3)]));
        let paper = PaperGateway::new(source, dec!(1000));

        let bars = paper.fetch_bars("BTCUSDT", Timeframe::M1, 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, dec!(3));
    }

    #[tokio::test]
    async fn test_order_without_price_is_refused() {
        let paper = PaperGateway::new(Arc::new(MockGateway::new(dec!(0))), dec!(1000));
        let order = OrderRequest::market("bybit", "BTCUSDT", Side::Long.entry_order_side(), dec!(1), false, dec!(0));
        assert!(paper.place_order(&order).await.is_err());
    }
}
