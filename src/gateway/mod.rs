//! Exchange access.
//!
//! [`ExecutionGateway`] is the seam between the trading core and an
//! exchange. [`OrderRouter`] wraps any gateway with the retry policy and the
//! submit-then-confirm protocol the state machine relies on.

mod bybit;
#[cfg(test)]
pub mod mock;
mod paper;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::models::{Bar, ExchangeLimits, FillStatus, OrderRequest, Timeframe};

pub use bybit::BybitGateway;
pub(crate) use bybit::testnet_from_env;
pub use paper::PaperGateway;
pub use retry::RetryPolicy;

/// Operations the core needs from an exchange. Implementations classify
/// every failure as transient or fatal; retrying is the router's job.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Total account equity in the quote currency.
    async fn fetch_balance(&self, account_type: &str) -> Result<Decimal, GatewayError>;

    /// Most recent `limit` bars, oldest first. The last bar may still be
    /// forming.
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError>;

    async fn exchange_limits(&self, symbol: &str) -> Result<ExchangeLimits, GatewayError>;

    /// Submit an order; returns the exchange order id on acknowledgement.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError>;

    async fn order_fill(&self, symbol: &str, order_id: &str) -> Result<FillStatus, GatewayError>;

    /// Exchange order id of the order submitted under `client_order_id`, if
    /// the exchange has one.
    async fn find_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<String>, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;
}

/// How long to wait for an acknowledged order to fill.
#[derive(Debug, Clone)]
pub struct ConfirmPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of submitting an order and waiting for it.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled {
        order_id: String,
        qty: Decimal,
        avg_price: Option<Decimal>,
    },
    /// Acknowledged but not filled before the deadline
    Unconfirmed { order_id: String },
    Rejected { order_id: String, reason: String },
}

pub struct OrderRouter {
    gateway: Arc<dyn ExecutionGateway>,
    retry: RetryPolicy,
    confirm: ConfirmPolicy,
}

impl OrderRouter {
    pub fn new(gateway: Arc<dyn ExecutionGateway>, retry: RetryPolicy, confirm: ConfirmPolicy) -> Self {
        Self {
            gateway,
            retry,
            confirm,
        }
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub async fn fetch_balance(&self, account_type: &str) -> Result<Decimal, GatewayError> {
        self.retry
            .run("fetch_balance", || self.gateway.fetch_balance(account_type))
            .await
    }

    pub async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError> {
        self.retry
            .run("fetch_bars", || self.gateway.fetch_bars(symbol, timeframe, limit))
            .await
    }

    pub async fn exchange_limits(&self, symbol: &str) -> Result<ExchangeLimits, GatewayError> {
        self.retry
            .run("exchange_limits", || self.gateway.exchange_limits(symbol))
            .await
    }

    /// Place `order` and wait for a terminal status or the confirm deadline.
    ///
    /// Retries reuse the request's client order id, so the exchange refuses
    /// a second copy. When placement fails without a fatal error the order
    /// is looked up by that id; an `Err` therefore means no order was found,
    /// though one may still appear later under the same client id.
    pub async fn submit(&self, order: &OrderRequest) -> Result<OrderOutcome, GatewayError> {
        let order_id = match self
            .retry
            .run("place_order", || self.gateway.place_order(order))
            .await
        {
            Ok(order_id) => order_id,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => self.recover_order_id(order, e).await?,
        };

        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            qty = %order.qty,
            reduce_only = order.reduce_only,
            order_id = %order_id,
            "order acknowledged"
        );

        match self.confirm(&order.symbol, &order_id).await {
            // the order exists; keep its id so the caller can re-query it
            Err(e) if !e.is_fatal() => {
                warn!(symbol = %order.symbol, order_id = %order_id, error = %e, "status unavailable after acknowledgement");
                Ok(OrderOutcome::Unconfirmed { order_id })
            }
            other => other,
        }
    }

    /// Find the order behind a failed placement, or hand back `placement`.
    async fn recover_order_id(&self, order: &OrderRequest, placement: GatewayError) -> Result<String, GatewayError> {
        match self.find_order(&order.symbol, &order.client_order_id).await {
            Ok(Some(order_id)) => {
                warn!(
                    symbol = %order.symbol,
                    client_order_id = %order.client_order_id,
                    order_id = %order_id,
                    placement_error = %placement,
                    "acknowledgement lost, order recovered by client id"
                );
                Ok(order_id)
            }
            Ok(None) => Err(placement),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    symbol = %order.symbol,
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "order lookup by client id failed"
                );
                Err(placement)
            }
        }
    }

    pub async fn find_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<String>, GatewayError> {
        self.retry
            .run("find_order", || self.gateway.find_order(symbol, client_order_id))
            .await
    }

    /// Poll an acknowledged order until it fills, is rejected, or the
    /// deadline passes.
    pub async fn confirm(&self, symbol: &str, order_id: &str) -> Result<OrderOutcome, GatewayError> {
        let deadline = Instant::now() + self.confirm.timeout;

        loop {
            let status = self
                .retry
                .run("order_fill", || self.gateway.order_fill(symbol, order_id))
                .await?;

            match status {
                FillStatus::Filled { qty, avg_price } => {
                    return Ok(OrderOutcome::Filled {
                        order_id: order_id.to_string(),
                        qty,
                        avg_price,
                    })
                }
                FillStatus::Rejected { reason } => {
                    warn!(symbol, order_id, reason = %reason, "order rejected");
                    return Ok(OrderOutcome::Rejected {
                        order_id: order_id.to_string(),
                        reason,
                    });
                }
                FillStatus::PartiallyFilled { filled_qty, .. } => {
                    debug!(symbol, order_id, filled = %filled_qty, "order partially filled");
                }
                FillStatus::Pending => {}
            }

            if Instant::now() + self.confirm.poll_interval >= deadline {
                warn!(symbol, order_id, "order not confirmed before deadline");
                return Ok(OrderOutcome::Unconfirmed {
                    order_id: order_id.to_string(),
                });
            }
            tokio::time::sleep(self.confirm.poll_interval).await;
        }
    }

    /// Single status read, no polling.
    pub async fn fill_status(&self, symbol: &str, order_id: &str) -> Result<FillStatus, GatewayError> {
        self.retry
            .run("order_fill", || self.gateway.order_fill(symbol, order_id))
            .await
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.retry
            .run("cancel_order", || self.gateway.cancel_order(symbol, order_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{FillMode, MockGateway};
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn router(gateway: Arc<MockGateway>) -> OrderRouter {
        OrderRouter::new(
            gateway,
            RetryPolicy {
                call_timeout: Duration::from_millis(200),
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            ConfirmPolicy {
                timeout: Duration::from_millis(30),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    fn buy(qty: Decimal) -> OrderRequest {
        OrderRequest::market("bybit", "BTCUSDT", Side::Long.entry_order_side(), qty, false, dec!(100))
    }

    #[tokio::test]
    async fn test_submit_filled() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        let outcome = router(gw.clone()).submit(&buy(dec!(2))).await.unwrap();

        match outcome {
            OrderOutcome::Filled { qty, avg_price, .. } => {
                assert_eq!(qty, dec!(2));
                assert_eq!(avg_price, Some(dec!(100)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(gw.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_unconfirmed_after_deadline() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.set_fill_mode(FillMode::NeverFill);

        let outcome = router(gw).submit(&buy(dec!(1))).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Unconfirmed { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.set_fill_mode(FillMode::Reject);

        let outcome = router(gw).submit(&buy(dec!(1))).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_transient_place_failures_are_retried_once_each() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.fail_next(2);

        let outcome = router(gw.clone()).submit(&buy(dec!(1))).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Filled { .. }));
        // failed attempts never reached the book
        assert_eq!(gw.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_is_recovered_by_client_id() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.lose_next_ack(0);
        let order = buy(dec!(3));

        let outcome = router(gw.clone()).submit(&order).await.unwrap();
        match outcome {
            OrderOutcome::Filled { order_id, qty, .. } => {
                assert_eq!(order_id, format!("mock-{}", order.client_order_id));
                assert_eq!(qty, dec!(3));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // the resend was refused as a duplicate
        assert_eq!(gw.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_placement_error_without_order_surfaces() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.fail_next(3);

        let err = router(gw.clone()).submit(&buy(dec!(1))).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(gw.orders().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_surfaces() {
        let gw = Arc::new(MockGateway::new(dec!(1000)));
        gw.set_fatal(true);

        let err = router(gw).fetch_balance("UNIFIED").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
