//! Scripted in-memory gateway for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::models::{Bar, ExchangeLimits, FillStatus, OrderRequest, Timeframe};

use super::ExecutionGateway;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    /// Fill in full at the reference price
    Immediate,
    /// Acknowledge but stay pending
    NeverFill,
    Reject,
}

pub struct MockGateway {
    balance: Decimal,
    bars: Mutex<HashMap<String, Vec<Bar>>>,
    limits: Mutex<ExchangeLimits>,
    unlisted: Mutex<HashSet<String>>,
    fill_mode: Mutex<FillMode>,
    /// Upcoming calls that fail with a transient error
    failures: AtomicU32,
    /// Upcoming placements that fail before reaching the book
    place_failures: AtomicU32,
    /// Next placement books its order, loses the acknowledgement, then
    /// fails this many further calls
    lost_ack: Mutex<Option<u32>>,
    fatal: AtomicBool,
    place_delay: Mutex<Duration>,
    orders: Mutex<Vec<OrderRequest>>,
    fills: Mutex<HashMap<String, FillStatus>>,
    cancels: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            bars: Mutex::new(HashMap::new()),
            limits: Mutex::new(ExchangeLimits::default()),
            unlisted: Mutex::new(HashSet::new()),
            fill_mode: Mutex::new(FillMode::Immediate),
            failures: AtomicU32::new(0),
            place_failures: AtomicU32::new(0),
            lost_ack: Mutex::new(None),
            fatal: AtomicBool::new(false),
            place_delay: Mutex::new(Duration::ZERO),
            orders: Mutex::new(Vec::new()),
            fills: Mutex::new(HashMap::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.bars.lock().unwrap().insert(symbol.to_string(), bars);
    }

    pub fn set_limits(&self, limits: ExchangeLimits) {
        *self.limits.lock().unwrap() = limits;
    }

    /// Answer instrument lookups for `symbol` as not listed.
    pub fn unlist(&self, symbol: &str) {
        self.unlisted.lock().unwrap().insert(symbol.to_string());
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        *self.fill_mode.lock().unwrap() = mode;
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_placements(&self, n: u32) {
        self.place_failures.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_ack(&self, outage: u32) {
        *self.lost_ack.lock().unwrap() = Some(outage);
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    pub fn set_place_delay(&self, delay: Duration) {
        *self.place_delay.lock().unwrap() = delay;
    }

    /// Mark a previously pending order as filled.
    pub fn fill(&self, order_id: &str, qty: Decimal, avg_price: Decimal) {
        self.fills.lock().unwrap().insert(
            order_id.to_string(),
            FillStatus::Filled {
                qty,
                avg_price: Some(avg_price),
            },
        );
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), GatewayError> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(GatewayError::Fatal("mock: invalid api key".into()));
        }
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(GatewayError::Transient("mock: connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_balance(&self, _account_type: &str) -> Result<Decimal, GatewayError> {
        self.check_failure()?;
        Ok(self.balance)
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError> {
        self.check_failure()?;
        let bars = self.bars.lock().unwrap();
        let all = bars.get(symbol).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn exchange_limits(&self, symbol: &str) -> Result<ExchangeLimits, GatewayError> {
        self.check_failure()?;
        if self.unlisted.lock().unwrap().contains(symbol) {
            return Err(GatewayError::UnknownSymbol(symbol.to_string()));
        }
        Ok(self.limits.lock().unwrap().clone())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError> {
        self.check_failure()?;
        let refused = self.place_failures.load(Ordering::SeqCst);
        if refused > 0 {
            self.place_failures.store(refused - 1, Ordering::SeqCst);
            return Err(GatewayError::Transient("mock: order entry unavailable".into()));
        }
        let delay = *self.place_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let order_id = format!("mock-{}", order.client_order_id);
        if self.fills.lock().unwrap().contains_key(&order_id) {
            return Err(GatewayError::Duplicate(format!(
                "mock: client order id {} already used",
                order.client_order_id
            )));
        }
        let status = match *self.fill_mode.lock().unwrap() {
            FillMode::Immediate => FillStatus::Filled {
                qty: order.qty,
                avg_price: Some(order.price.unwrap_or(order.reference_price)),
            },
            FillMode::NeverFill => FillStatus::Pending,
            FillMode::Reject => FillStatus::Rejected {
                reason: "mock: insufficient margin".into(),
            },
        };
        self.orders.lock().unwrap().push(order.clone());
        self.fills.lock().unwrap().insert(order_id.clone(), status);

        if let Some(outage) = self.lost_ack.lock().unwrap().take() {
            self.failures.store(outage, Ordering::SeqCst);
            return Err(GatewayError::Transient("mock: connection reset after send".into()));
        }
        Ok(order_id)
    }

    async fn order_fill(&self, _symbol: &str, order_id: &str) -> Result<FillStatus, GatewayError> {
        self.check_failure()?;
        Ok(self
            .fills
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .unwrap_or(FillStatus::Rejected {
                reason: "mock: unknown order".into(),
            }))
    }

    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<String>, GatewayError> {
        self.check_failure()?;
        let order_id = format!("mock-{}", client_order_id);
        Ok(self.fills.lock().unwrap().contains_key(&order_id).then_some(order_id))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.check_failure()?;
        self.cancels.lock().unwrap().push(order_id.to_string());
        let mut fills = self.fills.lock().unwrap();
        if let Some(FillStatus::Pending) = fills.get(order_id) {
            fills.insert(
                order_id.to_string(),
                FillStatus::Rejected {
                    reason: "mock: cancelled".into(),
                },
            );
        }
        Ok(())
    }
}
