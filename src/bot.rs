//! Bot runner: one cycle per key on a bar-aligned clock.
//!
//! Handles:
//! - Indicator warm-up and the per-cycle bar refresh
//! - Entries through sizing, budget reservation and order confirmation
//! - Exit checks, stop management and re-queries of unconfirmed exits
//! - The run-state switch, fatal halts and graceful shutdown
//!
//! A key's cycle holds that key's registry lock from the bar read to the
//! last ledger write. Cycles for different keys run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, EquitySeed, SeedSource};
use crate::error::{GatewayError, TradingError};
use crate::gateway::{BybitGateway, ExecutionGateway, OrderOutcome, OrderRouter, PaperGateway};
use crate::indicators::{IndicatorEngine, TrendFilter};
use crate::ledger::{CsvLedger, FanoutLedger, LedgerSink, RunState, SqliteLedger};
use crate::models::{
    Bar, ExchangeLimits, FillStatus, OrderRequest, PendingEntry, PendingExit, Position,
    PositionKey, Side, TradeEventKind,
};
use crate::trading::{
    CooldownManager, EquityTracker, ExitTrigger, FillRecord, KeySlot, KeyView,
    PositionRegistry, PositionStateMachine, RiskSizer, Setup, SignalGenerator, SizingInput,
};

/// Main bot runner.
pub struct Bot {
    config: AppConfig,
    /// Keyed by connector name
    routers: HashMap<String, Arc<OrderRouter>>,
    registry: Arc<PositionRegistry>,
    equity: Arc<EquityTracker>,
    sizer: RiskSizer,
    machine: PositionStateMachine,
    cooldown: CooldownManager,
    /// Holds the run-state switch; `None` means always running
    state_store: Option<SqliteLedger>,
    dry_run: bool,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Bot {
    pub fn new(
        config: AppConfig,
        routers: HashMap<String, Arc<OrderRouter>>,
        sink: Arc<dyn LedgerSink>,
        state_store: Option<SqliteLedger>,
        seed: Decimal,
    ) -> Self {
        let mut slots = Vec::new();
        for connector in &config.connectors {
            for symbol in &connector.symbols {
                slots.push(KeySlot {
                    key: PositionKey::new(&connector.name, symbol),
                    timeframe: connector.timeframe,
                    htf_timeframe: connector.htf_timeframe,
                    position: None,
                    pending_entry: None,
                    last_close: None,
                    halted: false,
                    engine: IndicatorEngine::new(
                        config.strategy.indicator_params(config.engine.warmup_bars),
                    ),
                    trend: TrendFilter::new(config.strategy.htf_ema_len),
                    signals: SignalGenerator::new(
                        config.strategy.clone(),
                        config.engine.fallback_window,
                    ),
                    limits: ExchangeLimits::default(),
                    warmed_up: false,
                });
            }
        }

        Self {
            registry: Arc::new(PositionRegistry::new(slots)),
            equity: Arc::new(EquityTracker::new(seed, sink)),
            sizer: RiskSizer::new(config.risk.clone()),
            machine: PositionStateMachine::new(config.trade.clone()),
            cooldown: CooldownManager::from_secs(config.engine.cooldown_secs),
            routers,
            state_store,
            dry_run: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            config,
        }
    }

    /// Wire gateways, ledger sinks and the equity seed from configuration.
    ///
    /// In dry-run mode every connector trades through a [`PaperGateway`]
    /// backed by the exchange's public market data.
    pub async fn from_config(config: AppConfig, dry_run: bool) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn LedgerSink>> = Vec::new();
        if let Some(dir) = &config.ledger.csv_dir {
            let csv = CsvLedger::new(dir)?;
            info!(
                trades = %csv.trades_path().display(),
                equity = %csv.equity_path().display(),
                "CSV ledger enabled"
            );
            sinks.push(Arc::new(csv));
        }
        let state_store = match &config.ledger.database_url {
            Some(url) => {
                let db = SqliteLedger::connect(url).await?;
                sinks.push(Arc::new(db.clone()));
                Some(db)
            }
            None => None,
        };
        if sinks.is_empty() {
            warn!("No ledger backend configured, trades will only be logged");
        }

        let seed = Self::resolve_seed(&config, state_store.as_ref()).await?;

        let retry = config.gateway.retry_policy();
        let confirm = config.gateway.confirm_policy();
        let mut routers = HashMap::new();
        for connector in &config.connectors {
            let gateway: Arc<dyn ExecutionGateway> = if dry_run {
                let market_data = Arc::new(BybitGateway::public(connector.testnet)?);
                Arc::new(PaperGateway::new(market_data, seed))
            } else {
                let gateway = BybitGateway::from_env(connector.testnet)
                    .with_context(|| format!("Connector {} needs API credentials", connector.name))?;
                info!(connector = %connector.name, base_url = gateway.base_url(), "Bybit gateway configured");
                Arc::new(gateway)
            };
            routers.insert(
                connector.name.clone(),
                Arc::new(OrderRouter::new(gateway, retry.clone(), confirm.clone())),
            );
        }

        let mut bot = Self::new(config, routers, Arc::new(FanoutLedger::new(sinks)), state_store, seed);
        bot.dry_run = dry_run;
        Ok(bot)
    }

    /// Starting equity. A fatal balance error aborts startup.
    async fn resolve_seed(config: &AppConfig, store: Option<&SqliteLedger>) -> Result<Decimal> {
        let seed = match &config.ledger.equity_seed {
            EquitySeed::Fixed(value) => *value,
            EquitySeed::Source(SeedSource::Ledger) => {
                let Some(store) = store else {
                    bail!("equity_seed = \"ledger\" needs a database");
                };
                match store.latest_equity().await? {
                    Some(point) => point.equity,
                    None => bail!("Ledger has no equity points to seed from"),
                }
            }
            EquitySeed::Source(SeedSource::Exchange) => {
                let Some(connector) = config.connectors.first() else {
                    bail!("equity_seed = \"exchange\" needs a connector");
                };
                let gateway = BybitGateway::from_env(connector.testnet)
                    .context("Balance seeding needs API credentials")?;
                let router = OrderRouter::new(
                    Arc::new(gateway),
                    config.gateway.retry_policy(),
                    config.gateway.confirm_policy(),
                );
                router
                    .fetch_balance(&config.engine.account_type)
                    .await
                    .map_err(TradingError::from)
                    .context("Failed to fetch starting balance")?
            }
        };

        if seed <= Decimal::ZERO {
            bail!("Starting equity must be positive, got {}", seed);
        }
        info!(equity = %seed, "Equity seeded");
        Ok(seed)
    }

    /// Load exchange limits and warm indicators for every key.
    pub async fn initialize(&self) -> Result<()> {
        info!(keys = self.registry.keys().len(), dry_run = self.dry_run, "Initializing bot...");

        for key in self.registry.keys() {
            let Some(router) = self.routers.get(&key.connector).cloned() else {
                warn!(key = %key, "No gateway for connector, key skipped");
                continue;
            };
            let Some(mut slot) = self.registry.lock(&key).await else {
                continue;
            };

            match router.exchange_limits(&key.symbol).await {
                Ok(limits) => {
                    debug!(
                        key = %key,
                        gateway = router.gateway_name(),
                        qty_step = %limits.qty_step,
                        min_qty = ?limits.min_qty,
                        "exchange limits loaded"
                    );
                    slot.limits = limits;
                }
                Err(GatewayError::UnknownSymbol(reason)) => {
                    warn!(key = %key, reason = %reason, "symbol not tradable on the exchange, key dropped");
                    slot.halted = true;
                    self.registry.publish(&slot);
                    continue;
                }
                Err(e) if e.is_fatal() => {
                    error!(key = %key, error = %e, "fatal gateway error, key halted");
                    slot.halted = true;
                    self.registry.publish(&slot);
                    continue;
                }
                Err(e) => warn!(key = %key, error = %e, "exchange limits unavailable, using defaults"),
            }

            match self.refresh_bars(&router, &mut slot, Utc::now()).await {
                Ok(_) => info!(key = %key, bars = slot.engine.len(), "indicators warmed up"),
                Err(TradingError::GatewayFatal(msg)) => {
                    error!(key = %key, error = %msg, "fatal gateway error, key halted");
                    slot.halted = true;
                }
                Err(e) => warn!(key = %key, error = %e, "warm-up failed, retrying next cycle"),
            }
            self.registry.publish(&slot);
        }

        let snapshot = self.snapshot().await;
        info!(
            equity = %snapshot.equity,
            keys = snapshot.keys.len(),
            halted = snapshot.halted().len(),
            "Bot initialized"
        );
        Ok(())
    }

    /// Main run loop. Returns after ctrl-c once the in-flight round is done.
    pub async fn run(&self) -> Result<()> {
        info!(
            dry_run = self.dry_run,
            timeframe = %self.config.base_timeframe(),
            cycle_secs = ?self.config.engine.cycle_secs,
            "Starting bot run loop"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            wake.notify_one();
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            let delay = self.until_next_cycle(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.run_round().await;
        }

        self.shutdown().await;
        Ok(())
    }

    fn until_next_cycle(&self, now: DateTime<Utc>) -> Duration {
        if let Some(secs) = self.config.engine.cycle_secs {
            return Duration::from_secs(secs);
        }
        let delay = chrono::Duration::seconds(self.config.engine.bar_close_delay_secs as i64);
        let next = self.config.base_timeframe().next_boundary(now - delay) + delay;
        (next - now).to_std().unwrap_or(Duration::from_secs(1))
    }

    /// One cycle for every key, concurrently.
    pub async fn run_round(&self) {
        let entries_allowed = self.entries_allowed().await;
        let keys = self.registry.keys();

        let results = join_all(keys.iter().map(|key| self.run_cycle(key, entries_allowed))).await;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => {}
                // logged when the key was halted
                Err(TradingError::GatewayFatal(_)) => {}
                Err(e) if e.is_skip() => debug!(key = %key, reason = %e, "cycle skipped"),
                Err(e) => warn!(key = %key, error = %e, "cycle abandoned"),
            }
        }

        let snapshot = self.snapshot().await;
        debug!(
            equity = %snapshot.equity,
            open = snapshot.open_positions().count(),
            committed = %snapshot.committed_notional,
            "round complete"
        );
    }

    async fn entries_allowed(&self) -> bool {
        let Some(store) = &self.state_store else {
            return true;
        };
        match store.run_state().await {
            Ok(RunState::Running) => true,
            Ok(RunState::Paused) => {
                debug!("run state PAUSED, entries suspended");
                false
            }
            Err(e) => {
                warn!(error = %e, "run state unreadable, entries suspended this round");
                false
            }
        }
    }

    /// Run one cycle for `key` under its lock. A fatal gateway error halts
    /// the key for the rest of the process.
    pub async fn run_cycle(&self, key: &PositionKey, entries_allowed: bool) -> Result<(), TradingError> {
        let Some(router) = self.routers.get(&key.connector).cloned() else {
            return Ok(());
        };
        let Some(mut slot) = self.registry.lock(key).await else {
            return Ok(());
        };
        if slot.halted {
            return Ok(());
        }

        let now = Utc::now();
        let result = self.cycle_locked(&router, &mut slot, entries_allowed, now).await;
        if let Err(TradingError::GatewayFatal(msg)) = &result {
            error!(key = %key, error = %msg, "fatal gateway error, key halted");
            slot.halted = true;
        }
        self.registry.publish(&slot);
        result
    }

    async fn cycle_locked(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        entries_allowed: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let setup = self.refresh_bars(router, slot, now).await?;
        let Some(row) = slot.engine.latest().cloned() else {
            debug!(key = %slot.key, "no closed bars yet");
            return Ok(());
        };
        let price = row.close;
        let atr = row.atr_decimal();

        if slot.pending_entry.is_some() {
            return self.reconcile_entry(router, slot, now).await;
        }
        if slot.position.is_some() {
            return self.manage_position(router, slot, price, atr, now).await;
        }

        match setup {
            Some(setup) => match setup.side() {
                Some(side) if entries_allowed => {
                    self.try_enter(router, slot, setup, side, price, atr, now).await
                }
                Some(side) => {
                    debug!(key = %slot.key, side = %side, source = setup.source(), "entries paused, setup ignored");
                    Ok(())
                }
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    // ==================== Market Data ====================

    /// Fetch closed bars and feed the indicator engine. Returns the setup of
    /// the newest row when the key was already warm and a new row arrived.
    async fn refresh_bars(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        now: DateTime<Utc>,
    ) -> Result<Option<Setup>, TradingError> {
        let limit = if slot.warmed_up {
            self.config.engine.poll_bars
        } else {
            self.config.engine.warmup_bars
        };
        let tf = slot.timeframe;
        let htf_tf = slot.htf_timeframe;

        let bars: Vec<Bar> = router
            .fetch_bars(&slot.key.symbol, tf, limit)
            .await?
            .into_iter()
            .filter(|b| b.is_closed(tf, now))
            .collect();

        let htf = if self.config.strategy.kind.needs_htf() {
            match router.fetch_bars(&slot.key.symbol, htf_tf, limit).await {
                Ok(bars) => Some(
                    bars.into_iter()
                        .filter(|b| b.is_closed(htf_tf, now))
                        .collect::<Vec<_>>(),
                ),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(key = %slot.key, error = %e, "higher-timeframe bars unavailable");
                    None
                }
            }
        } else {
            None
        };
        let have_htf = htf.is_some();
        let mut htf = htf.map(|bars| bars.into_iter().peekable());

        let mut latest = None;
        for bar in bars {
            // the trend may only see higher-timeframe bars closed by now
            let close_time = bar.close_time(tf);
            if let Some(pending) = htf.as_mut() {
                while let Some(h) = pending.next_if(|h| h.close_time(htf_tf) <= close_time) {
                    slot.trend.ingest([h]);
                }
            }

            let Some(row) = slot.engine.push(bar).cloned() else {
                continue;
            };
            let trend = if have_htf { slot.trend.bias() } else { None };
            latest = Some(slot.signals.evaluate(&row, trend));
        }
        if let Some(rest) = htf {
            slot.trend.ingest(rest);
        }

        let was_warm = slot.warmed_up;
        if !slot.engine.is_empty() {
            slot.warmed_up = true;
        }
        Ok(if was_warm { latest } else { None })
    }

    // ==================== Entry ====================

    #[allow(clippy::too_many_arguments)]
    async fn try_enter(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        setup: Setup,
        side: Side,
        price: Decimal,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        if self.cooldown.is_active(slot.last_close, now) {
            debug!(
                key = %slot.key,
                remaining_secs = self.cooldown.remaining(slot.last_close, now).num_seconds(),
                "cooldown active, entry skipped"
            );
            return Ok(());
        }
        let Some(atr) = atr else {
            debug!(key = %slot.key, "ATR not positive, entry skipped");
            return Ok(());
        };

        let stop = self.machine.stop_for(side, price, atr);
        let equity = self.equity.equity().await;
        let cap = equity * self.sizer.config().max_total_exposure_pct;

        let sized = self.sizer.size(&SizingInput {
            equity,
            entry_price: price,
            stop_price: stop,
            remaining_notional: self.registry.remaining_budget(cap),
            limits: &slot.limits,
        });
        let qty = match sized {
            Ok(qty) => qty,
            Err(TradingError::SizeTooSmall(reason)) => {
                debug!(key = %slot.key, reason = %reason, "entry skipped");
                return Ok(());
            }
            Err(e @ TradingError::InvalidRisk { .. }) => {
                warn!(key = %slot.key, error = %e, "entry skipped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let notional = qty * price;
        if !self.registry.reserve(cap, notional) {
            debug!(key = %slot.key, notional = %notional, "exposure budget taken, entry skipped");
            return Ok(());
        }

        let pending = PendingEntry {
            order: OrderRequest::market(
                &slot.key.connector,
                &slot.key.symbol,
                side.entry_order_side(),
                qty,
                false,
                price,
            ),
            side,
            atr,
            notional,
            submitted_at: now,
        };
        slot.pending_entry = Some(pending.clone());
        self.registry.publish(slot);
        info!(
            key = %slot.key,
            side = %side,
            source = setup.source(),
            qty = %qty,
            price = %price,
            stop = %stop,
            "entry PENDING"
        );

        let result = match router.submit(&pending.order).await {
            Ok(outcome) => self.settle_entry(router, slot, &pending, outcome, now).await,
            Err(e) => Err(e.into()),
        };
        self.finish_entry_attempt(slot, &pending, result)
    }

    /// Turn a submitted entry's outcome into a position, or into nothing.
    async fn settle_entry(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        pending: &PendingEntry,
        outcome: OrderOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let (order_id, qty, avg_price) = match outcome {
            OrderOutcome::Filled {
                order_id,
                qty,
                avg_price,
            } => (order_id, qty, avg_price),
            OrderOutcome::Rejected { order_id, reason } => {
                warn!(key = %slot.key, order_id = %order_id, reason = %reason, "entry rejected, back to NONE");
                return Ok(());
            }
            OrderOutcome::Unconfirmed { order_id } => {
                match self.abandon_entry(router, &slot.key, &order_id).await? {
                    Some((qty, avg_price)) => (order_id, qty, avg_price),
                    None => return Ok(()),
                }
            }
        };

        if qty <= Decimal::ZERO {
            warn!(key = %slot.key, order_id = %order_id, "entry reported filled with no quantity");
            return Ok(());
        }

        let fill_price = avg_price
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(pending.order.reference_price);
        let position = self.machine.open(
            slot.key.clone(),
            pending.side,
            fill_price,
            qty,
            pending.atr,
            order_id.clone(),
            now,
        )?;

        self.equity
            .record(
                FillRecord {
                    key: slot.key.clone(),
                    kind: TradeEventKind::Enter,
                    side: pending.side,
                    price: fill_price,
                    qty,
                    order_id,
                    time: now,
                },
                None,
            )
            .await;
        slot.position = Some(position);
        Ok(())
    }

    /// Clear the pending entry and its reservation unless the exchange
    /// may still hold the order.
    fn finish_entry_attempt(
        &self,
        slot: &mut KeySlot,
        pending: &PendingEntry,
        result: Result<(), TradingError>,
    ) -> Result<(), TradingError> {
        if let Err(TradingError::GatewayTransient(msg)) = &result {
            warn!(
                key = %slot.key,
                client_order_id = %pending.order.client_order_id,
                error = %msg,
                "entry outcome unknown, reconciling next cycle"
            );
            self.registry.publish(slot);
            return result;
        }

        slot.pending_entry = None;
        // publish the open position before the reservation goes away
        self.registry.publish(slot);
        self.registry.release(pending.notional);
        result
    }

    /// Resolve an entry left unknown by an earlier cycle through its client
    /// order id.
    async fn reconcile_entry(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let Some(pending) = slot.pending_entry.clone() else {
            return Ok(());
        };

        let result = match router
            .find_order(&slot.key.symbol, &pending.order.client_order_id)
            .await
        {
            Ok(Some(order_id)) => {
                info!(key = %slot.key, order_id = %order_id, "pending entry found on the exchange");
                self.settle_entry(router, slot, &pending, OrderOutcome::Unconfirmed { order_id }, now)
                    .await
            }
            Ok(None) => {
                info!(
                    key = %slot.key,
                    client_order_id = %pending.order.client_order_id,
                    "pending entry never reached the exchange, back to NONE"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.finish_entry_attempt(slot, &pending, result)
    }

    /// Cancel an entry that missed its confirm deadline, then read its final
    /// status. Returns the fill if the order executed anyway.
    async fn abandon_entry(
        &self,
        router: &OrderRouter,
        key: &PositionKey,
        order_id: &str,
    ) -> Result<Option<(Decimal, Option<Decimal>)>, GatewayError> {
        match router.cancel(&key.symbol, order_id).await {
            Ok(()) => info!(key = %key, order_id, "unconfirmed entry cancelled"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(key = %key, order_id, error = %e, "cancel of unconfirmed entry failed"),
        }

        match router.fill_status(&key.symbol, order_id).await? {
            FillStatus::Filled { qty, avg_price }
            | FillStatus::PartiallyFilled {
                filled_qty: qty,
                avg_price,
            } if qty > Decimal::ZERO => {
                warn!(key = %key, order_id, qty = %qty, "entry filled before cancel, adopting it");
                Ok(Some((qty, avg_price)))
            }
            _ => {
                info!(key = %key, order_id, "entry abandoned, back to NONE");
                Ok(None)
            }
        }
    }

    // ==================== Position Management ====================

    async fn manage_position(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        price: Decimal,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let pending = slot.position.as_ref().and_then(|p| p.pending_exit.clone());
        if let Some(pending) = pending {
            return self.resolve_pending_exit(router, slot, pending, atr, now).await;
        }

        let trigger = match slot.position.as_ref() {
            Some(pos) => self.machine.check_exit(pos, price, now, &slot.limits),
            None => return Ok(()),
        };
        match trigger {
            Some(trigger) => self.submit_exit(router, slot, trigger, atr, now).await,
            None => {
                if let Some(pos) = slot.position.as_mut() {
                    self.machine.adjust_stop(pos, price, atr);
                }
                Ok(())
            }
        }
    }

    async fn submit_exit(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        trigger: ExitTrigger,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let Some(side) = slot.position.as_ref().map(|p| p.side) else {
            return Ok(());
        };
        let order = OrderRequest::market(
            &slot.key.connector,
            &slot.key.symbol,
            side.exit_order_side(),
            trigger.qty,
            true,
            trigger.price,
        );
        let pending = PendingExit {
            order_id: None,
            client_order_id: order.client_order_id.clone(),
            kind: trigger.kind,
            qty: trigger.qty,
            trigger_price: trigger.price,
            submitted_at: now,
        };

        let outcome = match router.submit(&order).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                // the close may still land; never send another without a lookup
                warn!(
                    key = %slot.key,
                    kind = %trigger.kind,
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "exit outcome unknown, reconciling next cycle"
                );
                if let Some(pos) = slot.position.as_mut() {
                    pos.pending_exit = Some(pending);
                }
                return Err(e.into());
            }
        };

        match outcome {
            OrderOutcome::Filled {
                order_id,
                qty,
                avg_price,
            } => {
                self.book_exit(slot, trigger.kind, qty, avg_price, trigger.price, &order_id, atr, now)
                    .await;
            }
            OrderOutcome::Unconfirmed { order_id } => {
                warn!(key = %slot.key, kind = %trigger.kind, order_id = %order_id, "exit unconfirmed, re-querying next cycle");
                if let Some(pos) = slot.position.as_mut() {
                    pos.pending_exit = Some(PendingExit {
                        order_id: Some(order_id),
                        ..pending
                    });
                }
            }
            OrderOutcome::Rejected { order_id, reason } => {
                warn!(
                    key = %slot.key,
                    kind = %trigger.kind,
                    order_id = %order_id,
                    reason = %reason,
                    "exit rejected, position unchanged"
                );
            }
        }
        Ok(())
    }

    async fn resolve_pending_exit(
        &self,
        router: &OrderRouter,
        slot: &mut KeySlot,
        mut pending: PendingExit,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let order_id = match pending.order_id.clone() {
            Some(order_id) => order_id,
            None => match router
                .find_order(&slot.key.symbol, &pending.client_order_id)
                .await?
            {
                Some(order_id) => {
                    info!(key = %slot.key, order_id = %order_id, "pending exit found on the exchange");
                    pending.order_id = Some(order_id.clone());
                    if let Some(pos) = slot.position.as_mut() {
                        pos.pending_exit = Some(pending.clone());
                    }
                    order_id
                }
                None => {
                    warn!(
                        key = %slot.key,
                        client_order_id = %pending.client_order_id,
                        "pending exit never reached the exchange, trigger re-evaluated next cycle"
                    );
                    if let Some(pos) = slot.position.as_mut() {
                        pos.pending_exit = None;
                    }
                    return Ok(());
                }
            },
        };

        match router.fill_status(&slot.key.symbol, &order_id).await? {
            FillStatus::Filled { qty, avg_price } => {
                info!(key = %slot.key, order_id = %order_id, "pending exit confirmed");
                self.book_exit(
                    slot,
                    pending.kind,
                    qty,
                    avg_price,
                    pending.trigger_price,
                    &order_id,
                    atr,
                    now,
                )
                .await;
            }
            FillStatus::Rejected { reason } => {
                warn!(
                    key = %slot.key,
                    order_id = %order_id,
                    reason = %reason,
                    "pending exit rejected, trigger re-evaluated next cycle"
                );
                if let Some(pos) = slot.position.as_mut() {
                    pos.pending_exit = None;
                }
            }
            FillStatus::PartiallyFilled { .. } | FillStatus::Pending => {
                debug!(
                    key = %slot.key,
                    order_id = %order_id,
                    waiting_secs = (now - pending.submitted_at).num_seconds(),
                    "exit still awaiting confirmation"
                );
            }
        }
        Ok(())
    }

    /// Apply a confirmed exit fill, write the ledger row and drop the
    /// position once nothing is left.
    #[allow(clippy::too_many_arguments)]
    async fn book_exit(
        &self,
        slot: &mut KeySlot,
        kind: TradeEventKind,
        qty: Decimal,
        avg_price: Option<Decimal>,
        trigger_price: Decimal,
        order_id: &str,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) {
        let Some(pos) = slot.position.as_mut() else {
            return;
        };
        if qty <= Decimal::ZERO {
            warn!(key = %slot.key, order_id, "exit reported filled with no quantity");
            pos.pending_exit = None;
            return;
        }

        let price = self.machine.exit_price(pos, kind, avg_price, trigger_price);
        let applied = self.machine.apply_exit(pos, kind, qty, price, atr);
        let side = pos.side;

        self.equity
            .record(
                FillRecord {
                    key: slot.key.clone(),
                    kind,
                    side,
                    price: applied.fill_price,
                    qty: applied.closed_qty,
                    order_id: order_id.to_string(),
                    time: now,
                },
                Some(applied.pnl),
            )
            .await;

        if applied.closed {
            slot.position = None;
            slot.last_close = Some(now);
            info!(
                key = %slot.key,
                cooldown_secs = self.cooldown.interval().num_seconds(),
                "position CLOSED"
            );
        }
    }

    // ==================== Read Side ====================

    /// Current state without taking any key lock.
    pub async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: Utc::now(),
            equity: self.equity.equity().await,
            committed_notional: self.registry.committed_notional(),
            keys: self.registry.snapshot(),
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down...");

        let snapshot = self.snapshot().await;
        for view in &snapshot.keys {
            if let Some(pos) = &view.position {
                warn!(
                    key = %view.key,
                    status = view.status.as_str(),
                    qty = %pos.qty,
                    pending_exit = pos.pending_exit.is_some(),
                    "position still open on the exchange"
                );
            }
        }
        info!("\n{}", snapshot);

        if let Some(store) = &self.state_store {
            store.pool().close().await;
        }
        info!("Shutdown complete");
    }
}

/// Read-only view of the engine for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub equity: Decimal,
    pub committed_notional: Decimal,
    pub keys: Vec<KeyView>,
}

impl EngineSnapshot {
    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.keys.iter().filter_map(|k| k.position.as_ref())
    }

    pub fn halted(&self) -> Vec<&PositionKey> {
        self.keys.iter().filter(|k| k.halted).map(|k| &k.key).collect()
    }
}

impl fmt::Display for EngineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Snapshot ===")?;
        writeln!(f, "Taken At:        {}", self.taken_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Equity:          ${:.2}", self.equity)?;
        writeln!(f, "Committed:       ${:.2}", self.committed_notional)?;
        writeln!(f, "Open Positions:  {}", self.open_positions().count())?;
        write!(f, "Halted Keys:     {}", self.halted().len())?;

        for view in &self.keys {
            write!(f, "\n{:<20} {:<14}", view.key.to_string(), view.status.as_str())?;
            if let Some(pos) = &view.position {
                write!(
                    f,
                    " {} {} @ {} stop {} tp1 {} tp2 {}",
                    pos.side, pos.qty, pos.entry_price, pos.stop_price, pos.tp1_price, pos.tp2_price
                )?;
            }
            if view.halted {
                write!(f, " [HALTED]")?;
            }
        }
        Ok(())
    }
}
