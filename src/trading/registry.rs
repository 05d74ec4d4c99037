//! Per-key position registry.
//!
//! Each key has its own `tokio::sync::Mutex`; a cycle holds it from the
//! first market-data read to the last ledger write, so entry and exit
//! decisions for one key never interleave. Readers that must not block on
//! a cycle use [`PositionRegistry::snapshot`], which serves the last
//! published view.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::indicators::{IndicatorEngine, TrendFilter};
use crate::models::{
    ExchangeLimits, PendingEntry, Position, PositionKey, PositionStatus, Timeframe,
};

use super::signal::SignalGenerator;

/// Everything one key's cycle mutates.
#[derive(Debug)]
pub struct KeySlot {
    pub key: PositionKey,
    pub timeframe: Timeframe,
    pub htf_timeframe: Timeframe,
    pub position: Option<Position>,
    /// Entry order whose outcome is still unknown
    pub pending_entry: Option<PendingEntry>,
    pub last_close: Option<DateTime<Utc>>,
    /// Set after a fatal gateway error; the key is skipped from then on
    pub halted: bool,
    pub engine: IndicatorEngine,
    pub trend: TrendFilter,
    pub signals: SignalGenerator,
    pub limits: ExchangeLimits,
    pub warmed_up: bool,
}

impl KeySlot {
    pub fn status(&self) -> PositionStatus {
        if self.pending_entry.is_some() {
            return PositionStatus::PendingEntry;
        }
        match &self.position {
            Some(pos) => pos.status,
            None => PositionStatus::None,
        }
    }

    fn view(&self) -> KeyView {
        KeyView {
            key: self.key.clone(),
            status: self.status(),
            position: self.position.clone(),
            last_close: self.last_close,
            halted: self.halted,
            last_bar: self.engine.last_timestamp(),
        }
    }
}

/// Read-only copy of a slot, safe to hand to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub key: PositionKey,
    pub status: PositionStatus,
    pub position: Option<Position>,
    pub last_close: Option<DateTime<Utc>>,
    pub halted: bool,
    pub last_bar: Option<DateTime<Utc>>,
}

pub struct PositionRegistry {
    slots: HashMap<PositionKey, Arc<Mutex<KeySlot>>>,
    views: RwLock<BTreeMap<PositionKey, KeyView>>,
    /// Notional promised to entries still awaiting confirmation
    reserved: StdMutex<Decimal>,
}

impl PositionRegistry {
    pub fn new(slots: Vec<KeySlot>) -> Self {
        let views = slots
            .iter()
            .map(|slot| (slot.key.clone(), slot.view()))
            .collect();
        let slots = slots
            .into_iter()
            .map(|slot| (slot.key.clone(), Arc::new(Mutex::new(slot))))
            .collect();
        Self {
            slots,
            views: RwLock::new(views),
            reserved: StdMutex::new(Decimal::ZERO),
        }
    }

    pub fn keys(&self) -> Vec<PositionKey> {
        let mut keys: Vec<PositionKey> = self.slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Exclusive access to one key for the length of a cycle.
    pub async fn lock(&self, key: &PositionKey) -> Option<OwnedMutexGuard<KeySlot>> {
        let slot = self.slots.get(key)?.clone();
        Some(slot.lock_owned().await)
    }

    /// Publish the slot's current state for lock-free readers.
    pub fn publish(&self, slot: &KeySlot) {
        let mut views = match self.views.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        views.insert(slot.key.clone(), slot.view());
    }

    pub fn snapshot(&self) -> Vec<KeyView> {
        let views = match self.views.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        views.values().cloned().collect()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.snapshot()
            .into_iter()
            .filter_map(|view| view.position)
            .collect()
    }

    /// Notional of published open positions plus in-flight reservations.
    pub fn committed_notional(&self) -> Decimal {
        let open: Decimal = self.open_positions().iter().map(|p| p.notional()).sum();
        open + self.reserved_notional()
    }

    fn reserved_notional(&self) -> Decimal {
        match self.reserved.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Budget left under `cap`.
    pub fn remaining_budget(&self, cap: Decimal) -> Decimal {
        (cap - self.committed_notional()).max(Decimal::ZERO)
    }

    /// Claim `amount` of the budget for an entry in flight. Fails if another
    /// key claimed it first.
    pub fn reserve(&self, cap: Decimal, amount: Decimal) -> bool {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Read under the lock. An entry publishes its position before it
        // releases its reservation, so it is counted at least once.
        let open: Decimal = self.open_positions().iter().map(|p| p.notional()).sum();
        if open + *reserved + amount > cap {
            return false;
        }
        *reserved += amount;
        true
    }

    pub fn release(&self, amount: Decimal) {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *reserved = (*reserved - amount).max(Decimal::ZERO);
    }
}
