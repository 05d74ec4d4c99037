//! Trading core: signals, sizing, position lifecycle, cooldown, equity.

mod config;
mod cooldown;
mod equity;
mod position_sizer;
mod registry;
mod signal;
mod state_machine;

pub use config::{RiskConfig, StrategyConfig, StrategyKind, TradeManagerConfig};
pub use cooldown::CooldownManager;
pub use equity::{EquityTracker, FillRecord};
pub use position_sizer::{RiskSizer, SizingInput};
pub use registry::{KeySlot, KeyView, PositionRegistry};
pub use signal::{Setup, SignalGenerator};
pub use state_machine::{ExitTrigger, PositionStateMachine};
