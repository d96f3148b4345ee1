//! Order activity counters, per instrument and per account, scoped to the
//! broker trading day.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::Offset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Open,
    Close,
    Cancel,
}

impl ActivityKind {
    /// Insert kind for an order with this offset.
    pub fn for_offset(offset: Offset) -> Self {
        if offset.is_open() {
            ActivityKind::Open
        } else {
            ActivityKind::Close
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentCounters {
    pub open_count: u64,
    pub close_count: u64,
    pub cancel_count: u64,
}

impl InstrumentCounters {
    pub fn total(&self) -> u64 {
        self.open_count + self.close_count + self.cancel_count
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCounters {
    /// Opens plus closes
    pub total_orders: u64,
    pub total_cancels: u64,
    pub total_opens: u64,
    pub total_closes: u64,
    pub total_trades: u64,
    pub total_trade_volume: u64,
}

/// Post-increment view returned by [`OrderActivityRegistry::record`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub instrument_id: String,
    pub kind: ActivityKind,
    pub instrument: InstrumentCounters,
    pub account: AccountCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub trading_day: Option<String>,
    pub instruments: BTreeMap<String, InstrumentCounters>,
    pub account: AccountCounters,
}

impl ActivitySnapshot {
    /// Most active instruments by total instruction count, busiest first.
    pub fn top_instruments(&self, n: usize) -> Vec<(String, InstrumentCounters)> {
        let mut ranked: Vec<_> = self
            .instruments
            .iter()
            .map(|(id, c)| (id.clone(), *c))
            .collect();
        ranked.sort_by(|a, b| b.1.total().cmp(&a.1.total()).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }
}

#[derive(Debug, Default)]
struct ActivityState {
    trading_day: Option<String>,
    instruments: BTreeMap<String, InstrumentCounters>,
    account: AccountCounters,
}

/// Overflow here means the counters can no longer be trusted; halt.
fn bump(counter: &mut u64, by: u64, what: &str) {
    *counter = match counter.checked_add(by) {
        Some(v) => v,
        None => panic!("activity counter overflow: {}", what),
    };
}

#[derive(Debug, Default)]
pub struct OrderActivityRegistry {
    state: Mutex<ActivityState>,
}

impl OrderActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one instruction and return the counters after the increment.
    pub fn record(&self, instrument_id: &str, kind: ActivityKind) -> ActivityUpdate {
        let mut state = self.state.lock();
        let ActivityState {
            instruments,
            account,
            ..
        } = &mut *state;

        let counters = instruments.entry(instrument_id.to_string()).or_default();
        match kind {
            ActivityKind::Open => {
                bump(&mut counters.open_count, 1, "open_count");
                bump(&mut account.total_opens, 1, "total_opens");
                bump(&mut account.total_orders, 1, "total_orders");
            }
            ActivityKind::Close => {
                bump(&mut counters.close_count, 1, "close_count");
                bump(&mut account.total_closes, 1, "total_closes");
                bump(&mut account.total_orders, 1, "total_orders");
            }
            ActivityKind::Cancel => {
                bump(&mut counters.cancel_count, 1, "cancel_count");
                bump(&mut account.total_cancels, 1, "total_cancels");
            }
        }

        ActivityUpdate {
            instrument_id: instrument_id.to_string(),
            kind,
            instrument: *counters,
            account: *account,
        }
    }

    pub fn record_trade(&self, volume: i32) {
        let mut state = self.state.lock();
        bump(&mut state.account.total_trades, 1, "total_trades");
        bump(
            &mut state.account.total_trade_volume,
            u64::from(volume.max(0).unsigned_abs()),
            "total_trade_volume",
        );
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let state = self.state.lock();
        ActivitySnapshot {
            trading_day: state.trading_day.clone(),
            instruments: state.instruments.clone(),
            account: state.account,
        }
    }

    pub fn instrument(&self, instrument_id: &str) -> InstrumentCounters {
        self.state
            .lock()
            .instruments
            .get(instrument_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn trading_day(&self) -> Option<String> {
        self.state.lock().trading_day.clone()
    }

    /// Reset every counter for a new broker trading day.
    ///
    /// Returns false (and changes nothing) if `trading_day` is already current.
    pub fn rollover(&self, trading_day: &str) -> bool {
        let mut state = self.state.lock();
        if state.trading_day.as_deref() == Some(trading_day) {
            return false;
        }

        let previous = state.trading_day.replace(trading_day.to_string());
        let summary = state.account;
        state.instruments.clear();
        state.account = AccountCounters::default();
        drop(state);

        info!(
            previous = previous.as_deref().unwrap_or("-"),
            trading_day,
            orders = summary.total_orders,
            cancels = summary.total_cancels,
            trades = summary.total_trades,
            "activity counters rolled over"
        );
        true
    }
}
