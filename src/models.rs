use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validator::sessions::TradingSession;

/// Broker-assigned client order reference
pub type OrderRef = String;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }

    /// Position side consumed when this side closes.
    /// A closing buy covers a short, a closing sell flattens a long.
    pub fn closes(&self) -> PositionDirection {
        match self {
            Direction::Buy => PositionDirection::Short,
            Direction::Sell => PositionDirection::Long,
        }
    }
}

/// Offset flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offset {
    Open,
    Close,
    CloseToday,
    CloseYesterday,
}

impl Offset {
    pub fn as_str(&self) -> &str {
        match self {
            Offset::Open => "open",
            Offset::Close => "close",
            Offset::CloseToday => "close_today",
            Offset::CloseYesterday => "close_yesterday",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Offset::Open)
    }
}

/// Held position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    Long,
    Short,
}

/// Outgoing order intent from a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub volume: i32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Originating strategy; manual orders carry none
    #[serde(default)]
    pub strategy_id: Option<String>,
}

impl OrderRequest {
    pub fn new(
        instrument_id: impl Into<String>,
        direction: Direction,
        offset: Offset,
        price: f64,
        volume: i32,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            direction,
            offset,
            price,
            volume,
            timestamp: Utc::now(),
            strategy_id: None,
        }
    }

    pub fn with_strategy(mut self, strategy_id: impl Into<String>) -> Self {
        self.strategy_id = Some(strategy_id.into());
        self
    }
}

/// Instrument reference data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub instrument_id: String,
    #[serde(default)]
    pub exchange_id: String,
    pub price_tick: f64,
    #[serde(default = "default_volume_multiple")]
    pub volume_multiple: f64,
    #[serde(default = "default_max_order_volume")]
    pub max_order_volume: i32,
    #[serde(default = "default_margin_rate")]
    pub margin_rate: f64,
    #[serde(default = "default_true")]
    pub is_trading: bool,
    /// Overrides the default session calendar when present
    #[serde(default)]
    pub sessions: Option<Vec<TradingSession>>,
}

fn default_volume_multiple() -> f64 {
    10.0
}

fn default_max_order_volume() -> i32 {
    1000
}

fn default_margin_rate() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl InstrumentSpec {
    pub fn new(instrument_id: impl Into<String>, price_tick: f64) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            exchange_id: String::new(),
            price_tick,
            volume_multiple: default_volume_multiple(),
            max_order_volume: default_max_order_volume(),
            margin_rate: default_margin_rate(),
            is_trading: true,
            sessions: None,
        }
    }
}

/// Trading account funds as last reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: f64,
    pub available: f64,
    pub current_margin: f64,
    pub frozen_margin: f64,
    pub updated_at: DateTime<Utc>,
}

/// One side of a position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument_id: String,
    pub direction: PositionDirection,
    pub position: i32,
    pub today_position: i32,
    pub yd_position: i32,
}

impl PositionSnapshot {
    /// Volume a close order with this offset may consume.
    pub fn closable(&self, offset: Offset) -> i32 {
        match offset {
            Offset::Open => 0,
            Offset::Close => self.position,
            Offset::CloseToday => self.today_position,
            Offset::CloseYesterday => self.yd_position,
        }
    }
}

/// Order lifecycle status as reported by order returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Submitted, broker acknowledgment not yet seen
    PendingInsert,
    Queued,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::PendingInsert => "pending_insert",
            OrderStatus::Queued => "queued",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    /// Still working at the exchange (or about to be)
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderStatus::PendingInsert | OrderStatus::Queued | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
