//! Order Validator
//!
//! Pre-submission business rules. Every check runs on every request and
//! each failure contributes its own violation, so a caller always sees the
//! complete problem list:
//!
//! 1. Instrument exists and is tradable
//! 2. Price is a multiple of the tick size
//! 3. Volume is positive and within the per-order maximum
//! 4. Margin covers an opening order
//! 5. Position covers a closing order
//! 6. Exchange is in session
//!
//! Emergency state is consulted last: a paused desk still gets the full
//! diagnostic list, with `TRADING_PAUSED` appended.
//!
//! The validator does no I/O. Account, position and clock inputs come in
//! through [`ValidationContext`], so identical inputs give identical output.

pub mod sessions;

use std::collections::HashMap;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ValidatorConfig;
use crate::emergency::{EmergencyState, SettlementPolicy};
use crate::models::{AccountSnapshot, InstrumentSpec, OrderRequest, PositionSnapshot};
use sessions::SessionCalendar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    InvalidInstrument,
    InstrumentNotTradable,
    InvalidPrice,
    InvalidPriceTick,
    InvalidVolume,
    ExceedMaxVolume,
    InsufficientMargin,
    InsufficientPosition,
    NotTradingTime,
    TradingPaused,
    StrategyStopped,
    SettlementUnconfirmed,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInstrument => "INVALID_INSTRUMENT",
            Self::InstrumentNotTradable => "INSTRUMENT_NOT_TRADABLE",
            Self::InvalidPrice => "INVALID_PRICE",
            Self::InvalidPriceTick => "INVALID_PRICE_TICK",
            Self::InvalidVolume => "INVALID_VOLUME",
            Self::ExceedMaxVolume => "EXCEED_MAX_VOLUME",
            Self::InsufficientMargin => "INSUFFICIENT_MARGIN",
            Self::InsufficientPosition => "INSUFFICIENT_POSITION",
            Self::NotTradingTime => "NOT_TRADING_TIME",
            Self::TradingPaused => "TRADING_PAUSED",
            Self::StrategyStopped => "STRATEGY_STOPPED",
            Self::SettlementUnconfirmed => "SETTLEMENT_UNCONFIRMED",
        }
    }
}

impl std::fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
}

impl Violation {
    fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }

    pub fn codes(&self) -> Vec<ViolationCode> {
        self.violations.iter().map(|v| v.code).collect()
    }
}

/// Caller-supplied inputs. `None` snapshots mean "not loaded yet" and skip
/// the checks that need them.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    pub account: Option<&'a AccountSnapshot>,
    pub positions: Option<&'a [PositionSnapshot]>,
    /// Exchange local time
    pub now: NaiveDateTime,
    pub emergency: &'a EmergencyState,
}

pub struct OrderValidator {
    instruments: RwLock<HashMap<String, InstrumentSpec>>,
    default_calendar: SessionCalendar,
    weekdays_only: bool,
    tick_tolerance: f64,
}

impl OrderValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        let validator = Self {
            instruments: RwLock::new(HashMap::new()),
            default_calendar: SessionCalendar::new(
                config.default_sessions.clone(),
                config.weekdays_only,
            ),
            weekdays_only: config.weekdays_only,
            tick_tolerance: config.tick_tolerance.abs(),
        };
        validator.replace_instruments(config.instruments.clone());
        validator
    }

    /// Swap in a new instrument reference set.
    pub fn replace_instruments(&self, instruments: Vec<InstrumentSpec>) {
        let map: HashMap<_, _> = instruments
            .into_iter()
            .map(|i| (i.instrument_id.clone(), i))
            .collect();
        let count = map.len();
        *self.instruments.write() = map;
        info!(count, "instrument reference set loaded");
    }

    pub fn instrument(&self, instrument_id: &str) -> Option<InstrumentSpec> {
        self.instruments.read().get(instrument_id).cloned()
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.read().len()
    }

    /// Run every check and collect all violations.
    pub fn validate(&self, request: &OrderRequest, ctx: &ValidationContext<'_>) -> ValidationResult {
        let instrument = self.instrument(&request.instrument_id);
        let mut violations = Vec::new();

        // 1. Instrument
        self.check_instrument(request, instrument.as_ref(), &mut violations);

        // 2. Price tick
        self.check_price_tick(request, instrument.as_ref(), &mut violations);

        // 3. Volume
        self.check_volume(request, instrument.as_ref(), &mut violations);

        // 4. Margin (open only)
        if request.offset.is_open() {
            self.check_margin(request, instrument.as_ref(), ctx.account, &mut violations);
        }

        // 5. Position (close only)
        if !request.offset.is_open() {
            self.check_position(request, ctx.positions, &mut violations);
        }

        // 6. Trading hours
        self.check_trading_hours(request, instrument.as_ref(), ctx.now, &mut violations);

        // Emergency state
        self.check_emergency(request, ctx.emergency, &mut violations);

        let result = ValidationResult::from_violations(violations);
        if !result.valid {
            debug!(
                instrument = %request.instrument_id,
                violations = ?result.codes(),
                "order failed validation"
            );
        }
        result
    }

    fn check_instrument(
        &self,
        request: &OrderRequest,
        instrument: Option<&InstrumentSpec>,
        out: &mut Vec<Violation>,
    ) {
        match instrument {
            None => out.push(Violation::new(
                ViolationCode::InvalidInstrument,
                format!("unknown instrument {}", request.instrument_id),
            )),
            Some(spec) if !spec.is_trading => out.push(Violation::new(
                ViolationCode::InstrumentNotTradable,
                format!("instrument {} is not currently tradable", spec.instrument_id),
            )),
            Some(_) => {}
        }
    }

    fn check_price_tick(
        &self,
        request: &OrderRequest,
        instrument: Option<&InstrumentSpec>,
        out: &mut Vec<Violation>,
    ) {
        if !request.price.is_finite() || request.price <= 0.0 {
            out.push(Violation::new(
                ViolationCode::InvalidPrice,
                format!("price {} must be positive", request.price),
            ));
            return;
        }
        let Some(spec) = instrument else {
            return;
        };
        if spec.price_tick <= 0.0 {
            return;
        }

        if !is_tick_multiple(request.price, spec.price_tick, self.tick_tolerance) {
            out.push(Violation::new(
                ViolationCode::InvalidPriceTick,
                format!(
                    "price {} is not a multiple of tick {}",
                    request.price, spec.price_tick
                ),
            ));
        }
    }

    fn check_volume(
        &self,
        request: &OrderRequest,
        instrument: Option<&InstrumentSpec>,
        out: &mut Vec<Violation>,
    ) {
        if request.volume <= 0 {
            out.push(Violation::new(
                ViolationCode::InvalidVolume,
                format!("volume {} must be positive", request.volume),
            ));
            return;
        }
        if let Some(spec) = instrument {
            if request.volume > spec.max_order_volume {
                out.push(Violation::new(
                    ViolationCode::ExceedMaxVolume,
                    format!(
                        "volume {} exceeds per-order maximum {}",
                        request.volume, spec.max_order_volume
                    ),
                ));
            }
        }
    }

    fn check_margin(
        &self,
        request: &OrderRequest,
        instrument: Option<&InstrumentSpec>,
        account: Option<&AccountSnapshot>,
        out: &mut Vec<Violation>,
    ) {
        let (Some(spec), Some(account)) = (instrument, account) else {
            debug!(instrument = %request.instrument_id, "margin check skipped, missing data");
            return;
        };
        if request.price <= 0.0 || request.volume <= 0 {
            return;
        }

        let required = required_margin(request, spec);
        if required > account.available {
            out.push(Violation::new(
                ViolationCode::InsufficientMargin,
                format!(
                    "required margin {:.2} exceeds available {:.2}",
                    required, account.available
                ),
            ));
        }
    }

    fn check_position(
        &self,
        request: &OrderRequest,
        positions: Option<&[PositionSnapshot]>,
        out: &mut Vec<Violation>,
    ) {
        let Some(positions) = positions else {
            debug!(instrument = %request.instrument_id, "position check skipped, no snapshot");
            return;
        };

        let side = request.direction.closes();
        let available: i32 = positions
            .iter()
            .filter(|p| p.instrument_id == request.instrument_id && p.direction == side)
            .map(|p| p.closable(request.offset))
            .sum();

        if request.volume > available {
            out.push(Violation::new(
                ViolationCode::InsufficientPosition,
                format!(
                    "{} {} {} needs {} but only {} {:?} available",
                    request.direction.as_str(),
                    request.offset.as_str(),
                    request.instrument_id,
                    request.volume,
                    available,
                    side
                ),
            ));
        }
    }

    fn check_trading_hours(
        &self,
        request: &OrderRequest,
        instrument: Option<&InstrumentSpec>,
        now: NaiveDateTime,
        out: &mut Vec<Violation>,
    ) {
        let open = match instrument.and_then(|i| i.sessions.as_ref()) {
            Some(custom) => SessionCalendar::new(custom.clone(), self.weekdays_only).is_open(now),
            None => self.default_calendar.is_open(now),
        };
        if !open {
            out.push(Violation::new(
                ViolationCode::NotTradingTime,
                format!("{} is outside trading sessions for {}", now, request.instrument_id),
            ));
        }
    }

    fn check_emergency(&self, request: &OrderRequest, state: &EmergencyState, out: &mut Vec<Violation>) {
        if !state.trading_enabled {
            out.push(Violation::new(
                ViolationCode::TradingPaused,
                format!(
                    "trading paused: {}",
                    state.paused_reason.as_deref().unwrap_or("no reason given")
                ),
            ));
        }

        if let Some(strategy_id) = request.strategy_id.as_deref() {
            if !state.strategy_running(strategy_id) {
                out.push(Violation::new(
                    ViolationCode::StrategyStopped,
                    format!("strategy {} is stopped", strategy_id),
                ));
            }
        }

        if !state.settlement_confirmed {
            let blocked = match state.settlement_policy {
                SettlementPolicy::Disabled => false,
                SettlementPolicy::BlockNewOrders => request.offset.is_open(),
                SettlementPolicy::BlockSession => true,
            };
            if blocked {
                out.push(Violation::new(
                    ViolationCode::SettlementUnconfirmed,
                    "settlement statement not yet confirmed",
                ));
            }
        }
    }
}

/// Margin = price × volume × contract multiplier × margin rate
pub fn required_margin(request: &OrderRequest, spec: &InstrumentSpec) -> f64 {
    request.price * f64::from(request.volume) * spec.volume_multiple * spec.margin_rate
}

/// `price` lies within `tolerance` of an integer multiple of `tick`.
pub fn is_tick_multiple(price: f64, tick: f64, tolerance: f64) -> bool {
    let steps = (price / tick).round();
    (price - steps * tick).abs() <= tolerance
}
