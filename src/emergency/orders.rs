//! Working-order book.
//!
//! Built from our own submissions plus order returns. Bulk cancels read
//! it to find what is still working, and wait here for insert
//! acknowledgments that have not arrived yet.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::models::{Direction, Offset, OrderRef, OrderRequest, OrderStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_ref: OrderRef,
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i32,
    pub filled: i32,
    pub status: OrderStatus,
    pub order_sys_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Fields carried by an order return
#[derive(Debug, Clone)]
pub struct OrderReturn<'a> {
    pub order_ref: &'a str,
    pub instrument_id: &'a str,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i32,
    pub status: OrderStatus,
    pub order_sys_id: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct OpenOrderBook {
    orders: RwLock<HashMap<OrderRef, TrackedOrder>>,
    acked: Notify,
}

impl OpenOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register our own submission. An order return that raced ahead of
    /// this call wins.
    pub fn register_submitted(&self, order_ref: &str, request: &OrderRequest) {
        let mut orders = self.orders.write();
        orders
            .entry(order_ref.to_string())
            .or_insert_with(|| TrackedOrder {
                order_ref: order_ref.to_string(),
                instrument_id: request.instrument_id.clone(),
                direction: request.direction,
                offset: request.offset,
                volume: request.volume,
                filled: 0,
                status: OrderStatus::PendingInsert,
                order_sys_id: None,
                submitted_at: Utc::now(),
            });
    }

    /// Apply an order return. Returns true if this is the first
    /// acknowledgment seen for the order.
    pub fn apply_order_return(&self, ret: &OrderReturn<'_>) -> bool {
        let first = {
            let mut orders = self.orders.write();
            match orders.get_mut(ret.order_ref) {
                Some(order) => {
                    let first = order.status == OrderStatus::PendingInsert;
                    // Terminal states are final; a late queued return must not reopen
                    if order.status.is_open() {
                        order.status = ret.status;
                    }
                    if let Some(sys_id) = ret.order_sys_id {
                        order.order_sys_id = Some(sys_id.to_string());
                    }
                    first
                }
                None => {
                    orders.insert(
                        ret.order_ref.to_string(),
                        TrackedOrder {
                            order_ref: ret.order_ref.to_string(),
                            instrument_id: ret.instrument_id.to_string(),
                            direction: ret.direction,
                            offset: ret.offset,
                            volume: ret.volume,
                            filled: 0,
                            status: ret.status,
                            order_sys_id: ret.order_sys_id.map(str::to_string),
                            submitted_at: Utc::now(),
                        },
                    );
                    true
                }
            }
        };
        self.acked.notify_waiters();
        first
    }

    pub fn apply_trade(&self, order_ref: &str, volume: i32) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_ref) {
            order.filled = (order.filled + volume).min(order.volume);
            if order.status.is_open() {
                order.status = if order.filled >= order.volume {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
            }
        } else {
            debug!(order_ref, "trade for untracked order");
        }
    }

    pub fn get(&self, order_ref: &str) -> Option<TrackedOrder> {
        self.orders.read().get(order_ref).cloned()
    }

    /// Working orders, oldest first, optionally for one instrument.
    pub fn open_orders(&self, instrument_id: Option<&str>) -> Vec<TrackedOrder> {
        let mut open: Vec<_> = self
            .orders
            .read()
            .values()
            .filter(|o| o.status.is_open())
            .filter(|o| instrument_id.map_or(true, |id| o.instrument_id == id))
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.order_ref.cmp(&b.order_ref))
        });
        open
    }

    /// Drop finished orders, e.g. at trading-day rollover.
    pub fn prune_terminal(&self) -> usize {
        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|_, o| o.status.is_open());
        before - orders.len()
    }

    /// Wait until the order has left `PendingInsert`, up to `timeout`.
    /// Returns the order as last seen.
    pub async fn wait_for_ack(&self, order_ref: &str, timeout: Duration) -> Option<TrackedOrder> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.acked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let order = self.get(order_ref)?;
            if order.status != OrderStatus::PendingInsert {
                return Some(order);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(order_ref);
            }
        }
    }
}
