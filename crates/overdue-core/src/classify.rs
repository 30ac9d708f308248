//! Pure timeout classification.
//!
//! One order plus a clock reading goes in, a [`TimeoutVerdict`] comes
//! out. Nothing here mutates the order or carries state between sweeps;
//! the remediation layer owns every side effect.
//!
//! Unassigned orders are only ever checked against their own deadline
//! (purchase requests are the one kind that has one). Pickup and
//! delivery clocks start once a courier is on the order.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::identity::OrderNo;
use crate::order::Timeoutable;
use crate::orders::{ErrandOrder, PurchaseOrder, ShoppingOrder};
use crate::rules::{
    ExpressErrandRules, PurchaseRules, ShoppingRules, StandardErrandRules, TimeoutRules,
};
use crate::status::{ErrandTier, OrderKind, OrderStatus, TimeoutPhase, TimeoutState};

/// Outcome of classifying one order at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutVerdict {
    pub state: TimeoutState,
    /// Phase the verdict belongs to, `None` when `state` is `Normal`.
    pub phase: Option<TimeoutPhase>,
    /// Whole minutes past the line that produced the state: the deadline
    /// for timeouts, the warning line for warnings. Zero for `Normal`.
    pub overdue_minutes: i64,
}

impl TimeoutVerdict {
    pub fn normal() -> Self {
        Self {
            state: TimeoutState::Normal,
            phase: None,
            overdue_minutes: 0,
        }
    }

    /// Whether remediation has anything to do with this verdict.
    pub fn is_actionable(&self) -> bool {
        self.state != TimeoutState::Normal
    }
}

/// Order data too malformed to classify. The sweep logs these, skips the
/// order, and carries on.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("order {order_no} is in transit without an expected delivery time")]
    MissingExpectedDelivery { order_no: OrderNo },
    #[error("order {order_no} is marked delivered without a delivered time")]
    MissingDeliveredAt { order_no: OrderNo },
    #[error("order {order_no} carries kind {kind:?} but a different concrete type")]
    KindMismatch { order_no: OrderNo, kind: OrderKind },
}

/// Classify any order by dispatching on its kind tag.
pub fn classify(
    order: &dyn Timeoutable,
    rules: &TimeoutRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    let kind = order.kind();
    let mismatch = || ClassifyError::KindMismatch {
        order_no: order.order_no().to_string(),
        kind,
    };
    match kind {
        OrderKind::Errand => {
            let errand = order
                .as_any()
                .downcast_ref::<ErrandOrder>()
                .ok_or_else(mismatch)?;
            classify_errand(errand, rules, now)
        }
        OrderKind::Shopping => {
            let shopping = order
                .as_any()
                .downcast_ref::<ShoppingOrder>()
                .ok_or_else(mismatch)?;
            classify_shopping(shopping, &rules.shopping, now)
        }
        OrderKind::Purchase => {
            let purchase = order
                .as_any()
                .downcast_ref::<PurchaseOrder>()
                .ok_or_else(mismatch)?;
            classify_purchase(purchase, &rules.purchase, now)
        }
    }
}

pub fn classify_errand(
    order: &ErrandOrder,
    rules: &TimeoutRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    if order.courier().is_none() {
        return Ok(TimeoutVerdict::normal());
    }
    match order.tier {
        ErrandTier::Standard => classify_errand_standard(order, &rules.errand_standard, now),
        ErrandTier::Express => classify_errand_express(order, &rules.errand_express, now),
    }
}

fn classify_errand_standard(
    order: &ErrandOrder,
    rules: &StandardErrandRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    match order.status() {
        OrderStatus::Pending | OrderStatus::Assigned => {
            let deadline = order.created_at() + Duration::minutes(rules.pickup_minutes);
            Ok(judge(TimeoutPhase::Pickup, deadline, None, now))
        }
        OrderStatus::InTransit => {
            let expected = expected_delivery(order)?;
            let deadline = expected + Duration::minutes(rules.delivery_grace_minutes);
            Ok(judge(TimeoutPhase::Delivery, deadline, None, now))
        }
        _ => Ok(TimeoutVerdict::normal()),
    }
}

fn classify_errand_express(
    order: &ErrandOrder,
    rules: &ExpressErrandRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    match order.status() {
        OrderStatus::Pending | OrderStatus::Assigned => {
            let deadline = order.created_at() + Duration::minutes(rules.pickup_minutes);
            let warn = warn_line(deadline, rules.pickup_minutes, rules.warn_fraction);
            Ok(judge(TimeoutPhase::Pickup, deadline, Some(warn), now))
        }
        OrderStatus::InTransit => {
            let deadline = expected_delivery(order)?;
            let warn = warn_line(deadline, rules.delivery_minutes, rules.warn_fraction);
            Ok(judge(TimeoutPhase::Delivery, deadline, Some(warn), now))
        }
        OrderStatus::Delivered => {
            let delivered = delivered_at(order)?;
            let deadline = delivered + Duration::minutes(rules.confirm_minutes);
            let warn = warn_line(deadline, rules.confirm_minutes, rules.warn_fraction);
            Ok(judge(TimeoutPhase::Confirmation, deadline, Some(warn), now))
        }
        _ => Ok(TimeoutVerdict::normal()),
    }
}

pub fn classify_shopping(
    order: &ShoppingOrder,
    rules: &ShoppingRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    if order.courier().is_none() {
        return Ok(TimeoutVerdict::normal());
    }
    match order.status() {
        OrderStatus::Pending | OrderStatus::Assigned => {
            // Pickup budget is half the kind default, clocked from creation.
            let deadline = order.created_at() + Duration::minutes(rules.default_minutes / 2);
            Ok(judge(TimeoutPhase::Pickup, deadline, None, now))
        }
        OrderStatus::InTransit => {
            let deadline = expected_delivery(order)?;
            Ok(judge(TimeoutPhase::Delivery, deadline, None, now))
        }
        OrderStatus::Delivered => {
            let delivered = delivered_at(order)?;
            let deadline = delivered + Duration::minutes(rules.confirm_minutes);
            Ok(judge(TimeoutPhase::Confirmation, deadline, None, now))
        }
        _ => Ok(TimeoutVerdict::normal()),
    }
}

pub fn classify_purchase(
    order: &PurchaseOrder,
    rules: &PurchaseRules,
    now: DateTime<Utc>,
) -> Result<TimeoutVerdict, ClassifyError> {
    if order.courier().is_none() {
        // Pre-assignment, the requester-chosen deadline is the only clock.
        if let Some(deadline) = order.deadline {
            if now >= deadline {
                return Ok(TimeoutVerdict {
                    state: TimeoutState::ConfirmTimeout,
                    phase: Some(TimeoutPhase::Confirmation),
                    overdue_minutes: (now - deadline).num_minutes(),
                });
            }
        }
        return Ok(TimeoutVerdict::normal());
    }
    match order.status() {
        OrderStatus::Pending | OrderStatus::Assigned => {
            // Pickup budget is a third of the kind default.
            let deadline = order.created_at() + Duration::minutes(rules.default_minutes / 3);
            Ok(judge(TimeoutPhase::Pickup, deadline, None, now))
        }
        OrderStatus::InTransit => {
            let deadline = expected_delivery(order)?;
            Ok(judge(TimeoutPhase::Delivery, deadline, None, now))
        }
        _ => Ok(TimeoutVerdict::normal()),
    }
}

/// Compare `now` against a deadline and an optional warning line.
/// Reaching the deadline wins over the warning.
fn judge(
    phase: TimeoutPhase,
    deadline: DateTime<Utc>,
    warn_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> TimeoutVerdict {
    if now >= deadline {
        return TimeoutVerdict {
            state: TimeoutState::timeout_for(phase),
            phase: Some(phase),
            overdue_minutes: (now - deadline).num_minutes(),
        };
    }
    if let Some(warn_at) = warn_at {
        if now >= warn_at {
            return TimeoutVerdict {
                state: TimeoutState::warning_for(phase),
                phase: Some(phase),
                overdue_minutes: (now - warn_at).num_minutes(),
            };
        }
    }
    TimeoutVerdict::normal()
}

/// Instant at which the warning fraction of a budget is spent, derived
/// by backing off the unspent fraction from the deadline.
fn warn_line(deadline: DateTime<Utc>, budget_minutes: i64, fraction: f64) -> DateTime<Utc> {
    let span = ((1.0 - fraction) * budget_minutes as f64).round() as i64;
    deadline - Duration::minutes(span)
}

fn expected_delivery(order: &dyn Timeoutable) -> Result<DateTime<Utc>, ClassifyError> {
    order
        .expected_delivery_at()
        .ok_or_else(|| ClassifyError::MissingExpectedDelivery {
            order_no: order.order_no().to_string(),
        })
}

fn delivered_at(order: &dyn Timeoutable) -> Result<DateTime<Utc>, ClassifyError> {
    order
        .delivered_at()
        .ok_or_else(|| ClassifyError::MissingDeliveredAt {
            order_no: order.order_no().to_string(),
        })
}
