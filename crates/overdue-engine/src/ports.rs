//! Collaborator ports: fees, notifications, outbound timeout events, and
//! the per-kind service surface.
//!
//! The engine never talks to wallets, push gateways, or kind-specific
//! repositories directly. Everything crosses one of these traits, so a
//! deployment can wire real collaborators while tests substitute fakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use overdue_core::{OrderKind, OrderNo, TimeoutPhase, TimeoutState, Timeoutable, UserId};

use crate::error::EngineError;
use crate::store::UnitOfWork;

/// Who a notice is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Courier(String),
    Requester(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeCategory {
    TimeoutWarning,
    TimeoutPenalty,
    Reassigned,
    Intervention,
    Archived,
    AutoCompleted,
}

/// One outbound message. Delivery mechanics belong to the port impl.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub recipient: Recipient,
    pub category: NoticeCategory,
    pub body: String,
}

impl Notice {
    pub fn to_courier(
        courier: impl Into<String>,
        category: NoticeCategory,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: Recipient::Courier(courier.into()),
            category,
            body: body.into(),
        }
    }

    pub fn to_requester(
        requester: impl Into<String>,
        category: NoticeCategory,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: Recipient::Requester(requester.into()),
            category,
            body: body.into(),
        }
    }
}

/// Emitted once per confirmed timeout, never for warnings. The
/// statistics and risk consumers read these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub order_no: OrderNo,
    pub kind: OrderKind,
    pub timeout_type: TimeoutState,
    /// Courier on the order when one was assigned, otherwise the
    /// requester the timeout counts against.
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// Penalty amounts for confirmed timeouts and their advance estimates.
pub trait FeePort: Send + Sync {
    fn calculate_timeout_fee(
        &self,
        order: &dyn Timeoutable,
        phase: TimeoutPhase,
    ) -> Result<Decimal, EngineError>;

    fn estimate_timeout_fee(
        &self,
        order: &dyn Timeoutable,
        phase: TimeoutPhase,
    ) -> Result<Decimal, EngineError>;
}

/// Fixed fee per (kind, phase). Pairs with no entry cost nothing, which
/// also covers confirmation timeouts where no courier is at fault.
#[derive(Clone, Debug, Default)]
pub struct FlatFeeSchedule {
    fees: HashMap<(OrderKind, TimeoutPhase), Decimal>,
}

impl FlatFeeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fee(mut self, kind: OrderKind, phase: TimeoutPhase, amount: Decimal) -> Self {
        self.fees.insert((kind, phase), amount);
        self
    }
}

impl FeePort for FlatFeeSchedule {
    fn calculate_timeout_fee(
        &self,
        order: &dyn Timeoutable,
        phase: TimeoutPhase,
    ) -> Result<Decimal, EngineError> {
        Ok(self
            .fees
            .get(&(order.kind(), phase))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn estimate_timeout_fee(
        &self,
        order: &dyn Timeoutable,
        phase: TimeoutPhase,
    ) -> Result<Decimal, EngineError> {
        self.calculate_timeout_fee(order, phase)
    }
}

/// Outbound notification delivery.
#[async_trait]
pub trait NotifyPort: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), EngineError>;
}

/// Logs notices instead of delivering them. Useful as a default wiring
/// and in deployments that run without a push gateway.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotifyPort for TracingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), EngineError> {
        info!(
            recipient = ?notice.recipient,
            category = ?notice.category,
            body = %notice.body,
            "notice"
        );
        Ok(())
    }
}

/// Captures notices for inspection.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotifyPort for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), EngineError> {
        self.sent
            .lock()
            .map_err(|_| EngineError::Notify("notice buffer lock poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }
}

/// Consumer-facing stream of confirmed timeouts. Emission is fire and
/// forget; a slow or absent consumer must never stall remediation.
pub trait TimeoutEventSink: Send + Sync {
    fn emit(&self, event: TimeoutEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl TimeoutEventSink for TracingEventSink {
    fn emit(&self, event: TimeoutEvent) {
        info!(
            order_no = %event.order_no,
            kind = event.kind.as_str(),
            timeout_type = event.timeout_type.as_str(),
            user_id = %event.user_id,
            "timeout event"
        );
    }
}

/// Buffers events for inspection.
#[derive(Clone, Debug, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<TimeoutEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TimeoutEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TimeoutEventSink for RecordingEventSink {
    fn emit(&self, event: TimeoutEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Kind-owned transitions. One implementation exists per order kind;
/// the remediation handler picks the right one off a dispatch table and
/// never mutates kind-specific fields itself.
///
/// Implementations stage their writes on the passed unit of work; the
/// sweep commits or rolls back the whole unit per order.
pub trait KindService: Send + Sync {
    fn kind(&self) -> OrderKind;

    /// Put a picked-up-too-late order back in the assignment pool with a
    /// fresh delivery promise and a clean timeout state.
    fn reset_for_reassignment(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Snapshot the order as abandoned and close it out.
    fn archive(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Park the order for staff resolution.
    fn mark_intervention(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Settle a delivered-but-unconfirmed order on the requester's
    /// behalf.
    fn complete_automatically(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Stage the order as-is, with whatever the handler already set.
    fn save(&self, unit: &mut UnitOfWork, order: &dyn Timeoutable) -> Result<(), EngineError>;
}
