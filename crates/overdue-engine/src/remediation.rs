//! State-driven remediation of timeout verdicts.
//!
//! Given a non-normal verdict, the handler applies the right side
//! effects: penalty, reassignment, escalation, auto-completion, or
//! archival. Everything is staged on the order's unit of work; the
//! caller commits. Kind-specific transitions go through the service
//! registry, so this module only ever touches the shared accessors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use overdue_core::{
    errand_tier, ConfirmationPolicy, OrderKind, TimeoutPhase, TimeoutRules, TimeoutState,
    TimeoutVerdict, Timeoutable,
};

use crate::archive::ABANDON_REASON;
use crate::error::EngineError;
use crate::ports::{FeePort, KindService, Notice, NoticeCategory, TimeoutEvent};
use crate::store::UnitOfWork;
use crate::warning::WarningStore;

/// What remediation did with one verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemediationOutcome {
    Noop,
    WarningSent,
    WarningSuppressed,
    /// Courier cleared, order back in the assignment pool.
    Reassigned,
    /// Confirmed timeout counted without any further transition.
    StrikeRecorded,
    /// Parked for staff resolution.
    Escalated,
    AutoCompleted,
    Archived,
}

pub struct RemediationHandler {
    services: HashMap<OrderKind, Arc<dyn KindService>>,
    fees: Arc<dyn FeePort>,
    warnings: Arc<dyn WarningStore>,
    rules: Arc<TimeoutRules>,
}

impl RemediationHandler {
    pub fn new(
        services: HashMap<OrderKind, Arc<dyn KindService>>,
        fees: Arc<dyn FeePort>,
        warnings: Arc<dyn WarningStore>,
        rules: Arc<TimeoutRules>,
    ) -> Self {
        Self {
            services,
            fees,
            warnings,
            rules,
        }
    }

    /// Apply the side effects `verdict` calls for, staging them on
    /// `unit`. The order is mutated in place to its post-remediation
    /// state; nothing hits storage until the unit commits.
    pub fn remediate(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        verdict: &TimeoutVerdict,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, EngineError> {
        match verdict.state {
            TimeoutState::Normal => Ok(RemediationOutcome::Noop),
            TimeoutState::PickupWarning
            | TimeoutState::DeliveryWarning
            | TimeoutState::ConfirmWarning => self.handle_warning(unit, order, verdict, now),
            TimeoutState::PickupTimeout => self.handle_pickup_timeout(unit, order, now),
            TimeoutState::DeliveryTimeout => self.handle_delivery_timeout(unit, order, now),
            TimeoutState::ConfirmTimeout => self.handle_confirm_timeout(unit, order, now),
        }
    }

    fn service(&self, kind: OrderKind) -> Result<&dyn KindService, EngineError> {
        self.services
            .get(&kind)
            .map(|service| service.as_ref())
            .ok_or_else(|| {
                EngineError::Remediation(format!(
                    "no service registered for kind {}",
                    kind.as_str()
                ))
            })
    }

    fn handle_pickup_timeout(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, EngineError> {
        let courier = order.courier().map(str::to_string);
        self.apply_penalty(unit, order, TimeoutPhase::Pickup, now)?;
        order.set_timeout_count(order.timeout_count() + 1);
        order.set_timeout_state(TimeoutState::PickupTimeout);
        self.emit_confirmed(unit, order, TimeoutState::PickupTimeout, now);

        let kind = order.kind();
        let service = self.service(kind)?;
        if order.timeout_count() >= self.rules.archive_threshold(kind) {
            service.archive(unit, order, ABANDON_REASON, now)?;
            return Ok(RemediationOutcome::Archived);
        }

        service.reset_for_reassignment(unit, order, now)?;
        if let Some(courier) = courier {
            unit.push_notice(Notice::to_courier(
                courier,
                NoticeCategory::Reassigned,
                format!(
                    "Order {} was taken back after the pickup window lapsed.",
                    order.order_no()
                ),
            ));
        }
        unit.push_notice(Notice::to_requester(
            order.requester(),
            NoticeCategory::Reassigned,
            format!(
                "Order {} is being handed to a new courier after a pickup timeout.",
                order.order_no()
            ),
        ));
        Ok(RemediationOutcome::Reassigned)
    }

    fn handle_delivery_timeout(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, EngineError> {
        self.apply_penalty(unit, order, TimeoutPhase::Delivery, now)?;
        order.set_timeout_count(order.timeout_count() + 1);
        order.set_timeout_state(TimeoutState::DeliveryTimeout);
        self.emit_confirmed(unit, order, TimeoutState::DeliveryTimeout, now);

        let kind = order.kind();
        let service = self.service(kind)?;
        let threshold = self.rules.archive_threshold(kind);
        let escalate = self.rules.escalates_immediately(kind, errand_tier(order))
            || order.timeout_count() >= threshold.saturating_sub(1);
        if !escalate {
            service.save(unit, order)?;
            return Ok(RemediationOutcome::StrikeRecorded);
        }

        service.mark_intervention(unit, order, now)?;
        self.push_intervention_notices(unit, order);
        Ok(RemediationOutcome::Escalated)
    }

    fn handle_confirm_timeout(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, EngineError> {
        order.set_timeout_count(order.timeout_count() + 1);
        order.set_timeout_state(TimeoutState::ConfirmTimeout);
        self.emit_confirmed(unit, order, TimeoutState::ConfirmTimeout, now);

        let kind = order.kind();
        let service = self.service(kind)?;
        match self.rules.confirmation_policy(kind) {
            ConfirmationPolicy::AutoComplete => {
                service.complete_automatically(unit, order, now)?;
                unit.push_notice(Notice::to_requester(
                    order.requester(),
                    NoticeCategory::AutoCompleted,
                    format!(
                        "Order {} was completed automatically after the confirmation window lapsed.",
                        order.order_no()
                    ),
                ));
                Ok(RemediationOutcome::AutoCompleted)
            }
            ConfirmationPolicy::RequireReview => {
                service.mark_intervention(unit, order, now)?;
                self.push_intervention_notices(unit, order);
                Ok(RemediationOutcome::Escalated)
            }
        }
    }

    fn handle_warning(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        verdict: &TimeoutVerdict,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, EngineError> {
        let state = verdict.state;
        if let Some(last) = self.warnings.last_warning(order.kind(), order.id())? {
            if last.state == state && now - last.recorded_at < self.rules.suppression_window() {
                debug!(order_no = %order.order_no(), state = state.as_str(), "warning suppressed");
                return Ok(RemediationOutcome::WarningSuppressed);
            }
        }

        let phase = verdict.phase.ok_or_else(|| {
            EngineError::Remediation(format!(
                "warning verdict without a phase for order {}",
                order.order_no()
            ))
        })?;
        let estimate = self.fees.estimate_timeout_fee(order, phase)?;
        if let Some(courier) = order.courier() {
            unit.push_notice(Notice::to_courier(
                courier,
                NoticeCategory::TimeoutWarning,
                warning_body(order, phase, estimate),
            ));
        }
        if state == TimeoutState::ConfirmWarning {
            unit.push_notice(Notice::to_requester(
                order.requester(),
                NoticeCategory::TimeoutWarning,
                format!("Order {} is waiting for your confirmation.", order.order_no()),
            ));
        }

        self.warnings
            .record_warning(order.kind(), order.id(), state, now)?;
        order.set_timeout_state(state);
        order.set_warning_sent(true);
        self.service(order.kind())?.save(unit, order)?;
        Ok(RemediationOutcome::WarningSent)
    }

    /// Debit the courier's pending balance if the phase carries a fee.
    /// Confirmed timeouts without an assigned courier never reach here.
    fn apply_penalty(
        &self,
        unit: &mut UnitOfWork,
        order: &dyn Timeoutable,
        phase: TimeoutPhase,
        now: DateTime<Utc>,
    ) -> Result<Decimal, EngineError> {
        let amount = self.fees.calculate_timeout_fee(order, phase)?;
        if amount <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let courier = order.courier().ok_or_else(|| {
            EngineError::Remediation(format!(
                "order {} hit a {} timeout with no courier to penalize",
                order.order_no(),
                phase.as_str()
            ))
        })?;
        unit.debit_pending(
            courier,
            amount,
            format!("{} timeout on order {}", phase.as_str(), order.order_no()),
            now,
        );
        unit.push_notice(Notice::to_courier(
            courier,
            NoticeCategory::TimeoutPenalty,
            format!(
                "A fee of {amount} was deducted for the {} timeout on order {}.",
                phase.as_str(),
                order.order_no()
            ),
        ));
        Ok(amount)
    }

    /// Queue the confirmed-timeout event. Counts against the courier
    /// when one is on the order, otherwise the requester.
    fn emit_confirmed(
        &self,
        unit: &mut UnitOfWork,
        order: &dyn Timeoutable,
        state: TimeoutState,
        now: DateTime<Utc>,
    ) {
        let user_id = order
            .courier()
            .unwrap_or_else(|| order.requester())
            .to_string();
        unit.push_event(TimeoutEvent {
            order_no: order.order_no().to_string(),
            kind: order.kind(),
            timeout_type: state,
            user_id,
            at: now,
        });
    }

    fn push_intervention_notices(&self, unit: &mut UnitOfWork, order: &dyn Timeoutable) {
        if let Some(courier) = order.courier() {
            unit.push_notice(Notice::to_courier(
                courier,
                NoticeCategory::Intervention,
                format!(
                    "Order {} was escalated to platform staff.",
                    order.order_no()
                ),
            ));
        }
        unit.push_notice(Notice::to_requester(
            order.requester(),
            NoticeCategory::Intervention,
            format!(
                "Order {} needs attention from our staff. We will follow up shortly.",
                order.order_no()
            ),
        ));
    }
}

fn warning_body(order: &dyn Timeoutable, phase: TimeoutPhase, estimate: Decimal) -> String {
    if estimate > Decimal::ZERO {
        format!(
            "Order {} is close to its {} deadline. Letting it lapse costs {estimate}.",
            order.order_no(),
            phase.as_str()
        )
    } else {
        format!(
            "Order {} is close to its {} deadline.",
            order.order_no(),
            phase.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveService;
    use crate::ports::{FlatFeeSchedule, Recipient};
    use crate::services::standard_registry;
    use crate::store::{InMemoryMarketStore, MarketStore, UnitReceipt};
    use crate::warning::InMemoryWarningStore;
    use chrono::Duration;
    use overdue_core::{
        Address, ErrandOrder, ErrandTier, OrderStatus, PurchaseOrder, ShoppingOrder,
    };
    use rust_decimal_macros::dec;

    struct Setup {
        handler: RemediationHandler,
        store: InMemoryMarketStore,
        warnings: Arc<InMemoryWarningStore>,
    }

    fn setup(fees: FlatFeeSchedule) -> Setup {
        let rules = Arc::new(TimeoutRules::default());
        let warnings = Arc::new(InMemoryWarningStore::new());
        let handler = RemediationHandler::new(
            standard_registry(rules.clone(), Arc::new(ArchiveService::without_regions())),
            Arc::new(fees),
            warnings.clone(),
            rules,
        );
        Setup {
            handler,
            store: InMemoryMarketStore::new(),
            warnings,
        }
    }

    fn verdict(state: TimeoutState) -> TimeoutVerdict {
        TimeoutVerdict {
            state,
            phase: state.phase(),
            overdue_minutes: 1,
        }
    }

    fn shopping_assigned() -> ShoppingOrder {
        ShoppingOrder::new(
            10,
            "SH-1",
            "user-2",
            "Corner Mart",
            Address::new("9 Market Sq"),
            Address::new("4 Hill Rd"),
            dec!(42.00),
            dec!(5.00),
            Utc::now() - Duration::minutes(31),
        )
        .with_courier("courier-2")
        .with_status(OrderStatus::Assigned)
    }

    fn express_errand() -> ErrandOrder {
        ErrandOrder::new(
            11,
            "ER-1",
            "user-1",
            ErrandTier::Express,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd"),
            dec!(8.00),
            Utc::now() - Duration::minutes(17),
        )
        .with_courier("courier-1")
    }

    fn run(
        setup: &Setup,
        order: &mut dyn Timeoutable,
        state: TimeoutState,
        now: DateTime<Utc>,
    ) -> (RemediationOutcome, UnitReceipt) {
        let mut unit = UnitOfWork::new(order.order_no().to_string());
        let outcome = setup
            .handler
            .remediate(&mut unit, order, &verdict(state), now)
            .unwrap();
        let receipt = unit.commit(&setup.store).unwrap();
        (outcome, receipt)
    }

    #[test]
    fn pickup_timeout_penalizes_resets_and_increments() {
        let fees = FlatFeeSchedule::new().with_fee(
            OrderKind::Shopping,
            TimeoutPhase::Pickup,
            dec!(2.00),
        );
        let setup = setup(fees);
        setup.store.set_pending_balance("courier-2", dec!(10.00)).unwrap();
        let mut order = shopping_assigned();
        setup.store.put_shopping(order.clone()).unwrap();

        let now = Utc::now();
        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::PickupTimeout, now);

        assert_eq!(outcome, RemediationOutcome::Reassigned);
        assert_eq!(order.courier(), None);
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.timeout_count(), 1);
        assert_eq!(order.timeout_state(), TimeoutState::Normal);

        assert_eq!(setup.store.pending_balance("courier-2").unwrap(), dec!(8.00));
        assert_eq!(setup.store.platform_income().unwrap(), dec!(2.00));

        assert_eq!(receipt.events.len(), 1);
        assert_eq!(receipt.events[0].timeout_type, TimeoutState::PickupTimeout);
        assert_eq!(receipt.events[0].user_id, "courier-2");

        // Penalty notice, courier reassignment notice, requester notice.
        assert_eq!(receipt.notices.len(), 3);
    }

    #[test]
    fn zero_fee_pickup_timeout_still_resets() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = shopping_assigned();
        setup.store.put_shopping(order.clone()).unwrap();

        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::PickupTimeout, Utc::now());

        assert_eq!(outcome, RemediationOutcome::Reassigned);
        assert!(setup.store.journal().unwrap().is_empty());
        // No penalty notice, just the two reassignment notices.
        assert_eq!(receipt.notices.len(), 2);
    }

    #[test]
    fn pickup_timeout_at_threshold_archives_instead_of_reassigning() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = shopping_assigned().with_timeout_count(9);
        setup.store.put_shopping(order.clone()).unwrap();

        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::PickupTimeout, Utc::now());

        assert_eq!(outcome, RemediationOutcome::Archived);
        assert_eq!(order.timeout_count(), 10);
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert!(order.cancel_reason().unwrap().contains("system-archived"));

        let snapshot = setup.store.abandoned_order("SH-1").unwrap().unwrap();
        assert_eq!(snapshot.timeout_count, 10);
        assert_eq!(receipt.events.len(), 1);
    }

    #[test]
    fn warnings_notify_without_touching_the_counter() {
        let fees = FlatFeeSchedule::new().with_fee(
            OrderKind::Errand,
            TimeoutPhase::Pickup,
            dec!(2.00),
        );
        let setup = setup(fees);
        let mut order = express_errand();
        setup.store.put_errand(order.clone()).unwrap();

        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::PickupWarning, Utc::now());

        assert_eq!(outcome, RemediationOutcome::WarningSent);
        assert_eq!(order.timeout_count(), 0);
        assert_eq!(order.timeout_state(), TimeoutState::PickupWarning);
        assert!(order.warning_sent());
        assert!(receipt.events.is_empty());
        assert_eq!(receipt.notices.len(), 1);
        assert!(receipt.notices[0].body.contains("2.00"));
    }

    #[test]
    fn repeat_warning_within_the_window_is_suppressed() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = express_errand();
        setup.store.put_errand(order.clone()).unwrap();

        let now = Utc::now();
        let (first, first_receipt) = run(&setup, &mut order, TimeoutState::PickupWarning, now);
        assert_eq!(first, RemediationOutcome::WarningSent);
        assert_eq!(first_receipt.notices.len(), 1);

        let again = now + Duration::minutes(10);
        let (second, second_receipt) =
            run(&setup, &mut order, TimeoutState::PickupWarning, again);
        assert_eq!(second, RemediationOutcome::WarningSuppressed);
        assert!(second_receipt.notices.is_empty());

        let later = now + Duration::minutes(31);
        let (third, third_receipt) =
            run(&setup, &mut order, TimeoutState::PickupWarning, later);
        assert_eq!(third, RemediationOutcome::WarningSent);
        assert_eq!(third_receipt.notices.len(), 1);
    }

    #[test]
    fn a_warning_for_a_new_status_is_not_suppressed() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = express_errand();
        setup.store.put_errand(order.clone()).unwrap();

        let now = Utc::now();
        let (first, _) = run(&setup, &mut order, TimeoutState::PickupWarning, now);
        assert_eq!(first, RemediationOutcome::WarningSent);

        let (second, receipt) = run(
            &setup,
            &mut order,
            TimeoutState::DeliveryWarning,
            now + Duration::minutes(5),
        );
        assert_eq!(second, RemediationOutcome::WarningSent);
        assert_eq!(receipt.notices.len(), 1);
        let marker = setup
            .warnings
            .last_warning(OrderKind::Errand, 11)
            .unwrap()
            .unwrap();
        assert_eq!(marker.state, TimeoutState::DeliveryWarning);
    }

    #[test]
    fn express_delivery_timeout_escalates_on_the_first_strike() {
        let fees = FlatFeeSchedule::new().with_fee(
            OrderKind::Errand,
            TimeoutPhase::Delivery,
            dec!(5.00),
        );
        let setup = setup(fees);
        setup.store.set_pending_balance("courier-1", dec!(20.00)).unwrap();
        let mut order = express_errand()
            .with_status(OrderStatus::InTransit)
            .with_expected_delivery_at(Utc::now() - Duration::minutes(5));
        setup.store.put_errand(order.clone()).unwrap();

        let now = Utc::now();
        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::DeliveryTimeout, now);

        assert_eq!(outcome, RemediationOutcome::Escalated);
        assert_eq!(order.status(), OrderStatus::PlatformIntervention);
        assert_eq!(order.intervention_at(), Some(now));
        assert_eq!(order.timeout_count(), 1);
        assert_eq!(setup.store.pending_balance("courier-1").unwrap(), dec!(15.00));
        assert_eq!(receipt.events.len(), 1);
    }

    #[test]
    fn standard_delivery_timeouts_accumulate_before_escalating() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = ErrandOrder::new(
            12,
            "ER-2",
            "user-1",
            ErrandTier::Standard,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd"),
            dec!(8.00),
            Utc::now() - Duration::hours(4),
        )
        .with_courier("courier-1")
        .with_status(OrderStatus::InTransit)
        .with_expected_delivery_at(Utc::now() - Duration::hours(2));
        setup.store.put_errand(order.clone()).unwrap();

        let (outcome, _) = run(&setup, &mut order, TimeoutState::DeliveryTimeout, Utc::now());
        assert_eq!(outcome, RemediationOutcome::StrikeRecorded);
        assert_eq!(order.timeout_count(), 1);
        assert_eq!(order.status(), OrderStatus::InTransit);

        // Threshold 8: the strike that lands on 7 crosses threshold - 1.
        order.set_timeout_count(6);
        let now = Utc::now();
        let (outcome, _) = run(&setup, &mut order, TimeoutState::DeliveryTimeout, now);
        assert_eq!(outcome, RemediationOutcome::Escalated);
        assert_eq!(order.timeout_count(), 7);
        assert_eq!(order.status(), OrderStatus::PlatformIntervention);
    }

    #[test]
    fn shopping_confirmation_timeout_auto_completes() {
        let setup = setup(FlatFeeSchedule::new());
        let delivered = Utc::now() - Duration::hours(25);
        let mut order = shopping_assigned()
            .with_status(OrderStatus::Delivered)
            .with_delivered_at(delivered);
        setup.store.put_shopping(order.clone()).unwrap();

        let now = Utc::now();
        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::ConfirmTimeout, now);

        assert_eq!(outcome, RemediationOutcome::AutoCompleted);
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.completed_at(), Some(now));
        assert_eq!(order.timeout_count(), 1);
        assert_eq!(receipt.events.len(), 1);
        assert!(matches!(
            receipt.notices.last().map(|n| &n.recipient),
            Some(Recipient::Requester(_))
        ));
    }

    #[test]
    fn expired_unassigned_purchase_is_escalated_for_review() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = PurchaseOrder::new(
            13,
            "PU-1",
            "user-3",
            Address::new("88 Mall Ave"),
            Address::new("4 Hill Rd"),
            dec!(30.00),
            dec!(6.00),
            Utc::now() - Duration::hours(5),
        )
        .with_deadline(Utc::now() - Duration::hours(1));
        setup.store.put_purchase(order.clone()).unwrap();

        let (outcome, receipt) =
            run(&setup, &mut order, TimeoutState::ConfirmTimeout, Utc::now());

        assert_eq!(outcome, RemediationOutcome::Escalated);
        assert_eq!(order.status(), OrderStatus::PlatformIntervention);
        // Nobody was assigned, so the timeout counts against the requester.
        assert_eq!(receipt.events[0].user_id, "user-3");
    }

    #[test]
    fn normal_verdicts_do_nothing() {
        let setup = setup(FlatFeeSchedule::new());
        let mut order = express_errand();

        let mut unit = UnitOfWork::new("ER-1");
        let outcome = setup
            .handler
            .remediate(&mut unit, &mut order, &TimeoutVerdict::normal(), Utc::now())
            .unwrap();
        assert_eq!(outcome, RemediationOutcome::Noop);
        assert_eq!(unit.staged_writes(), 0);
    }
}
