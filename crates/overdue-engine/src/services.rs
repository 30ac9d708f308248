//! Per-kind implementations of the uniform service port.
//!
//! The remediation handler dispatches on an order's kind tag and talks
//! to exactly one of these. The lifecycle staging is shared; what
//! differs per kind is the redelivery window (tier-aware for errands)
//! and which transitions a kind permits at all.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use overdue_core::{errand_tier, OrderKind, OrderStatus, TimeoutRules, TimeoutState, Timeoutable};

use crate::archive::ArchiveService;
use crate::error::EngineError;
use crate::ports::KindService;
use crate::store::UnitOfWork;

fn ensure_kind(expected: OrderKind, order: &dyn Timeoutable) -> Result<(), EngineError> {
    if order.kind() == expected {
        Ok(())
    } else {
        Err(EngineError::Remediation(format!(
            "{} service asked to handle {} order {}",
            expected.as_str(),
            order.kind().as_str(),
            order.order_no()
        )))
    }
}

/// Put the order back in the assignment pool with a fresh delivery
/// promise and a clean slate, keeping the timeout counter.
fn stage_reset(
    unit: &mut UnitOfWork,
    order: &mut dyn Timeoutable,
    rules: &TimeoutRules,
    now: DateTime<Utc>,
) {
    let window = rules.redelivery_window(order.kind(), errand_tier(order));
    order.set_courier(None);
    order.set_status(OrderStatus::Pending);
    order.set_timeout_state(TimeoutState::Normal);
    order.set_warning_sent(false);
    order.set_expected_delivery_at(Some(now + window));
    unit.save_order(order);
}

fn stage_intervention(unit: &mut UnitOfWork, order: &mut dyn Timeoutable, now: DateTime<Utc>) {
    order.set_status(OrderStatus::PlatformIntervention);
    order.set_intervention_at(Some(now));
    unit.save_order(order);
}

fn stage_completion(unit: &mut UnitOfWork, order: &mut dyn Timeoutable, now: DateTime<Utc>) {
    order.set_status(OrderStatus::Completed);
    order.set_completed_at(Some(now));
    unit.save_order(order);
}

pub struct ErrandService {
    rules: Arc<TimeoutRules>,
    archive: Arc<ArchiveService>,
}

impl ErrandService {
    pub fn new(rules: Arc<TimeoutRules>, archive: Arc<ArchiveService>) -> Self {
        Self { rules, archive }
    }
}

impl KindService for ErrandService {
    fn kind(&self) -> OrderKind {
        OrderKind::Errand
    }

    fn reset_for_reassignment(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Errand, order)?;
        stage_reset(unit, order, &self.rules, now);
        Ok(())
    }

    fn archive(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Errand, order)?;
        self.archive.archive(unit, order, reason, now)
    }

    fn mark_intervention(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Errand, order)?;
        stage_intervention(unit, order, now);
        Ok(())
    }

    fn complete_automatically(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Errand, order)?;
        stage_completion(unit, order, now);
        Ok(())
    }

    fn save(&self, unit: &mut UnitOfWork, order: &dyn Timeoutable) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Errand, order)?;
        unit.save_order(order);
        Ok(())
    }
}

pub struct ShoppingService {
    rules: Arc<TimeoutRules>,
    archive: Arc<ArchiveService>,
}

impl ShoppingService {
    pub fn new(rules: Arc<TimeoutRules>, archive: Arc<ArchiveService>) -> Self {
        Self { rules, archive }
    }
}

impl KindService for ShoppingService {
    fn kind(&self) -> OrderKind {
        OrderKind::Shopping
    }

    fn reset_for_reassignment(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Shopping, order)?;
        stage_reset(unit, order, &self.rules, now);
        Ok(())
    }

    fn archive(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Shopping, order)?;
        self.archive.archive(unit, order, reason, now)
    }

    fn mark_intervention(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Shopping, order)?;
        stage_intervention(unit, order, now);
        Ok(())
    }

    fn complete_automatically(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Shopping, order)?;
        stage_completion(unit, order, now);
        Ok(())
    }

    fn save(&self, unit: &mut UnitOfWork, order: &dyn Timeoutable) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Shopping, order)?;
        unit.save_order(order);
        Ok(())
    }
}

pub struct PurchaseService {
    rules: Arc<TimeoutRules>,
    archive: Arc<ArchiveService>,
}

impl PurchaseService {
    pub fn new(rules: Arc<TimeoutRules>, archive: Arc<ArchiveService>) -> Self {
        Self { rules, archive }
    }
}

impl KindService for PurchaseService {
    fn kind(&self) -> OrderKind {
        OrderKind::Purchase
    }

    fn reset_for_reassignment(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Purchase, order)?;
        stage_reset(unit, order, &self.rules, now);
        Ok(())
    }

    fn archive(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Purchase, order)?;
        self.archive.archive(unit, order, reason, now)
    }

    fn mark_intervention(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Purchase, order)?;
        stage_intervention(unit, order, now);
        Ok(())
    }

    /// Purchases hold requester money against unlisted goods, so silence
    /// is settled by staff, never automatically.
    fn complete_automatically(
        &self,
        _unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        _now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Purchase, order)?;
        Err(EngineError::Remediation(format!(
            "purchase order {} cannot be auto-completed; it requires review",
            order.order_no()
        )))
    }

    fn save(&self, unit: &mut UnitOfWork, order: &dyn Timeoutable) -> Result<(), EngineError> {
        ensure_kind(OrderKind::Purchase, order)?;
        unit.save_order(order);
        Ok(())
    }
}

/// One service per kind, keyed for dispatch.
pub fn standard_registry(
    rules: Arc<TimeoutRules>,
    archive: Arc<ArchiveService>,
) -> HashMap<OrderKind, Arc<dyn KindService>> {
    let mut services: HashMap<OrderKind, Arc<dyn KindService>> = HashMap::new();
    services.insert(
        OrderKind::Errand,
        Arc::new(ErrandService::new(rules.clone(), archive.clone())),
    );
    services.insert(
        OrderKind::Shopping,
        Arc::new(ShoppingService::new(rules.clone(), archive.clone())),
    );
    services.insert(
        OrderKind::Purchase,
        Arc::new(PurchaseService::new(rules, archive)),
    );
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use overdue_core::{Address, ErrandOrder, ErrandTier, ShoppingOrder};
    use rust_decimal_macros::dec;

    fn rules() -> Arc<TimeoutRules> {
        Arc::new(TimeoutRules::default())
    }

    fn errand_service() -> ErrandService {
        ErrandService::new(rules(), Arc::new(ArchiveService::without_regions()))
    }

    fn express_errand() -> ErrandOrder {
        ErrandOrder::new(
            1,
            "ER-1",
            "user-1",
            ErrandTier::Express,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd"),
            dec!(8.00),
            Utc::now() - Duration::hours(2),
        )
        .with_courier("courier-1")
        .with_status(OrderStatus::Assigned)
        .with_timeout_count(2)
    }

    #[test]
    fn reset_returns_the_order_to_the_pool_with_a_fresh_promise() {
        let service = errand_service();
        let mut order = express_errand();
        order.set_timeout_state(TimeoutState::PickupTimeout);
        order.set_warning_sent(true);

        let now = Utc::now();
        let mut unit = UnitOfWork::new("ER-1");
        service
            .reset_for_reassignment(&mut unit, &mut order, now)
            .unwrap();

        assert_eq!(order.courier(), None);
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.timeout_state(), TimeoutState::Normal);
        assert!(!order.warning_sent());
        // Express tier promises its configured delivery window again.
        assert_eq!(
            order.expected_delivery_at(),
            Some(now + Duration::minutes(90))
        );
        // The strike history survives the reset.
        assert_eq!(order.timeout_count(), 2);
        assert_eq!(unit.staged_writes(), 1);
    }

    #[test]
    fn intervention_parks_the_order_and_stamps_the_time() {
        let service = errand_service();
        let mut order = express_errand();

        let now = Utc::now();
        let mut unit = UnitOfWork::new("ER-1");
        service.mark_intervention(&mut unit, &mut order, now).unwrap();

        assert_eq!(order.status(), OrderStatus::PlatformIntervention);
        assert_eq!(order.intervention_at(), Some(now));
    }

    #[test]
    fn shopping_completion_stamps_the_time() {
        let service =
            ShoppingService::new(rules(), Arc::new(ArchiveService::without_regions()));
        let mut order = ShoppingOrder::new(
            2,
            "SH-1",
            "user-2",
            "Corner Mart",
            Address::new("9 Market Sq"),
            Address::new("4 Hill Rd"),
            dec!(42.00),
            dec!(5.00),
            Utc::now(),
        )
        .with_courier("courier-2")
        .with_status(OrderStatus::Delivered);

        let now = Utc::now();
        let mut unit = UnitOfWork::new("SH-1");
        service
            .complete_automatically(&mut unit, &mut order, now)
            .unwrap();

        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.completed_at(), Some(now));
    }

    #[test]
    fn purchase_refuses_auto_completion() {
        let service =
            PurchaseService::new(rules(), Arc::new(ArchiveService::without_regions()));
        let mut order = overdue_core::PurchaseOrder::new(
            3,
            "PU-1",
            "user-3",
            Address::new("88 Mall Ave"),
            Address::new("4 Hill Rd"),
            dec!(30.00),
            dec!(6.00),
            Utc::now(),
        );

        let mut unit = UnitOfWork::new("PU-1");
        let err = service
            .complete_automatically(&mut unit, &mut order, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Remediation(_)));
    }

    #[test]
    fn services_reject_orders_of_a_foreign_kind() {
        let service = errand_service();
        let mut order = ShoppingOrder::new(
            2,
            "SH-1",
            "user-2",
            "Corner Mart",
            Address::new("9 Market Sq"),
            Address::new("4 Hill Rd"),
            dec!(42.00),
            dec!(5.00),
            Utc::now(),
        );

        let mut unit = UnitOfWork::new("SH-1");
        let err = service
            .reset_for_reassignment(&mut unit, &mut order, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Remediation(_)));
    }

    #[test]
    fn registry_covers_every_kind() {
        let registry = standard_registry(rules(), Arc::new(ArchiveService::without_regions()));
        for kind in [OrderKind::Errand, OrderKind::Shopping, OrderKind::Purchase] {
            assert_eq!(registry.get(&kind).map(|s| s.kind()), Some(kind));
        }
    }
}
