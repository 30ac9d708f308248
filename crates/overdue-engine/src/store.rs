//! Order, wallet, and archive storage behind one facade, plus the
//! per-order unit of work.
//!
//! Remediation never writes to storage directly. It stages writes on a
//! [`UnitOfWork`] and the sweep commits the whole batch through
//! [`MarketStore::apply`], which must be atomic: a penalty debit and the
//! status change it belongs to land together or not at all. Notices and
//! events queue on the same unit and are only released for delivery
//! after the batch committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use overdue_core::{ErrandOrder, OrderKind, OrderNo, PurchaseOrder, ShoppingOrder, Timeoutable};

use crate::archive::AbandonedOrder;
use crate::error::EngineError;
use crate::ports::{Notice, TimeoutEvent};

/// One movement out of a courier's pending balance into platform
/// income, kept as a journal line for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundsMove {
    pub courier: String,
    pub amount: Decimal,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A single write staged inside a unit of work.
#[derive(Clone, Debug)]
pub enum StagedWrite {
    /// Replace the stored order row with this state.
    SaveOrder(Box<dyn Timeoutable>),
    /// Debit the courier's pending balance and credit platform income.
    DebitPending(FundsMove),
    /// Create or refresh the abandoned snapshot for the order number.
    UpsertAbandoned(AbandonedOrder),
}

/// Everything one order's remediation wants to say and write, staged
/// until commit.
#[derive(Debug)]
pub struct UnitOfWork {
    order_no: OrderNo,
    writes: Vec<StagedWrite>,
    notices: Vec<Notice>,
    events: Vec<TimeoutEvent>,
}

impl UnitOfWork {
    pub fn new(order_no: impl Into<OrderNo>) -> Self {
        Self {
            order_no: order_no.into(),
            writes: Vec::new(),
            notices: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn order_no(&self) -> &str {
        &self.order_no
    }

    pub fn save_order(&mut self, order: &dyn Timeoutable) {
        self.writes.push(StagedWrite::SaveOrder(order.boxed_clone()));
    }

    pub fn debit_pending(
        &mut self,
        courier: impl Into<String>,
        amount: Decimal,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.writes.push(StagedWrite::DebitPending(FundsMove {
            courier: courier.into(),
            amount,
            reason: reason.into(),
            at,
        }));
    }

    pub fn upsert_abandoned(&mut self, snapshot: AbandonedOrder) {
        self.writes.push(StagedWrite::UpsertAbandoned(snapshot));
    }

    pub fn push_notice(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub fn push_event(&mut self, event: TimeoutEvent) {
        self.events.push(event);
    }

    pub fn staged_writes(&self) -> usize {
        self.writes.len()
    }

    /// Apply every staged write as one atomic batch. Messages are handed
    /// back only on success; a failed commit drops them with the writes.
    pub fn commit(self, store: &dyn MarketStore) -> Result<UnitReceipt, EngineError> {
        if !self.writes.is_empty() {
            store.apply(&self.order_no, self.writes)?;
        }
        Ok(UnitReceipt {
            notices: self.notices,
            events: self.events,
        })
    }
}

/// What a committed unit still owes the outside world.
#[derive(Debug, Default)]
pub struct UnitReceipt {
    pub notices: Vec<Notice>,
    pub events: Vec<TimeoutEvent>,
}

/// Facade over the three kind stores, courier wallets, and the archive.
pub trait MarketStore: Send + Sync {
    /// Every order whose status a sweep should examine, all kinds mixed.
    fn load_open_orders(&self) -> Result<Vec<Box<dyn Timeoutable>>, EngineError>;

    fn find_order(
        &self,
        kind: OrderKind,
        order_no: &str,
    ) -> Result<Option<Box<dyn Timeoutable>>, EngineError>;

    /// Apply one order's staged writes atomically.
    fn apply(&self, order_no: &str, writes: Vec<StagedWrite>) -> Result<(), EngineError>;

    fn pending_balance(&self, courier: &str) -> Result<Decimal, EngineError>;

    fn platform_income(&self) -> Result<Decimal, EngineError>;

    fn abandoned_order(&self, order_no: &str) -> Result<Option<AbandonedOrder>, EngineError>;
}

#[derive(Clone, Debug, Default)]
struct Inner {
    errands: HashMap<OrderNo, ErrandOrder>,
    shopping: HashMap<OrderNo, ShoppingOrder>,
    purchases: HashMap<OrderNo, PurchaseOrder>,
    wallets: HashMap<String, Decimal>,
    platform_income: Decimal,
    journal: Vec<FundsMove>,
    abandoned: HashMap<OrderNo, AbandonedOrder>,
}

/// In-process store.
///
/// `apply` stages against a copy of the state and swaps it in whole, so
/// a batch that fails half-way leaves nothing behind.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMarketStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_errand(&self, order: ErrandOrder) -> Result<(), EngineError> {
        let mut inner = self.lock_inner()?;
        inner.errands.insert(order.core.order_no.clone(), order);
        Ok(())
    }

    pub fn put_shopping(&self, order: ShoppingOrder) -> Result<(), EngineError> {
        let mut inner = self.lock_inner()?;
        inner.shopping.insert(order.core.order_no.clone(), order);
        Ok(())
    }

    pub fn put_purchase(&self, order: PurchaseOrder) -> Result<(), EngineError> {
        let mut inner = self.lock_inner()?;
        inner.purchases.insert(order.core.order_no.clone(), order);
        Ok(())
    }

    pub fn set_pending_balance(
        &self,
        courier: impl Into<String>,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock_inner()?;
        inner.wallets.insert(courier.into(), amount);
        Ok(())
    }

    pub fn journal(&self) -> Result<Vec<FundsMove>, EngineError> {
        Ok(self.lock_inner()?.journal.clone())
    }

    pub fn abandoned_count(&self) -> Result<usize, EngineError> {
        Ok(self.lock_inner()?.abandoned.len())
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, Inner>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Store("market store poisoned".to_string()))
    }
}

impl MarketStore for InMemoryMarketStore {
    fn load_open_orders(&self) -> Result<Vec<Box<dyn Timeoutable>>, EngineError> {
        let inner = self.lock_inner()?;
        let mut open: Vec<Box<dyn Timeoutable>> = Vec::new();
        open.extend(
            inner
                .errands
                .values()
                .filter(|order| order.status().is_open())
                .map(|order| order.boxed_clone()),
        );
        open.extend(
            inner
                .shopping
                .values()
                .filter(|order| order.status().is_open())
                .map(|order| order.boxed_clone()),
        );
        open.extend(
            inner
                .purchases
                .values()
                .filter(|order| order.status().is_open())
                .map(|order| order.boxed_clone()),
        );
        Ok(open)
    }

    fn find_order(
        &self,
        kind: OrderKind,
        order_no: &str,
    ) -> Result<Option<Box<dyn Timeoutable>>, EngineError> {
        let inner = self.lock_inner()?;
        Ok(match kind {
            OrderKind::Errand => inner.errands.get(order_no).map(|o| o.boxed_clone()),
            OrderKind::Shopping => inner.shopping.get(order_no).map(|o| o.boxed_clone()),
            OrderKind::Purchase => inner.purchases.get(order_no).map(|o| o.boxed_clone()),
        })
    }

    fn apply(&self, order_no: &str, writes: Vec<StagedWrite>) -> Result<(), EngineError> {
        let mut inner = self.lock_inner()?;
        let mut draft = inner.clone();
        for write in writes {
            apply_write(&mut draft, order_no, write)?;
        }
        *inner = draft;
        Ok(())
    }

    fn pending_balance(&self, courier: &str) -> Result<Decimal, EngineError> {
        let inner = self.lock_inner()?;
        Ok(inner.wallets.get(courier).copied().unwrap_or(Decimal::ZERO))
    }

    fn platform_income(&self) -> Result<Decimal, EngineError> {
        Ok(self.lock_inner()?.platform_income)
    }

    fn abandoned_order(&self, order_no: &str) -> Result<Option<AbandonedOrder>, EngineError> {
        let inner = self.lock_inner()?;
        Ok(inner.abandoned.get(order_no).cloned())
    }
}

fn apply_write(inner: &mut Inner, unit_order: &str, write: StagedWrite) -> Result<(), EngineError> {
    match write {
        StagedWrite::SaveOrder(order) => {
            if order.order_no() != unit_order {
                return Err(EngineError::Store(format!(
                    "unit of work for {unit_order} staged a write for {}",
                    order.order_no()
                )));
            }
            match order.kind() {
                OrderKind::Errand => {
                    let errand = downcast_owned::<ErrandOrder>(&order)?;
                    inner.errands.insert(errand.core.order_no.clone(), errand);
                }
                OrderKind::Shopping => {
                    let shopping = downcast_owned::<ShoppingOrder>(&order)?;
                    inner.shopping.insert(shopping.core.order_no.clone(), shopping);
                }
                OrderKind::Purchase => {
                    let purchase = downcast_owned::<PurchaseOrder>(&order)?;
                    inner.purchases.insert(purchase.core.order_no.clone(), purchase);
                }
            }
        }
        StagedWrite::DebitPending(movement) => {
            let balance = inner
                .wallets
                .entry(movement.courier.clone())
                .or_insert(Decimal::ZERO);
            *balance -= movement.amount;
            inner.platform_income += movement.amount;
            inner.journal.push(movement);
        }
        StagedWrite::UpsertAbandoned(snapshot) => {
            if snapshot.order_no != unit_order {
                return Err(EngineError::Store(format!(
                    "unit of work for {unit_order} staged a snapshot for {}",
                    snapshot.order_no
                )));
            }
            inner.abandoned.insert(snapshot.order_no.clone(), snapshot);
        }
    }
    Ok(())
}

pub(crate) fn downcast_owned<T: Clone + 'static>(
    order: &Box<dyn Timeoutable>,
) -> Result<T, EngineError> {
    order
        .as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| {
            EngineError::Store(format!(
                "order {} does not match its declared kind {:?}",
                order.order_no(),
                order.kind()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::AbandonedOrder;
    use crate::ports::NoticeCategory;
    use chrono::Utc;
    use overdue_core::{Address, ErrandTier, OrderStatus, TimeoutState};
    use rust_decimal_macros::dec;

    fn errand(order_no: &str) -> ErrandOrder {
        ErrandOrder::new(
            1,
            order_no,
            "user-1",
            ErrandTier::Standard,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd"),
            dec!(8.00),
            Utc::now(),
        )
    }

    fn snapshot(order_no: &str, reason: &str) -> AbandonedOrder {
        AbandonedOrder::draft(&errand(order_no), reason, Utc::now())
    }

    #[test]
    fn staging_without_commit_touches_nothing() {
        let store = InMemoryMarketStore::new();
        store.put_errand(errand("ER-1")).unwrap();

        let mut unit = UnitOfWork::new("ER-1");
        let mut changed = errand("ER-1");
        changed.set_status(OrderStatus::Cancelled);
        unit.save_order(&changed);
        unit.debit_pending("courier-1", dec!(2.00), "late pickup", Utc::now());
        drop(unit);

        let stored = store.find_order(OrderKind::Errand, "ER-1").unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Pending);
        assert_eq!(store.pending_balance("courier-1").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn commit_applies_writes_and_releases_messages() {
        let store = InMemoryMarketStore::new();
        store.put_errand(errand("ER-1")).unwrap();
        store.set_pending_balance("courier-1", dec!(10.00)).unwrap();

        let mut unit = UnitOfWork::new("ER-1");
        let mut changed = errand("ER-1");
        changed.set_timeout_state(TimeoutState::PickupTimeout);
        changed.set_timeout_count(1);
        unit.save_order(&changed);
        unit.debit_pending("courier-1", dec!(2.00), "late pickup", Utc::now());
        unit.push_notice(Notice::to_courier(
            "courier-1",
            NoticeCategory::TimeoutPenalty,
            "pickup ran late",
        ));

        let receipt = unit.commit(&store).unwrap();
        assert_eq!(receipt.notices.len(), 1);

        let stored = store.find_order(OrderKind::Errand, "ER-1").unwrap().unwrap();
        assert_eq!(stored.timeout_count(), 1);
        assert_eq!(store.pending_balance("courier-1").unwrap(), dec!(8.00));
        assert_eq!(store.platform_income().unwrap(), dec!(2.00));
        assert_eq!(store.journal().unwrap().len(), 1);
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let store = InMemoryMarketStore::new();
        store.put_errand(errand("ER-1")).unwrap();
        store.set_pending_balance("courier-1", dec!(10.00)).unwrap();

        // The second write belongs to a different order, so the whole
        // batch must be rejected, including the debit before it.
        let writes = vec![
            StagedWrite::DebitPending(FundsMove {
                courier: "courier-1".to_string(),
                amount: dec!(2.00),
                reason: "late pickup".to_string(),
                at: Utc::now(),
            }),
            StagedWrite::SaveOrder(errand("ER-2").boxed_clone()),
        ];
        let err = store.apply("ER-1", writes).unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));

        assert_eq!(store.pending_balance("courier-1").unwrap(), dec!(10.00));
        assert_eq!(store.platform_income().unwrap(), Decimal::ZERO);
        assert!(store.journal().unwrap().is_empty());
    }

    #[test]
    fn open_orders_exclude_terminal_and_parked_rows() {
        let store = InMemoryMarketStore::new();
        store.put_errand(errand("ER-1")).unwrap();
        store
            .put_errand(errand("ER-2").with_status(OrderStatus::Completed))
            .unwrap();
        store
            .put_errand(errand("ER-3").with_status(OrderStatus::Cancelled))
            .unwrap();
        store
            .put_errand(errand("ER-4").with_status(OrderStatus::PlatformIntervention))
            .unwrap();

        let open = store.load_open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_no(), "ER-1");
    }

    #[test]
    fn repeated_snapshot_upserts_keep_one_record() {
        let store = InMemoryMarketStore::new();

        store
            .apply(
                "ER-1",
                vec![StagedWrite::UpsertAbandoned(snapshot("ER-1", "first"))],
            )
            .unwrap();
        store
            .apply(
                "ER-1",
                vec![StagedWrite::UpsertAbandoned(snapshot("ER-1", "second"))],
            )
            .unwrap();

        assert_eq!(store.abandoned_count().unwrap(), 1);
        let stored = store.abandoned_order("ER-1").unwrap().unwrap();
        assert_eq!(stored.reason, "second");
    }

    #[test]
    fn empty_unit_commits_without_store_calls() {
        let store = InMemoryMarketStore::new();
        let receipt = UnitOfWork::new("ER-404").commit(&store).unwrap();
        assert!(receipt.notices.is_empty());
        assert!(receipt.events.is_empty());
    }
}
